//! Batched fetching of release lists and per-version metadata.
//!
//! Sequential per-package requests would multiply wall-clock latency by the size of
//! the transitive requirement set; coalescing everything the inner queue produced
//! into one parallel round is the chief source of the resolver's speed.

use super::state::State;
use super::ResolveError;
use crate::index::RegistryClient;
use crate::reqparse::parse_requirement_fixup;
use crate::types::NormalizedPackageName;
use pep440_rs::Version;
use pep508_rs::Requirement;

/// Fan out all pending release-list and per-version metadata requests, join the
/// results into the state and queue the affected packages for re-evaluation. Both
/// sets of pending fetches are cleared.
pub(crate) async fn fetch_versions_and_metadata(
    state: &mut State,
    index: &dyn RegistryClient,
) -> Result<(), ResolveError> {
    tracing::info!(
        "fetching versions for {} project(s) and metadata for {} version(s)",
        state.fetch_versions.len(),
        state.fetch_metadata.len()
    );

    // Both iteration orders are sorted, making the request order deterministic.
    let names: Vec<NormalizedPackageName> = state.fetch_versions.iter().cloned().collect();
    let releases =
        futures::future::try_join_all(names.iter().map(|name| index.get_releases(name))).await?;
    for (name, releases) in names.iter().zip(releases) {
        state.versions_cache.insert(name.clone(), releases);
    }
    // We got the information we delayed on, now actually compute candidate versions
    for name in std::mem::take(&mut state.fetch_versions) {
        state.push_unique(name);
    }

    let pending: Vec<(NormalizedPackageName, Version)> = state
        .fetch_metadata
        .iter()
        .map(|(name, version)| (name.clone(), version.clone()))
        .collect();
    let metadatas = futures::future::try_join_all(
        pending
            .iter()
            .map(|(name, version)| index.get_metadata(name, version)),
    )
    .await?;

    for ((name, version), metadata) in pending.iter().zip(metadatas) {
        state
            .display_names
            .entry(name.clone())
            .or_insert_with(|| metadata.name.clone());

        match parse_requires_dist(name, version, metadata.requires_dist.unwrap_or_default()) {
            Ok(requirements) => {
                state
                    .requirements
                    .insert((name.clone(), version.clone()), requirements);
            }
            Err(err) => {
                tracing::warn!(
                    "invalid requirements for {name} {version}, skipping this release: {err}"
                );
                // Take this version out of the rotation and reselect against the
                // smaller version set
                if let Some(releases) = state.versions_cache.get_mut(name) {
                    releases.shift_remove(version);
                }
                state.push_unique(name.clone());
            }
        }
    }
    // Propagate the fetched requirements through their packages
    for (name, _version) in std::mem::take(&mut state.fetch_metadata) {
        state.push_unique(name);
    }

    Ok(())
}

fn parse_requires_dist(
    name: &NormalizedPackageName,
    version: &Version,
    requires_dist: Vec<String>,
) -> Result<Vec<Requirement>, pep508_rs::Pep508Error> {
    let debug_source = format!("{name} {version}");
    requires_dist
        .iter()
        .map(|raw| parse_requirement_fixup(raw, Some(&debug_source)))
        .collect()
}
