//! Validating candidate requirements against the wheel's own METADATA.
//!
//! The index-side `requires_dist` is populated from whichever artifact the index
//! processed first and is occasionally missing or platform-narrow, e.g. a
//! `manylinux2014_aarch64` torch wheel that lacks the x86-only CUDA requirements.
//! The METADATA inside the wheel is authoritative, so after the resolution has
//! converged on the fast index data every candidate gets a second pass here.
//! Range-request METADATA reads are expensive per request, which is why this step
//! does not run earlier, where candidates may still be replaced cheaply.

use super::state::State;
use super::ResolveError;
use crate::index::RegistryClient;
use crate::types::{ArtifactInfo, NormalizedPackageName};
use indexmap::IndexSet;
use itertools::Itertools;
use pep440_rs::Version;
use pep508_rs::Requirement;

/// For every candidate whose requirements are not yet credible and that ships at
/// least one wheel, read the METADATA of the first wheel and reconcile it with what
/// the index claimed. Reads happen in parallel; per-candidate failures remove the
/// version rather than aborting the resolution.
pub(crate) async fn validate_wheel_metadata(
    state: &mut State,
    index: &dyn RegistryClient,
) -> Result<(), ResolveError> {
    let mut query: Vec<(NormalizedPackageName, Version, ArtifactInfo)> = Vec::new();
    for (name, (version, _extras)) in state.candidates.iter() {
        if state
            .requirements_credible
            .contains(&(name.clone(), version.clone()))
        {
            continue;
        }
        let Some(files) = state
            .versions_cache
            .get(name)
            .and_then(|releases| releases.get(version))
        else {
            continue;
        };
        if let Some(wheel) = files.iter().find(|file| file.is_wheel()) {
            query.push((name.clone(), version.clone(), wheel.clone()));
        }
    }

    if query.is_empty() {
        return Ok(());
    }
    tracing::info!("validating wheel metadata for {} candidate(s)", query.len());

    let results = futures::future::join_all(
        query
            .iter()
            .map(|(name, version, file)| index.get_wheel_metadata(name, version, file)),
    )
    .await;

    for ((name, version, file), result) in query.into_iter().zip(results) {
        let metadata = match result {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(
                    "failed to read METADATA for {name} {version} from {}, \
                     removing it from the selection: {err}",
                    file.url
                );
                if let Some(releases) = state.versions_cache.get_mut(&name) {
                    releases.shift_remove(&version);
                }
                state.push_unique(name);
                continue;
            }
        };

        let new_requirements = metadata.requires_dist;
        let old_requirements = state
            .requirements
            .get(&(name.clone(), version.clone()))
            .cloned()
            .unwrap_or_default();
        state
            .requirements_credible
            .insert((name.clone(), version.clone()));

        let old_set: IndexSet<&Requirement> = old_requirements.iter().collect();
        let new_set: IndexSet<&Requirement> = new_requirements.iter().collect();
        if old_set == new_set {
            continue;
        }

        if old_requirements.is_empty() {
            tracing::debug!("missing requires_dist index metadata for {name} {version}");
        } else {
            tracing::warn!(
                "diverging requires_dist metadata for {name} {version}:\n\
                 index json api: [{}]\n\
                 wheel metadata: [{}]",
                old_requirements.iter().map(ToString::to_string).join(", "),
                new_requirements.iter().map(ToString::to_string).join(", ")
            );
        }

        // Every package an edge appeared at or disappeared from needs reevaluation
        for requirement in old_set.symmetric_difference(&new_set) {
            state.push_unless_pending(NormalizedPackageName::from_raw(&requirement.name));
        }

        state
            .requirements
            .insert((name.clone(), version.clone()), new_requirements);
        state
            .changed_metadata
            .insert((name.clone(), version.clone()), old_requirements);
        state.push_unique(name);
    }

    Ok(())
}
