//! The gating build step for candidates whose release ships no wheel.

use super::state::State;
use super::ResolveError;
use crate::sdist::SdistBuilder;
use crate::types::{ArtifactInfo, NormalizedPackageName};
use pep440_rs::Version;

/// Build every candidate that has no wheel and no completed build yet, in parallel,
/// and feed the resulting authoritative requirements back into the state. Returns
/// whether any build ran, i.e. whether the caller has to do another inner pass.
///
/// A release without a wheel must consist of exactly one file, its sdist; anything
/// else makes the choice of what to build ambiguous and is a fatal error.
pub(crate) async fn build_missing_sdists(
    state: &mut State,
    builder: &dyn SdistBuilder,
) -> Result<bool, ResolveError> {
    let mut pending: Vec<(NormalizedPackageName, Version, ArtifactInfo)> = Vec::new();
    for (name, (version, _extras)) in state.candidates.iter() {
        if state
            .resolved_sdists
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
        if files.iter().any(|file| file.is_wheel()) {
            continue;
        }
        match files.as_slice() {
            [sdist] => pending.push((name.clone(), version.clone(), sdist.clone())),
            _ => {
                return Err(ResolveError::AmbiguousSdist {
                    name: name.clone(),
                    version: version.clone(),
                    files: files.iter().map(|file| file.filename.clone()).collect(),
                })
            }
        }
    }

    if pending.is_empty() {
        return Ok(false);
    }

    tracing::info!(
        "building {:?}",
        pending
            .iter()
            .map(|(name, version, _file)| format!("{name} {version}"))
            .collect::<Vec<_>>()
    );

    let metadatas = futures::future::try_join_all(
        pending.iter().map(|(_, _, file)| builder.build_sdist(file)),
    )
    .await?;

    for ((name, version, _file), metadata) in pending.into_iter().zip(metadatas) {
        let old_requirements = state
            .requirements
            .get(&(name.clone(), version.clone()))
            .cloned()
            .unwrap_or_default();

        for requirement in &metadata.requires_dist {
            state.push_unless_pending(NormalizedPackageName::from_raw(&requirement.name));
        }

        state
            .display_names
            .entry(name.clone())
            .or_insert_with(|| metadata.name.as_source_str().to_string());
        state
            .requirements
            .insert((name.clone(), version.clone()), metadata.requires_dist);
        state
            .requirements_credible
            .insert((name.clone(), version.clone()));
        state
            .changed_metadata
            .insert((name.clone(), version.clone()), old_requirements);
        state.resolved_sdists.insert((name.clone(), version.clone()));
        state.push_unique(name);
    }

    Ok(true)
}
