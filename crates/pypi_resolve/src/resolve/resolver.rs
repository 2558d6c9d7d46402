//! The queue-driven candidate selection loop.
//!
//! Resolution is a graph walking procedure: for each package we visit we compute the
//! outgoing edges (`requires_dist`) from the incoming edge information (version
//! constraints and activated extras); the roots are the user input. Every package
//! whose incoming edges change is marked for revisiting. Because translating a
//! package's inputs to outputs sometimes has to wait for the network (or worse, an
//! sdist build), the loop collects as many delayed packages as possible and queries
//! them in one parallel round when the queue drains:
//!
//! 1. release lists and per-version metadata (fast, [`super::fetch`]),
//! 2. wheel METADATA validation ([`super::wheel_metadata`]),
//! 3. sdist builds (slow, [`super::sdists`]).
//!
//! Any stage producing new work restarts the inner queue pass; the loop terminates
//! when a full pass through all three produces nothing.

use super::fetch::fetch_versions_and_metadata;
use super::resolution::{ReleaseData, Resolution};
use super::sdists::build_missing_sdists;
use super::state::{Edge, Source, State};
use super::wheel_metadata::validate_wheel_metadata;
use super::{ResolveError, ResolveOptions};
use crate::index::RegistryClient;
use crate::sdist::SdistBuilder;
use crate::types::{NormalizedPackageName, PackageName};
use indexmap::IndexSet;
use itertools::Itertools;
use pep440_rs::Version;
use pep508_rs::{Requirement, VersionOrUrl};
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

pub(crate) struct Resolver<'a> {
    state: State,
    index: &'a dyn RegistryClient,
    builder: &'a dyn SdistBuilder,
    options: &'a ResolveOptions,
    /// The interpreter versions the resolution has to cover, derived from the
    /// `requires_python` input.
    python_versions: Vec<Version>,
    roots: Vec<Requirement>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        roots: Vec<Requirement>,
        python_versions: Vec<Version>,
        index: &'a dyn RegistryClient,
        builder: &'a dyn SdistBuilder,
        options: &'a ResolveOptions,
    ) -> Self {
        Self {
            state: State::new(&roots),
            index,
            builder,
            options,
            python_versions,
            roots,
        }
    }

    pub async fn run(mut self) -> Result<Resolution, ResolveError> {
        loop {
            while let Some(name) = self.state.queue.pop_front() {
                self.update_single_package(&name)?;
            }

            tracing::debug!(
                "candidates: {}",
                self.state
                    .candidates
                    .iter()
                    .map(|(name, (version, extras))| {
                        if extras.is_empty() {
                            format!("{name}=={version}")
                        } else {
                            format!("{name}[{}]=={version}", extras.iter().join(","))
                        }
                    })
                    .join(" ")
            );

            if !self.state.fetch_versions.is_empty() || !self.state.fetch_metadata.is_empty() {
                fetch_versions_and_metadata(&mut self.state, self.index).await?;
                // Make the processing order, and with it logs and error messages,
                // stable across runs
                self.state.sort_queue();
                continue;
            }

            // Everything the fast data can tell us is in; check the wheels' own
            // METADATA before committing to the index's claims
            if self.options.download_wheels {
                validate_wheel_metadata(&mut self.state, self.index).await?;
                if !self.state.queue.is_empty() {
                    self.state.sort_queue();
                    continue;
                }
            }

            // Only the slow path is left; once it stops producing work we are done
            if build_missing_sdists(&mut self.state, self.builder).await? {
                self.state.sort_queue();
                continue;
            }

            break;
        }

        Ok(self.finish())
    }

    /// Recompute the candidate of one package from its incoming edges and propagate
    /// the change of its outgoing edges through the reverse index.
    fn update_single_package(&mut self, name: &NormalizedPackageName) -> Result<(), ResolveError> {
        tracing::trace!("processing {name}");

        // The release list for this package is already requested, nothing to do
        // until it arrives
        if self.state.fetch_versions.contains(name) {
            return Ok(());
        }
        // First time we see this package
        if !self.state.versions_cache.contains_key(name) {
            tracing::debug!("missing versions for {name}, delaying");
            self.state.fetch_versions.insert(name.clone());
            return Ok(());
        }

        let (new_version, new_extras) = match self.select_version(name) {
            Some(selected) => selected,
            None => {
                return Err(self.no_compatible_version(name));
            }
        };

        let old_candidate = self.state.candidates.get(name).cloned();
        let candidate_key = (name.clone(), new_version.clone());
        if let Some((old_version, old_extras)) = &old_candidate {
            if *old_version == new_version
                && *old_extras == new_extras
                && !self.state.changed_metadata.contains_key(&candidate_key)
            {
                tracing::trace!("no changes for {name}");
                return Ok(());
            }
        }
        match &old_candidate {
            Some((old_version, old_extras)) => tracing::debug!(
                "picking {name} {new_version} {new_extras:?} over {old_version} {old_extras:?}"
            ),
            None => tracing::debug!("picking {name} {new_version} {new_extras:?}"),
        }

        // Do we actually know the requires_dist for this new candidate? If a
        // previous iteration chose a different version to fetch, overwrite it, the
        // metadata would be useless by now.
        if !self.state.requirements.contains_key(&candidate_key) {
            tracing::debug!("missing metadata for {name} {new_version}, delaying");
            self.state
                .fetch_metadata
                .insert(name.clone(), new_version);
            return Ok(());
        }

        // Update the reverse index: remove the live edges the old candidate
        // contributed, insert the live edges of the new one. Liveness is evaluated
        // with the same predicate on both sides so edges that were never applied do
        // not produce spurious diffs.
        let old_live: IndexSet<Requirement> = match &old_candidate {
            Some((old_version, old_extras)) => {
                let old_key = (name.clone(), old_version.clone());
                // If the metadata of the old candidate was overwritten in the
                // meantime, the edges to remove are the superseded ones
                let old_requirements = self
                    .state
                    .changed_metadata
                    .get(&old_key)
                    .or_else(|| self.state.requirements.get(&old_key))
                    .cloned()
                    .unwrap_or_default();
                self.live_requirements(&old_requirements, old_extras)
            }
            None => IndexSet::new(),
        };
        let new_live: IndexSet<Requirement> = {
            let new_requirements = self.state.requirements[&candidate_key].clone();
            self.live_requirements(&new_requirements, &new_extras)
        };

        if let Some((old_version, _)) = &old_candidate {
            let old_source: Source = (name.clone(), old_version.clone());
            for requirement in &old_live {
                let target = NormalizedPackageName::from_raw(&requirement.name);
                if let Some(edges) = self.state.requirements_per_package.get_mut(&target) {
                    // For a release whose edges were superseded before ever being
                    // applied (sdists resolve with no requirements first), there is
                    // nothing to remove
                    edges.shift_remove(&(requirement.clone(), old_source.clone()));
                }
            }
        }
        let new_source: Source = (name.clone(), new_version.clone());
        for requirement in &new_live {
            let target = NormalizedPackageName::from_raw(&requirement.name);
            self.state
                .requirements_per_package
                .entry(target)
                .or_default()
                .insert((requirement.clone(), new_source.clone()));
        }

        // Queue the packages whose incoming edges actually changed. Packages whose
        // release list is still outstanding are skipped, re-evaluating them now
        // cannot make progress.
        for changed in old_live.symmetric_difference(&new_live) {
            let target = NormalizedPackageName::from_raw(&changed.name);
            tracing::trace!("queuing {target}");
            self.state.push_unless_pending(target);
        }

        self.state
            .candidates
            .insert(name.clone(), (new_version, new_extras));
        self.state.changed_metadata.remove(&candidate_key);
        Ok(())
    }

    /// Apply all incoming requirements and find the best possible version, together
    /// with the union of the extras the incoming edges request. `None` means
    /// conflict.
    fn select_version(&self, name: &NormalizedPackageName) -> Option<(Version, BTreeSet<String>)> {
        let releases = &self.state.versions_cache[name];
        let incoming = self.state.incoming(name);

        let mut extras = BTreeSet::new();
        for (requirement, _source) in incoming {
            extras.extend(requirement.extras.iter().flatten().cloned());
        }

        let allowed_prereleases = allowed_prereleases(incoming, releases.keys());

        let versions: Vec<&Version> = if self.options.maximum_versions {
            releases.keys().collect()
        } else {
            releases.keys().rev().collect()
        };
        for version in versions {
            if version.any_prerelease() && !allowed_prereleases.contains(&version.release) {
                continue;
            }
            let mut is_compatible = true;
            'incoming: for (requirement, _source) in incoming {
                // URL requirements cannot constrain a registry version; they are
                // outside this resolver's sources and rejected at the root
                if let Some(VersionOrUrl::VersionSpecifier(specifiers)) =
                    &requirement.version_or_url
                {
                    for specifier in specifiers.iter() {
                        if !specifier.contains(version) {
                            is_compatible = false;
                            break 'incoming;
                        }
                    }
                }
            }
            if is_compatible {
                return Some((version.clone(), extras));
            }
        }
        None
    }

    /// The requirements of a release that can possibly apply given the active extras
    /// and the configured interpreter range.
    fn live_requirements(
        &self,
        requirements: &[Requirement],
        extras: &BTreeSet<String>,
    ) -> IndexSet<Requirement> {
        let extras: HashSet<String> = extras.iter().cloned().collect();
        requirements
            .iter()
            .filter(|requirement| {
                requirement
                    .evaluate_extras_and_python_version(extras.clone(), self.python_versions.clone())
            })
            .cloned()
            .collect()
    }

    fn no_compatible_version(&self, name: &NormalizedPackageName) -> ResolveError {
        let incoming = self.state.incoming(name);
        let mut constraints: Vec<String> = incoming
            .iter()
            .map(|(requirement, (source_name, source_version))| {
                format!("`{requirement}` from {source_name} {source_version}")
            })
            .collect();
        constraints.sort();
        let mut versions: Vec<Version> =
            self.state.versions_cache[name].keys().cloned().collect();
        versions.sort();
        ResolveError::NoCompatibleVersion {
            name: name.clone(),
            constraints,
            versions,
        }
    }

    /// Assemble the resolution from the converged state.
    fn finish(self) -> Resolution {
        let mut packages = indexmap::IndexMap::new();
        for (name, (version, extras)) in &self.state.candidates {
            let display_name = self
                .state
                .display_names
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.as_str().to_string());
            let display_name = PackageName::from_str(&display_name)
                .unwrap_or_else(|_| name.clone().into());
            let requirements = self
                .state
                .requirements
                .get(&(name.clone(), version.clone()))
                .cloned()
                .unwrap_or_default();
            let files = self
                .state
                .versions_cache
                .get(name)
                .and_then(|releases| releases.get(version))
                .cloned()
                .unwrap_or_default();
            packages.insert(
                (name.clone(), version.clone()),
                ReleaseData {
                    name: display_name,
                    requirements,
                    files,
                    extras: extras.clone(),
                },
            );
        }
        Resolution {
            roots: self.roots,
            packages,
        }
    }
}

/// The prerelease versions that may be selected, as a set of `release` tuples.
///
/// A prerelease is only acceptable when every incoming requirement explicitly names
/// its release in a prerelease-bearing specifier clause, so the result is the
/// intersection over the incoming edges. A requirement without a specifier, or whose
/// specifier names no prerelease, vetoes all of them. The exception is a package that
/// only ever published prereleases; it must still be resolvable, so every present
/// release tuple is allowed.
fn allowed_prereleases<'v>(
    incoming: &IndexSet<Edge>,
    versions: impl Iterator<Item = &'v Version> + Clone,
) -> HashSet<Vec<u64>> {
    if versions.clone().next().is_some() && versions.clone().all(Version::any_prerelease) {
        return versions.map(|version| version.release.clone()).collect();
    }

    let mut allowed: Option<HashSet<Vec<u64>>> = None;
    for (requirement, _source) in incoming {
        let Some(VersionOrUrl::VersionSpecifier(specifiers)) = &requirement.version_or_url else {
            return HashSet::new();
        };
        let prerelease_clauses: HashSet<Vec<u64>> = specifiers
            .iter()
            .filter(|specifier| specifier.version().any_prerelease())
            .map(|specifier| specifier.version().release.clone())
            .collect();
        if prerelease_clauses.is_empty() {
            return HashSet::new();
        }
        allowed = Some(match allowed {
            None => prerelease_clauses,
            Some(previous) => previous
                .intersection(&prerelease_clauses)
                .cloned()
                .collect(),
        });
    }
    allowed.unwrap_or_default()
}

/// The interpreter versions a `requires_python` specifier covers: all minor versions
/// of the 3.x series plus 4.0, filtered by the specifier.
pub(crate) fn target_python_versions(requires_python: &pep440_rs::VersionSpecifiers) -> Vec<Version> {
    const MINIMUM_PYTHON_MINOR: usize = 7;
    (MINIMUM_PYTHON_MINOR..100)
        .map(|minor| {
            Version::from_str(&format!("3.{minor}")).expect("python versions always parse")
        })
        .chain(std::iter::once(
            Version::from_str("4.0").expect("python versions always parse"),
        ))
        .filter(|version| requires_python.contains(version))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resolve::state::root_source as test_root_source;
    use pep440_rs::VersionSpecifiers;

    fn edge(requirement: &str) -> Edge {
        (
            Requirement::from_str(requirement).unwrap(),
            test_root_source(),
        )
    }

    fn versions(raw: &[&str]) -> Vec<Version> {
        raw.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[test]
    fn test_prereleases_require_consensus() {
        let stable_and_pre = versions(&["1.0", "1.1a1"]);

        // No specifier at all vetoes prereleases
        let incoming: IndexSet<Edge> = [edge("foo")].into_iter().collect();
        assert!(allowed_prereleases(&incoming, stable_and_pre.iter()).is_empty());

        // A specifier without prerelease clauses vetoes them too
        let incoming: IndexSet<Edge> = [edge("foo >=1.0")].into_iter().collect();
        assert!(allowed_prereleases(&incoming, stable_and_pre.iter()).is_empty());

        // A prerelease-bearing clause allows exactly its release tuple
        let incoming: IndexSet<Edge> = [edge("foo >=1.1a1")].into_iter().collect();
        let allowed = allowed_prereleases(&incoming, stable_and_pre.iter());
        assert_eq!(allowed, HashSet::from([vec![1, 1]]));

        // Intersection over all incoming edges
        let incoming: IndexSet<Edge> =
            [edge("foo >=1.1a1"), edge("foo <=1.2b1")].into_iter().collect();
        let allowed = allowed_prereleases(&incoming, stable_and_pre.iter());
        assert!(allowed.is_empty());
    }

    #[test]
    fn test_prerelease_only_package() {
        let only_pre = versions(&["1.0a1", "1.1b2"]);
        let incoming: IndexSet<Edge> = [edge("foo")].into_iter().collect();
        let allowed = allowed_prereleases(&incoming, only_pre.iter());
        assert_eq!(allowed, HashSet::from([vec![1, 0], vec![1, 1]]));
    }

    #[test]
    fn test_target_python_versions() {
        let requires_python = VersionSpecifiers::from_str(">=3.8,<3.11").unwrap();
        let targets = target_python_versions(&requires_python);
        assert_eq!(targets, versions(&["3.8", "3.9", "3.10"]));

        let requires_python = VersionSpecifiers::from_str(">=3.99").unwrap();
        let targets = target_python_versions(&requires_python);
        assert_eq!(targets, versions(&["3.99", "4.0"]));
    }
}
