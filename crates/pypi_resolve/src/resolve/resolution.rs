use crate::types::{ArtifactInfo, NormalizedPackageName, PackageName};
use indexmap::{IndexMap, IndexSet};
use pep440_rs::Version;
use pep508_rs::{MarkerEnvironment, Requirement};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;

/// Everything the resolver locked down for one release.
#[derive(Debug, Clone)]
pub struct ReleaseData {
    /// The package name in the spelling the index metadata reports, e.g. `Django`.
    pub name: PackageName,
    /// The outgoing requirement edges of this release.
    pub requirements: Vec<Requirement>,
    /// The files published under this release.
    pub files: Vec<ArtifactInfo>,
    /// The extras activated by the incoming edges.
    pub extras: BTreeSet<String>,
}

/// The result of a resolution: a consistent assignment of one version per package
/// covering every transitive requirement of the roots, together with the edges needed
/// to later project it onto a concrete environment.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// The requirements given by the user.
    pub roots: Vec<Requirement>,
    /// The locked packages, sorted by name.
    pub packages: IndexMap<(NormalizedPackageName, Version), ReleaseData>,
}

impl Resolution {
    /// Renders the `pip freeze` style listing: one sorted `name==version` line per
    /// package, with a trailing newline.
    pub fn to_frozen(&self) -> String {
        let mut lines: Vec<String> = self
            .packages
            .iter()
            .map(|((_, version), data)| format!("{}=={}", data.name.as_source_str(), version))
            .collect();
        lines.sort();
        let mut out = String::new();
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
        out
    }

    /// Filters the resolution down to the packages that are actually installed in the
    /// given environment with the given root extras.
    ///
    /// The resolved packages form a connected graph with one version per node and the
    /// per-release requirements as outgoing edges. This is a breadth first search over
    /// that graph dropping every edge whose marker is false under `env`; each visited
    /// node carries the set of extras its incoming edges activated, and a node is
    /// revisited when a later edge activates additional extras.
    pub fn for_environment(&self, env: &MarkerEnvironment, root_extras: &[String]) -> Resolution {
        let name_to_key: HashMap<&NormalizedPackageName, &(NormalizedPackageName, Version)> = self
            .packages
            .keys()
            .map(|key| (&key.0, key))
            .collect();

        // The starting incoming edges are the root requirements that apply to env
        let env_roots: Vec<Requirement> = self
            .roots
            .iter()
            .filter(|requirement| requirement.evaluate_markers(env, root_extras.to_vec()))
            .cloned()
            .collect();

        let mut selected: IndexSet<NormalizedPackageName> = IndexSet::new();
        let mut selected_extras: HashMap<NormalizedPackageName, BTreeSet<String>> = HashMap::new();
        let mut queue: VecDeque<NormalizedPackageName> = VecDeque::new();
        for root in &env_roots {
            let name = NormalizedPackageName::from_raw(&root.name);
            selected.insert(name.clone());
            selected_extras
                .entry(name.clone())
                .or_default()
                .extend(root.extras.iter().flatten().cloned());
            queue.push_back(name);
        }

        let mut already_warned: Vec<(NormalizedPackageName, String, String)> = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(key) = name_to_key.get(&current) else {
                // The edge was live enough to resolve against the configured python
                // range but this package never made it into the resolution
                continue;
            };
            let current_extras: Vec<String> = selected_extras
                .get(&current)
                .map(|extras| extras.iter().cloned().collect())
                .unwrap_or_default();

            for requirement in &self.packages[*key].requirements {
                let (matches, warnings) =
                    requirement.evaluate_markers_and_report(env, current_extras.clone());
                for warning in &warnings {
                    let entry = (current.clone(), requirement.to_string(), warning.2.clone());
                    if already_warned.contains(&entry) {
                        continue;
                    }
                    tracing::warn!(
                        "Package {} has requirement `{}` with invalid marker expression `{}`: {}",
                        current,
                        requirement,
                        warning.2,
                        warning.1
                    );
                    already_warned.push(entry);
                }
                if !matches {
                    // Either the env markers don't fit, or we lack the extra because
                    // the edge activating it was itself dropped closer to the root
                    continue;
                }

                let target = NormalizedPackageName::from_raw(&requirement.name);
                let mut revisit = false;
                if selected.insert(target.clone()) {
                    revisit = true;
                }
                let target_extras = selected_extras.entry(target.clone()).or_default();
                for extra in requirement.extras.iter().flatten() {
                    if target_extras.insert(extra.clone()) {
                        revisit = true;
                    }
                }
                if revisit && !queue.contains(&target) {
                    queue.push_back(target);
                }
            }
        }

        let packages = self
            .packages
            .iter()
            .filter(|((name, _), _)| selected.contains(name))
            .map(|(key, data)| {
                let extras = selected_extras.get(&key.0).cloned().unwrap_or_default();
                (key.clone(), ReleaseData { extras, ..data.clone() })
            })
            .collect();

        Resolution {
            roots: env_roots,
            packages,
        }
    }
}
