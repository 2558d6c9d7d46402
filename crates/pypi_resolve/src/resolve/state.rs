use crate::index::ReleaseMap;
use crate::types::NormalizedPackageName;
use indexmap::IndexSet;
use pep440_rs::Version;
use pep508_rs::Requirement;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::str::FromStr;

/// The `(package, version)` a requirement edge originates from. Root requirements
/// carry the pseudo-source `("(user specified)", 0)`.
pub(crate) type Source = (NormalizedPackageName, Version);

/// An incoming edge of the requirement graph.
pub(crate) type Edge = (Requirement, Source);

/// Everything the resolver knows mid-flight. Owned exclusively by the single
/// resolution task; created per call and dropped with it.
pub(crate) struct State {
    /// The packages whose candidate may be stale and needs re-evaluation. A superset
    /// of the actually-stale packages is fine, false positives are no-ops.
    pub queue: VecDeque<NormalizedPackageName>,

    /// Packages whose release list we have not seen yet, fetched when the queue
    /// drains.
    pub fetch_versions: BTreeSet<NormalizedPackageName>,

    /// The per-version metadata to fetch when the queue drains. A map so that a later
    /// pass choosing a different version overwrites the now useless earlier request.
    pub fetch_metadata: BTreeMap<NormalizedPackageName, Version>,

    /// Sdist builds already completed.
    pub resolved_sdists: HashSet<(NormalizedPackageName, Version)>,

    /// Known releases per package: version to published files, newest first.
    pub versions_cache: HashMap<NormalizedPackageName, ReleaseMap>,

    /// Best-known outgoing edges per release.
    pub requirements: HashMap<(NormalizedPackageName, Version), Vec<Requirement>>,

    /// Releases whose requirements came from wheel METADATA or a metadata build
    /// rather than the index.
    pub requirements_credible: HashSet<(NormalizedPackageName, Version)>,

    /// Releases whose requirements were overwritten after their edges had already
    /// been applied, mapped to the superseded requirement set. Forces re-evaluation
    /// without a candidate change, and remembers which edges must be removed.
    pub changed_metadata: HashMap<(NormalizedPackageName, Version), Vec<Requirement>>,

    /// Reverse index: per package all incoming edges, used for candidate selection.
    pub requirements_per_package: HashMap<NormalizedPackageName, IndexSet<Edge>>,

    /// The current assignment: per package the chosen version and active extras.
    pub candidates: BTreeMap<NormalizedPackageName, (Version, BTreeSet<String>)>,

    /// The unnormalized spelling the index reports per package, for output.
    pub display_names: HashMap<NormalizedPackageName, String>,
}

impl State {
    pub fn new(roots: &[Requirement]) -> Self {
        let mut state = State {
            queue: VecDeque::new(),
            fetch_versions: BTreeSet::new(),
            fetch_metadata: BTreeMap::new(),
            resolved_sdists: HashSet::new(),
            versions_cache: HashMap::new(),
            requirements: HashMap::new(),
            requirements_credible: HashSet::new(),
            changed_metadata: HashMap::new(),
            requirements_per_package: HashMap::new(),
            candidates: BTreeMap::new(),
            display_names: HashMap::new(),
        };

        let pseudo_source = root_source();
        for root in roots {
            let name = NormalizedPackageName::from_raw(&root.name);
            state
                .requirements_per_package
                .entry(name.clone())
                .or_default()
                .insert((root.clone(), pseudo_source.clone()));
            state.push_unique(name);
        }
        state
    }

    /// Add a package to the work queue unless it is already queued.
    pub fn push_unique(&mut self, name: NormalizedPackageName) {
        if !self.queue.contains(&name) {
            self.queue.push_back(name);
        }
    }

    /// Add a package unless it is queued already or its release list is still
    /// outstanding; in the latter case re-evaluating it now cannot make progress.
    pub fn push_unless_pending(&mut self, name: NormalizedPackageName) {
        if !self.fetch_versions.contains(&name) {
            self.push_unique(name);
        }
    }

    /// Sort the queue so that the processing order, and with it log output and error
    /// messages, is stable across runs.
    pub fn sort_queue(&mut self) {
        let mut names: Vec<_> = std::mem::take(&mut self.queue).into_iter().collect();
        names.sort();
        names.dedup();
        self.queue = names.into();
    }

    /// The incoming edges of a package, the empty set if there are none.
    pub fn incoming(&self, name: &NormalizedPackageName) -> &IndexSet<Edge> {
        static EMPTY: once_cell::sync::Lazy<IndexSet<Edge>> =
            once_cell::sync::Lazy::new(IndexSet::new);
        self.requirements_per_package.get(name).unwrap_or(&EMPTY)
    }
}

/// The pseudo-source attributed to root requirements.
pub(crate) fn root_source() -> Source {
    (
        NormalizedPackageName::from_raw("(user specified)"),
        Version::from_str("0").expect("0 is always a valid version"),
    )
}
