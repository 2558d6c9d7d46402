//! The incremental, delay-tolerant resolution engine.

mod fetch;
mod resolution;
mod resolver;
mod sdists;
mod state;
mod wheel_metadata;

pub use resolution::{ReleaseData, Resolution};

use crate::index::{RegistryClient, RegistryError};
use crate::sdist::{SdistBuildError, SdistBuilder};
use crate::types::NormalizedPackageName;
use miette::Diagnostic;
use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::{Requirement, VersionOrUrl};
use resolver::{target_python_versions, Resolver};
use thiserror::Error;

/// Options that control a resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Validate candidate requirements against the wheels' own METADATA. On by
    /// default; turning it off trades correctness on packages with broken index
    /// metadata for fewer requests.
    pub download_wheels: bool,

    /// Prefer the highest satisfying version of every package (the default), or the
    /// lowest when false.
    pub maximum_versions: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            download_wheels: true,
            maximum_versions: true,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ResolveError {
    #[error(
        "No compatible version for {name}.\nConstraints: {}.\nVersions: {}",
        .constraints.join(", "),
        .versions.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )]
    NoCompatibleVersion {
        name: NormalizedPackageName,
        /// The incoming edges, rendered as `` `requirement` from source version ``
        constraints: Vec<String>,
        /// The versions that were inspected and rejected
        versions: Vec<Version>,
    },

    #[error(
        "Expected exactly one sdist for {name} {version}, found {}",
        .files.join(", ")
    )]
    AmbiguousSdist {
        name: NormalizedPackageName,
        version: Version,
        files: Vec<String>,
    },

    #[error("URL requirements are not supported: `{requirement}`")]
    UnsupportedUrl { requirement: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] SdistBuildError),
}

/// Resolve a single root requirement. See [`resolve_requirements`].
pub async fn resolve_requirement(
    root: Requirement,
    requires_python: &VersionSpecifiers,
    index: &dyn RegistryClient,
    builder: &dyn SdistBuilder,
    options: &ResolveOptions,
) -> Result<Resolution, ResolveError> {
    resolve_requirements(vec![root], requires_python, index, builder, options).await
}

/// Resolve a set of root requirements against the registry behind `index` into a
/// locked set of `(package, version)` pairs such that every transitive requirement
/// that can apply to an interpreter matching `requires_python` is satisfied.
///
/// Conflicts fail fast with [`ResolveError::NoCompatibleVersion`]; there is no
/// backtracking. The returned [`Resolution`] covers the whole `requires_python`
/// range; project it onto a concrete interpreter and platform with
/// [`Resolution::for_environment`].
pub async fn resolve_requirements(
    roots: Vec<Requirement>,
    requires_python: &VersionSpecifiers,
    index: &dyn RegistryClient,
    builder: &dyn SdistBuilder,
    options: &ResolveOptions,
) -> Result<Resolution, ResolveError> {
    for root in &roots {
        if let Some(VersionOrUrl::Url(_)) = &root.version_or_url {
            return Err(ResolveError::UnsupportedUrl {
                requirement: root.to_string(),
            });
        }
    }

    let python_versions = target_python_versions(requires_python);
    tracing::debug!(
        "resolving for {} interpreter version(s) in {requires_python}",
        python_versions.len()
    );

    Resolver::new(roots, python_versions, index, builder, options)
        .run()
        .await
}
