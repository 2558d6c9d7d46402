//! Talking to PyPA package registries: the simple API, the per-version JSON API and
//! sparse reads of wheel archives, all backed by an on-disk cache.

mod file_store;
mod http;
mod lazy_metadata;
mod package_index;

pub use file_store::FileStore;
pub use http::{CacheMode, Http, HttpRequestError};
pub use lazy_metadata::WheelMetadataError;
pub use package_index::PackageIndex;

use crate::types::{ArtifactInfo, CoreMetadata, NormalizedPackageName, VersionMetadata};
use async_trait::async_trait;
use indexmap::IndexMap;
use miette::Diagnostic;
use pep440_rs::Version;
use thiserror::Error;

/// The releases of a project: for every version the files published under it,
/// newest version first.
pub type ReleaseMap = IndexMap<Version, Vec<ArtifactInfo>>;

/// The registry operations the resolver depends on. [`PackageIndex`] is the
/// implementation that talks to a real index over HTTP; test suites substitute
/// in-memory implementations.
///
/// All operations are idempotent so callers may batch and retry freely.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Retrieve the release list of a project.
    async fn get_releases(&self, name: &NormalizedPackageName)
        -> Result<ReleaseMap, RegistryError>;

    /// Retrieve the index-side metadata of a single version. The requirement strings
    /// in the result are returned unparsed; the index is known to serve stale or
    /// incomplete data here.
    async fn get_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
    ) -> Result<VersionMetadata, RegistryError>;

    /// Retrieve the authoritative core metadata from a wheel archive, without
    /// downloading the whole wheel.
    async fn get_wheel_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
        file: &ArtifactInfo,
    ) -> Result<CoreMetadata, RegistryError>;
}

#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum RegistryError {
    #[error("package {0} was not found in the registry")]
    NotFound(NormalizedPackageName),

    #[error("unsupported simple API version {1} for {0}")]
    UnsupportedApiVersion(NormalizedPackageName, String),

    #[error("request for {0} failed")]
    Request(String, #[source] HttpRequestError),

    #[error("failed to parse registry response for {0}")]
    InvalidResponse(String, #[source] serde_json::Error),

    #[error("failed to read wheel metadata from {0}")]
    WheelMetadata(String, #[source] WheelMetadataError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
