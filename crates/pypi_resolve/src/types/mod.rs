//! The vocabulary types of the python packaging ecosystem that the resolver speaks.

mod artifact_name;
mod core_metadata;
mod package_name;
mod project_info;
mod rfc822ish;

pub use artifact_name::{
    is_wheel, version_from_filename, ParseArtifactNameError, SDistFormat,
};
pub use core_metadata::{CoreMetadata, CoreMetadataError};
pub use package_name::{NormalizedPackageName, PackageName, ParsePackageNameError};
pub use project_info::{
    ArtifactHashes, ArtifactInfo, Meta, ProjectInfo, VersionMetadata, VersionMetadataResponse,
    Yanked,
};
pub use rfc822ish::{Rfc822ishError, RFC822ish};
