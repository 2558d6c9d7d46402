use super::{PackageName, ParsePackageNameError, RFC822ish, Rfc822ishError};
use crate::reqparse::parse_requirement_fixup;
use once_cell::sync::Lazy;
use pep440_rs::{Pep440Error, Version, VersionSpecifiers};
use pep508_rs::{Pep508Error, Requirement};
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

/// The part of python core metadata the resolver consumes, parsed from the headers of
/// a wheel's `.dist-info/METADATA` (or the `PKG-INFO` a metadata build produces).
#[derive(Debug, Clone)]
pub struct CoreMetadata {
    /// The name of the package, in the spelling the metadata reported
    pub name: PackageName,
    /// Version w.r.t. PEP 440
    pub version: Version,
    /// Outgoing requirement edges, the `Requires-Dist` fields
    pub requires_dist: Vec<Requirement>,
    /// The interpreter requirement, the `Requires-Python` field
    pub requires_python: Option<VersionSpecifiers>,
    /// Extras this distribution provides, the `Provides-Extra` fields
    pub extras: HashSet<String>,
}

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum CoreMetadataError {
    #[error(transparent)]
    FailedToParseMetadata(#[from] Rfc822ishError),

    #[error("invalid Metadata-Version: {0}")]
    InvalidMetadataVersion(String),

    #[error("unsupported METADATA version {0}")]
    UnsupportedVersion(Version),

    #[error("invalid Version: {0}")]
    InvalidVersion(String),

    #[error("invalid Requires-Python: {0}")]
    InvalidRequiresPython(#[source] Pep440Error),

    #[error("invalid Requires-Dist `{0}`: {1}")]
    InvalidRequiresDist(String, #[source] Pep508Error),

    #[error(transparent)]
    InvalidPackageName(#[from] ParsePackageNameError),
}

impl TryFrom<&[u8]> for CoreMetadata {
    type Error = CoreMetadataError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        static NEXT_MAJOR_METADATA_VERSION: Lazy<Version> =
            Lazy::new(|| Version::from_str("3").unwrap());

        let input = String::from_utf8_lossy(value);
        let mut parsed = RFC822ish::from_str(&input)?;

        // Core-metadata consumers MUST fail when the major version exceeds what they
        // support; unrecognized minor revisions are compatible by definition.
        let metadata_version = parsed.take("Metadata-Version")?;
        let metadata_version: Version = metadata_version
            .parse()
            .map_err(CoreMetadataError::InvalidMetadataVersion)?;
        if metadata_version >= *NEXT_MAJOR_METADATA_VERSION {
            return Err(CoreMetadataError::UnsupportedVersion(metadata_version));
        }

        let name: PackageName = parsed.take("Name")?.parse()?;
        let version: Version = parsed
            .take("Version")?
            .parse()
            .map_err(CoreMetadataError::InvalidVersion)?;

        let debug_source = format!("{} {}", name.as_str(), version);
        let mut requires_dist = Vec::new();
        for req_str in parsed.take_all("Requires-Dist") {
            let requirement = parse_requirement_fixup(&req_str, Some(&debug_source))
                .map_err(|e| CoreMetadataError::InvalidRequiresDist(req_str.clone(), e))?;
            requires_dist.push(requirement);
        }

        let requires_python = parsed
            .maybe_take("Requires-Python")?
            .as_deref()
            .map(VersionSpecifiers::from_str)
            .transpose()
            .map_err(CoreMetadataError::InvalidRequiresPython)?;

        let extras = parsed.take_all("Provides-Extra").into_iter().collect();

        Ok(CoreMetadata {
            name,
            version,
            requires_dist,
            requires_python,
            extras,
        })
    }
}
