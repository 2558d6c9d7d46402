//! Wire formats of the package registry: the response of the JSON simple API
//! (PEP 691) and the relevant part of the per-version JSON API.

use pep440_rs::VersionSpecifiers;
use rattler_digest::{serde::SerializableHash, Sha256};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DisplayFromStr, VecSkipError};

/// The result of the simple API response for one project.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProjectInfo {
    /// Metadata describing the API.
    pub meta: Meta,

    /// All the available files for this project
    #[serde_as(as = "VecSkipError<_>")]
    pub files: Vec<ArtifactInfo>,
}

/// A single downloadable distribution belonging to a release.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ArtifactInfo {
    /// Artifact filename, e.g. `numpy-1.24.1-cp310-cp310-win_amd64.whl`
    pub filename: String,
    /// Url to download the artifact
    pub url: url::Url,
    /// Hashes of the artifact
    #[serde(default)]
    pub hashes: Option<ArtifactHashes>,
    /// Python requirement
    #[serde(default)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub requires_python: Option<VersionSpecifiers>,
    /// Yanked information
    #[serde(default)]
    pub yanked: Yanked,
}

impl ArtifactInfo {
    /// Returns true if this artifact is a binary distribution.
    pub fn is_wheel(&self) -> bool {
        super::artifact_name::is_wheel(&self.filename)
    }
}

/// Hashes for an artifact. In theory all hash algorithms available via Python's
/// `hashlib` are supported but we only care about sha256.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ArtifactHashes {
    /// The sha256 hash of the artifact
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    pub sha256: Option<rattler_digest::Sha256Hash>,
}

/// Version of the simple API that produced a [`ProjectInfo`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meta {
    /// Version of the API
    #[serde(rename = "api-version")]
    pub version: String,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            version: "1.0".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawYanked {
    NoReason(bool),
    WithReason(String),
}

/// Whether a file is yanked, and why. The wire value is either a bool or the reason
/// string.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(from = "RawYanked")]
pub struct Yanked {
    /// This is true if the file is yanked.
    pub yanked: bool,
    /// Optional reason why the file is yanked.
    pub reason: Option<String>,
}

impl From<RawYanked> for Yanked {
    fn from(raw: RawYanked) -> Self {
        match raw {
            RawYanked::NoReason(yanked) => Self {
                yanked,
                reason: None,
            },
            RawYanked::WithReason(reason) => Self {
                yanked: true,
                reason: Some(reason),
            },
        }
    }
}

/// The `info` block of the per-version JSON API, i.e.
/// `https://pypi.org/pypi/{name}/{version}/json`. The `requires_dist` strings in here
/// are taken from whichever artifact the index processed first and are not
/// authoritative, which is why the resolver re-validates them against wheel METADATA.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionMetadata {
    /// The unnormalized package name, e.g. `Django`
    pub name: String,
    /// Raw requirement strings, may be missing entirely
    #[serde(default)]
    pub requires_dist: Option<Vec<String>>,
}

/// The full per-version JSON API response.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionMetadataResponse {
    /// The metadata block, everything else in the response is ignored
    pub info: VersionMetadata,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_project_info() {
        let data = r#"{
            "meta": {"api-version": "1.1"},
            "files": [
                {
                    "filename": "six-1.16.0-py2.py3-none-any.whl",
                    "url": "https://files.pythonhosted.org/packages/six-1.16.0-py2.py3-none-any.whl",
                    "hashes": {"sha256": "8abb2f1d86890a2dfb989f9a77cfcfd3e47c2a354b01111771326f8aa26e0254"},
                    "requires-python": ">=2.7, !=3.0.*, !=3.1.*, !=3.2.*",
                    "yanked": false
                },
                {
                    "filename": "six-1.16.0.tar.gz",
                    "url": "https://files.pythonhosted.org/packages/six-1.16.0.tar.gz",
                    "hashes": {},
                    "yanked": "broken metadata"
                }
            ]
        }"#;
        let info: ProjectInfo = serde_json::from_str(data).unwrap();
        assert_eq!(info.meta.version, "1.1");
        assert_eq!(info.files.len(), 2);
        assert!(info.files[0].is_wheel());
        assert!(!info.files[0].yanked.yanked);
        assert!(info.files[1].yanked.yanked);
        assert_eq!(info.files[1].yanked.reason.as_deref(), Some("broken metadata"));
    }

    #[test]
    fn test_parse_version_metadata() {
        let data = r#"{"info": {"name": "pandas", "version": "1.5.2", "requires_dist": ["numpy (>=1.20.3)"]}}"#;
        let response: VersionMetadataResponse = serde_json::from_str(data).unwrap();
        assert_eq!(response.info.name, "pandas");
        assert_eq!(
            response.info.requires_dist.as_deref(),
            Some(&["numpy (>=1.20.3)".to_string()][..])
        );
    }
}
