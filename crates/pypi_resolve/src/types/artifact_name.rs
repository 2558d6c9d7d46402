use super::NormalizedPackageName;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Archive formats a source distribution can be shipped in.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[allow(missing_docs)]
pub enum SDistFormat {
    Zip,
    TarGz,
    TarBz2,
    Tgz,
    Tar,
}

impl SDistFormat {
    /// Formats we can actually unpack for a metadata build.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::TarGz | Self::Tgz | Self::Tar | Self::Zip)
    }

    /// Determine the format from a filename.
    pub fn from_filename(filename: &str) -> Result<SDistFormat, ParseArtifactNameError> {
        let format = if filename.ends_with(".zip") {
            SDistFormat::Zip
        } else if filename.ends_with(".tar.gz") {
            SDistFormat::TarGz
        } else if filename.ends_with(".tar.bz2") {
            SDistFormat::TarBz2
        } else if filename.ends_with(".tgz") {
            SDistFormat::Tgz
        } else if filename.ends_with(".tar") {
            SDistFormat::Tar
        } else {
            return Err(ParseArtifactNameError::InvalidExtension(
                filename.to_string(),
            ));
        };
        Ok(format)
    }
}

impl Display for SDistFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let format = match self {
            SDistFormat::Zip => ".zip",
            SDistFormat::TarGz => ".tar.gz",
            SDistFormat::TarBz2 => ".tar.bz2",
            SDistFormat::Tgz => ".tgz",
            SDistFormat::Tar => ".tar",
        };
        write!(f, "{format}")
    }
}

/// An error that can occur when taking an artifact filename apart
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ParseArtifactNameError {
    #[error("package name '{0}' not found in filename: '{1}'")]
    PackageNameNotFound(NormalizedPackageName, String),

    #[error("invalid artifact extension (filename='{0}')")]
    InvalidExtension(String),

    #[error("wheel filename '{0}' has too few components")]
    InvalidWheelName(String),
}

/// Returns true if the filename names a binary distribution.
pub fn is_wheel(filename: &str) -> bool {
    filename.ends_with(".whl")
}

/// Distribution filenames the index lists but we never consume.
fn is_ignored_extension(filename: &str) -> bool {
    [".egg", ".exe", ".msi", ".rpm"]
        .iter()
        .any(|suffix| filename.ends_with(suffix))
}

/// Extracts the version *string* from a distribution filename.
///
/// Wheel filenames have a fixed structure where the second `-`-separated component is
/// the version. Sdists were only specified in 2020 and older filenames are ambiguous:
/// `tokenizer-rt-1.0-final1.tar.gz` is as legal as `tokenizer-1.0.tar.gz`. We therefore
/// strip the archive suffix, then scan for the `-` at which the prefix normalizes to
/// the package name and take everything after it as the version. The result may not be
/// a valid PEP 440 version (e.g. `0.8.0-final0`), the caller decides what to do then.
///
/// Returns `Ok(None)` for known-but-unused file types (`.egg`, `.exe`, ...) and for
/// files with unrecognized extensions.
pub fn version_from_filename(
    project: &NormalizedPackageName,
    filename: &str,
) -> Result<Option<String>, ParseArtifactNameError> {
    if is_wheel(filename) {
        let version = filename
            .splitn(3, '-')
            .nth(1)
            .ok_or_else(|| ParseArtifactNameError::InvalidWheelName(filename.to_string()))?;
        return Ok(Some(version.to_string()));
    }

    if is_ignored_extension(filename) {
        return Ok(None);
    }

    let Ok(format) = SDistFormat::from_filename(filename) else {
        tracing::warn!("file with unexpected name in {project}: {filename}");
        return Ok(None);
    };
    let stem = &filename[..filename.len() - format.to_string().len()];

    match split_off_package_name(stem, project) {
        Some((_name, version)) => Ok(Some(version.to_string())),
        None => Err(ParseArtifactNameError::PackageNameNotFound(
            project.clone(),
            filename.to_string(),
        )),
    }
}

/// Split a filename stem into the package name spelling and the rest by scanning for
/// the `-` at which the prefix normalizes to the expected package name.
///
/// E.g. `trio-three-0.18.0` with normalized package name `trio-three` splits into
/// (`trio-three`, `0.18.0`).
fn split_off_package_name<'a>(
    stem: &'a str,
    project: &NormalizedPackageName,
) -> Option<(&'a str, &'a str)> {
    for (idx, char) in stem.char_indices() {
        if char == '-' {
            let (name, rest) = (&stem[..idx], &stem[idx + 1..]);
            if NormalizedPackageName::from_raw(name) == *project {
                return Some((name, rest));
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn name(s: &str) -> NormalizedPackageName {
        NormalizedPackageName::from_raw(s)
    }

    #[test]
    fn test_sdist_version() {
        assert_eq!(
            version_from_filename(&name("jedi"), "jedi-0.8.0-final0.tar.gz").unwrap(),
            Some("0.8.0-final0".to_string())
        );
        assert_eq!(
            version_from_filename(&name("typed-ast"), "typed_ast-0.5.1.tar.gz").unwrap(),
            Some("0.5.1".to_string())
        );
        assert_eq!(
            version_from_filename(&name("typed-ast"), "typed-ast-0.5.1.tar.gz").unwrap(),
            Some("0.5.1".to_string())
        );
    }

    #[test]
    fn test_wheel_version() {
        assert_eq!(
            version_from_filename(&name("trio"), "trio-0.18.0-py3-none-any.whl").unwrap(),
            Some("0.18.0".to_string())
        );
        assert_eq!(
            version_from_filename(
                &name("numpy"),
                "numpy-1.26.0-pp39-pypy39_pp73-manylinux_2_17_x86_64.whl"
            )
            .unwrap(),
            Some("1.26.0".to_string())
        );
    }

    #[test]
    fn test_unused_file_types() {
        assert_eq!(
            version_from_filename(&name("pywin32"), "pywin32-212.win32-py2.4.exe").unwrap(),
            None
        );
    }

    #[test]
    fn test_name_mismatch() {
        assert!(version_from_filename(&name("requests"), "urllib3-1.26.0.tar.gz").is_err());
    }

    #[test]
    fn test_formats() {
        assert!(SDistFormat::from_filename("pkg-1.0.tar.gz").unwrap().is_supported());
        assert!(!SDistFormat::from_filename("pkg-1.0.tar.bz2")
            .unwrap()
            .is_supported());
        assert!(SDistFormat::from_filename("pkg-1.0.flac").is_err());
    }
}
