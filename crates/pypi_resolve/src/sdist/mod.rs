//! Obtaining metadata from source distributions by invoking an out-of-process PEP 517
//! build backend. This is by far the slowest of the three information sources the
//! resolver draws from, which is why the resolver only gets here once everything else
//! has converged.

use crate::index::FileStore;
use crate::types::{ArtifactInfo, CoreMetadata, CoreMetadataError, SDistFormat};
use crate::utils::USER_AGENT;
use async_trait::async_trait;
use fs_err as fs;
use miette::Diagnostic;
use reqwest::Client;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const PEP517_FRONTEND_PY: &str = include_str!("./pep517_frontend.py");

/// The build operation the resolver delegates to when a release ships no wheel.
/// [`Pep517SdistBuilder`] is the real implementation; tests substitute canned
/// metadata.
#[async_trait]
pub trait SdistBuilder: Send + Sync {
    /// Download and unpack the given source distribution and extract its core
    /// metadata through the project's build backend.
    async fn build_sdist(&self, file: &ArtifactInfo) -> Result<CoreMetadata, SdistBuildError>;
}

#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum SdistBuildError {
    #[error("failed to download {0}")]
    Download(String, #[source] reqwest::Error),

    #[error("cannot unpack {0}: unsupported archive format")]
    UnsupportedFormat(String),

    #[error("unexpected layout of {0}: expected exactly one top-level directory")]
    InvalidSourceTree(String),

    #[error("failed to build metadata for {filename}\n--- Stdout:\n{stdout}\n--- Stderr:\n{stderr}\n---")]
    BuildFailed {
        filename: String,
        stdout: String,
        stderr: String,
    },

    #[error("could not run {0} to build metadata")]
    CouldNotRunBackend(String, #[source] std::io::Error),

    #[error("invalid metadata produced for {0}")]
    InvalidMetadata(String, #[source] CoreMetadataError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Builds sdist metadata by downloading the archive, unpacking it and running the
/// `prepare_metadata_for_build_wheel` hook of the declared build backend in a python
/// subprocess. Build requirements are expected to be importable by that interpreter.
pub struct Pep517SdistBuilder {
    client: Client,
    python: PathBuf,
    metadata_cache: FileStore,
}

impl Pep517SdistBuilder {
    /// Constructs a new instance caching built metadata below `cache_dir`.
    pub fn new(client: Client, cache_dir: &Path) -> std::io::Result<Self> {
        Ok(Self {
            client,
            python: PathBuf::from("python3"),
            metadata_cache: FileStore::new(&cache_dir.join("sdist-metadata"))?,
        })
    }

    /// Use a specific python interpreter for the build subprocess.
    #[must_use]
    pub fn with_python(mut self, python: PathBuf) -> Self {
        self.python = python;
        self
    }

    async fn download(&self, file: &ArtifactInfo, target: &Path) -> Result<(), SdistBuildError> {
        let mut response = self
            .client
            .get(file.url.clone())
            .header(http::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| SdistBuildError::Download(file.filename.clone(), err))?;

        let mut writer = tokio::fs::File::create(target).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| SdistBuildError::Download(file.filename.clone(), err))?
        {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl SdistBuilder for Pep517SdistBuilder {
    async fn build_sdist(&self, file: &ArtifactInfo) -> Result<CoreMetadata, SdistBuildError> {
        // Built metadata is keyed by filename, a rebuild of the same archive would
        // produce the same result.
        if let Some(mut cached) = self.metadata_cache.get(file.filename.as_str()) {
            tracing::debug!("using cached metadata for {}", file.filename);
            let mut blob = Vec::new();
            cached.read_to_end(&mut blob)?;
            return CoreMetadata::try_from(blob.as_slice())
                .map_err(|err| SdistBuildError::InvalidMetadata(file.filename.clone(), err));
        }

        let format = SDistFormat::from_filename(&file.filename)
            .map_err(|_| SdistBuildError::UnsupportedFormat(file.filename.clone()))?;
        if !format.is_supported() {
            return Err(SdistBuildError::UnsupportedFormat(file.filename.clone()));
        }

        let work_dir = tempfile::tempdir()?;

        tracing::info!("downloading {}", file.filename);
        let archive_path = work_dir.path().join(&file.filename);
        self.download(file, &archive_path).await?;

        tracing::debug!("extracting {}", file.filename);
        let extracted = work_dir.path().join("extracted");
        let archive = archive_path.clone();
        let target = extracted.clone();
        tokio::task::spawn_blocking(move || unpack_archive(format, &archive, &target))
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))??;

        // Sdists unpack to a single directory containing the source tree
        let mut entries = fs::read_dir(&extracted)?;
        let source_dir = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry?.path(),
            _ => return Err(SdistBuildError::InvalidSourceTree(file.filename.clone())),
        };

        let frontend_path = work_dir.path().join("pep517_frontend.py");
        fs::write(&frontend_path, PEP517_FRONTEND_PY)?;
        let output_dir = work_dir.path().join("metadata");
        fs::create_dir_all(&output_dir)?;

        tracing::info!("building metadata for {}", file.filename);
        let output = Command::new(&self.python)
            .arg(&frontend_path)
            .arg(&source_dir)
            .arg(&output_dir)
            .output()
            .await
            .map_err(|err| {
                SdistBuildError::CouldNotRunBackend(self.python.display().to_string(), err)
            })?;

        if !output.status.success() {
            return Err(SdistBuildError::BuildFailed {
                filename: file.filename.clone(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::warn!(
                "messages from building {}:\n--- stderr:\n{}\n---",
                file.filename,
                stderr.trim()
            );
        }

        // Backends are free to chatter on stdout, the dist-info name is the frontend's
        // last line
        let stdout = String::from_utf8_lossy(&output.stdout);
        let dist_info = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        let metadata_path = output_dir.join(dist_info).join("METADATA");
        let blob = fs::read(&metadata_path)?;

        let metadata = CoreMetadata::try_from(blob.as_slice())
            .map_err(|err| SdistBuildError::InvalidMetadata(file.filename.clone(), err))?;
        self.metadata_cache
            .get_or_set(file.filename.as_str(), |w| w.write_all(&blob))?;

        tracing::debug!(
            "sdist {} requires: {:?}",
            file.filename,
            metadata
                .requires_dist
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );
        Ok(metadata)
    }
}

/// Unpack a downloaded sdist archive into `target`.
fn unpack_archive(
    format: SDistFormat,
    archive: &Path,
    target: &Path,
) -> Result<(), SdistBuildError> {
    fs::create_dir_all(target)?;
    match format {
        SDistFormat::TarGz | SDistFormat::Tgz => {
            let file = fs::File::open(archive)?;
            let decoder = flate2::read::GzDecoder::new(file);
            tar::Archive::new(decoder).unpack(target)?;
        }
        SDistFormat::Tar => {
            let file = fs::File::open(archive)?;
            tar::Archive::new(file).unpack(target)?;
        }
        SDistFormat::Zip => {
            let file = fs::File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
            zip.extract(target)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        }
        SDistFormat::TarBz2 => {
            return Err(SdistBuildError::UnsupportedFormat(
                archive.display().to_string(),
            ));
        }
    }
    Ok(())
}
