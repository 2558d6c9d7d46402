use super::file_store::FileStore;
use super::http::{CacheMode, Http};
use super::lazy_metadata::{lazy_read_wheel_metadata, WheelMetadataError};
use super::{RegistryClient, RegistryError, ReleaseMap};
use crate::types::{
    version_from_filename, ArtifactInfo, CoreMetadata, NormalizedPackageName, ProjectInfo,
    VersionMetadata, VersionMetadataResponse,
};
use crate::utils::{normalize_index_url, USER_AGENT};
use async_http_range_reader::{AsyncHttpRangeReader, CheckSupportMethod};
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, USER_AGENT as USER_AGENT_HEADER};
use pep440_rs::Version;
use reqwest::{Client, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use url::Url;

/// A client for a PEP 503/691 compliant package registry, with persistent caching of
/// everything it fetches.
///
/// Three kinds of information are served, with very different costs: the release list
/// of a project (simple API, one request per project), the metadata of one version
/// (JSON API, one request per version) and the METADATA file inside a wheel (a couple
/// of range requests against the archive).
pub struct PackageIndex {
    http: Http,
    /// Range requests bypass the middleware stack, the range reader does its own
    /// requests over a plain client.
    client_raw: Client,
    index_url: Url,
    json_api_url: Url,
    wheel_metadata_cache: FileStore,
}

impl PackageIndex {
    /// Constructs a new instance that fetches from `index_url` and caches below
    /// `cache_dir`. Transient request failures are retried with exponential backoff
    /// before they surface as errors.
    pub fn new(client: Client, index_url: &Url, cache_dir: &Path) -> std::io::Result<Self> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let middleware: ClientWithMiddleware = reqwest_middleware::ClientBuilder::new(client.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let index_url = normalize_index_url(index_url.clone());

        // The per-version metadata lives under /pypi/ on the same host as the simple
        // index.
        let mut json_api_url = index_url.clone();
        json_api_url.set_path("/pypi/");

        Ok(Self {
            http: Http::new(middleware, FileStore::new(&cache_dir.join("http"))?),
            client_raw: client,
            index_url,
            json_api_url,
            wheel_metadata_cache: FileStore::new(&cache_dir.join("wheel-metadata"))?,
        })
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT));
        headers
    }
}

#[async_trait]
impl RegistryClient for PackageIndex {
    async fn get_releases(
        &self,
        name: &NormalizedPackageName,
    ) -> Result<ReleaseMap, RegistryError> {
        let mut url = self
            .index_url
            .join(&format!("{name}/"))
            .expect("invalid url");
        url.set_query(Some("format=application/vnd.pypi.simple.v1+json"));

        let mut headers = Self::default_headers();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));

        let bytes = self
            .http
            .get(url.clone(), headers, CacheMode::Default)
            .await
            .map_err(|err| {
                if err.status() == Some(StatusCode::NOT_FOUND) {
                    RegistryError::NotFound(name.clone())
                } else {
                    RegistryError::Request(url.to_string(), err)
                }
            })?;

        let project_info: ProjectInfo = serde_json::from_slice(&bytes)
            .map_err(|err| RegistryError::InvalidResponse(url.to_string(), err))?;
        parse_releases(name, project_info)
    }

    async fn get_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
    ) -> Result<VersionMetadata, RegistryError> {
        let url = self
            .json_api_url
            .join(&format!("{name}/{version}/json"))
            .expect("invalid url");

        let bytes = self
            .http
            .get(url.clone(), Self::default_headers(), CacheMode::Default)
            .await
            .map_err(|err| RegistryError::Request(url.to_string(), err))?;

        let response: VersionMetadataResponse = serde_json::from_slice(&bytes)
            .map_err(|err| RegistryError::InvalidResponse(url.to_string(), err))?;
        Ok(response.info)
    }

    async fn get_wheel_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
        file: &ArtifactInfo,
    ) -> Result<CoreMetadata, RegistryError> {
        // The METADATA of a published wheel never changes, a plain presence check is
        // enough.
        if let Some(mut cached) = self.wheel_metadata_cache.get(file.filename.as_str()) {
            let mut blob = Vec::new();
            cached.read_to_end(&mut blob)?;
            return CoreMetadata::try_from(blob.as_slice()).map_err(|err| {
                RegistryError::WheelMetadata(file.filename.clone(), err.into())
            });
        }

        tracing::debug!(url=%file.url, "lazy reading wheel metadata");
        let (mut reader, _headers) = AsyncHttpRangeReader::new(
            self.client_raw.clone(),
            file.url.clone(),
            CheckSupportMethod::Head,
        )
        .await
        .map_err(|err| {
            RegistryError::WheelMetadata(file.filename.clone(), WheelMetadataError::from(err))
        })?;

        let (blob, metadata) = lazy_read_wheel_metadata(name, version, &mut reader)
            .await
            .map_err(|err| RegistryError::WheelMetadata(file.filename.clone(), err))?;

        self.wheel_metadata_cache
            .get_or_set(file.filename.as_str(), |w| w.write_all(&blob))?;

        Ok(metadata)
    }
}

/// Turn a simple API response into the per-version artifact listing the resolver
/// consumes. Yanked files are dropped, files with unusable names or unparseable
/// versions are skipped, the rest is grouped by version and ordered newest first.
fn parse_releases(
    name: &NormalizedPackageName,
    project_info: ProjectInfo,
) -> Result<ReleaseMap, RegistryError> {
    if project_info.meta.version.split('.').next() != Some("1") {
        return Err(RegistryError::UnsupportedApiVersion(
            name.clone(),
            project_info.meta.version,
        ));
    }

    let mut releases: ReleaseMap = Default::default();
    let mut ignored = Vec::new();
    let mut invalid_versions = Vec::new();
    for file in project_info.files {
        if file.yanked.yanked {
            continue;
        }

        let version = match version_from_filename(name, &file.filename) {
            Ok(Some(version)) => version,
            Ok(None) => {
                ignored.push(file.filename);
                continue;
            }
            Err(err) => {
                tracing::warn!("skipping file of {name}: {err}");
                continue;
            }
        };
        match Version::from_str(&version) {
            Ok(version) => releases.entry(version).or_default().push(file),
            Err(_) => invalid_versions.push(version),
        }
    }

    if !invalid_versions.is_empty() {
        tracing::debug!("{name} has invalid versions: {invalid_versions:?}");
    }
    if !ignored.is_empty() {
        tracing::debug!("ignoring files with unused extensions: {ignored:?}");
    }

    // Deterministic artifact order within a release, newest release first.
    for files in releases.values_mut() {
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
    }
    releases.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));

    Ok(releases)
}
