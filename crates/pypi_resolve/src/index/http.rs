use super::file_store::{FileLock, FileStore};
use http::header::{HeaderMap, ACCEPT, CACHE_CONTROL};
use http_cache_semantics::{AfterResponse, BeforeRequest, CachePolicy};
use miette::Diagnostic;
use reqwest::{Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;
use url::Url;

/// Different caching semantics that can be applied to a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheMode {
    /// Apply regular HTTP caching semantics
    Default,
    /// Don't look in the cache, and don't write to it
    NoStore,
}

/// A GET client with an on-disk cache honoring regular HTTP caching semantics.
/// Conditional revalidation (etags, `If-Modified-Since`) is handled through the
/// stored [`CachePolicy`]; the policy is serialized in front of the body bytes in a
/// single [`FileStore`] entry.
#[derive(Debug, Clone)]
pub struct Http {
    client: ClientWithMiddleware,
    cache: std::sync::Arc<FileStore>,
}

#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum HttpRequestError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Middleware(#[from] reqwest_middleware::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HttpRequestError {
    /// The HTTP status the server answered with, if the error carries one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpRequestError::Http(err) => err.status(),
            HttpRequestError::Middleware(reqwest_middleware::Error::Reqwest(err)) => err.status(),
            _ => None,
        }
    }
}

impl Http {
    /// Constructs a new instance.
    pub fn new(client: ClientWithMiddleware, cache: FileStore) -> Self {
        Http {
            client,
            cache: std::sync::Arc::new(cache),
        }
    }

    /// Performs a single GET request, caching the result if the response allows it.
    pub async fn get(
        &self,
        url: Url,
        headers: HeaderMap,
        cache_mode: CacheMode,
    ) -> Result<Vec<u8>, HttpRequestError> {
        tracing::debug!(url=%url, cache_mode=?cache_mode, "executing request");

        let request = self
            .client
            .request(Method::GET, url.clone())
            .headers(headers.clone())
            .build()?;

        if cache_mode == CacheMode::NoStore {
            let response = self.client.execute(request).await?.error_for_status()?;
            return Ok(response.bytes().await?.to_vec());
        }

        let key = key_for_request(&url, &headers);
        let lock = self.cache.lock(key.as_slice())?;

        if let Some((old_policy, old_body)) = lock
            .reader()
            .and_then(|reader| read_cache(reader.detach_unlocked()).ok())
        {
            match old_policy.before_request(&request, SystemTime::now()) {
                BeforeRequest::Fresh(_) => {
                    tracing::trace!(url=%url, "cache entry is fresh");
                    Ok(old_body)
                }
                BeforeRequest::Stale {
                    request: new_parts,
                    matches: _,
                } => {
                    // Perform the request with the revalidation headers to determine
                    // whether the cache entry is still usable.
                    let request = convert_request(&self.client, new_parts)?;
                    let response = self
                        .client
                        .execute(request.try_clone().expect("clone of request cannot fail"))
                        .await?;

                    match old_policy.after_response(&request, &response, SystemTime::now()) {
                        AfterResponse::NotModified(new_policy, _parts) => {
                            tracing::trace!(url=%url, "stale, but not modified");
                            fill_cache(&new_policy, &url, &old_body, lock)?;
                            Ok(old_body)
                        }
                        AfterResponse::Modified(new_policy, _parts) => {
                            tracing::trace!(url=%url, "stale and modified");
                            let response = response.error_for_status()?;
                            let body = response.bytes().await?.to_vec();
                            if new_policy.is_storable() {
                                fill_cache(&new_policy, &url, &body, lock)?;
                            } else {
                                lock.remove()?;
                            }
                            Ok(body)
                        }
                    }
                }
            }
        } else {
            let response = self
                .client
                .execute(request.try_clone().expect("clone of request cannot fail"))
                .await?
                .error_for_status()?;
            let policy = CachePolicy::new(&request, &response);
            let body = response.bytes().await?.to_vec();
            if policy.is_storable() {
                fill_cache(&policy, &url, &body, lock)?;
            }
            Ok(body)
        }
    }
}

/// The stored representation of a cache entry: the policy header blob, directly
/// followed by the body bytes.
#[derive(Serialize, Deserialize)]
struct CacheData {
    policy: CachePolicy,
    url: Url,
}

/// Construct a [`FileStore`] key for a request.
fn key_for_request(url: &Url, headers: &HeaderMap) -> Vec<u8> {
    let mut key: Vec<u8> = Default::default();
    let method = Method::GET.to_string().into_bytes();
    key.extend(method.len().to_le_bytes());
    key.extend(method);

    // Add the url to the key but ignore the fragments.
    let mut url = url.clone();
    url.set_fragment(None);
    let uri = url.to_string();
    key.extend(uri.len().to_le_bytes());
    key.extend(uri.into_bytes());

    // Headers that influence the response representation are part of the key
    for header_name in [ACCEPT, CACHE_CONTROL] {
        if let Some(value) = headers.get(&header_name) {
            let header_name = header_name.to_string().into_bytes();
            key.extend(header_name.len().to_le_bytes());
            key.extend(header_name);

            let header_value = value.as_bytes().to_vec();
            key.extend(header_value.len().to_le_bytes());
            key.extend(header_value);
        }
    }

    key
}

/// Read a cached policy + body from a reader.
fn read_cache<R: Read>(mut f: R) -> io::Result<(CachePolicy, Vec<u8>)> {
    let data: CacheData = ciborium::de::from_reader(&mut f)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut body = Vec::new();
    f.read_to_end(&mut body)?;
    Ok((data.policy, body))
}

/// Store a policy + body under the locked cache entry.
fn fill_cache(policy: &CachePolicy, url: &Url, body: &[u8], lock: FileLock) -> io::Result<()> {
    let mut cache_writer = lock.begin()?;
    ciborium::ser::into_writer(
        &CacheData {
            policy: policy.clone(),
            url: url.clone(),
        },
        &mut cache_writer,
    )
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    cache_writer.write_all(body)?;
    cache_writer.commit()?;
    Ok(())
}

/// Converts from `http::request::Parts` into a `reqwest::Request`.
fn convert_request(
    client: &ClientWithMiddleware,
    parts: http::request::Parts,
) -> Result<reqwest::Request, HttpRequestError> {
    Ok(client
        .request(
            parts.method,
            Url::from_str(&parts.uri.to_string()).expect("uris should be the same"),
        )
        .headers(parts.headers)
        .build()?)
}
