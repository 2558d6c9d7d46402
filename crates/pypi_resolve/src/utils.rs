use url::Url;

pub(crate) const USER_AGENT: &str =
    concat!("pypi_resolve/", env!("CARGO_PKG_VERSION"));

/// Keep retrying a certain IO function until it either succeeds or until it doesn't
/// return [`std::io::ErrorKind::Interrupted`].
pub(crate) fn retry_interrupted<F, T>(mut f: F) -> std::io::Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(err) if err.kind() != std::io::ErrorKind::Interrupted => {
                return Err(err);
            }
            _ => {
                // Otherwise keep looping!
            }
        }
    }
}

/// Normalize url according to pip standards
pub fn normalize_index_url(mut url: Url) -> Url {
    let path = url.path();
    if !path.ends_with('/') {
        url.set_path(&format!("{path}/"));
    }
    url
}
