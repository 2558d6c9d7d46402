use crate::types::{CoreMetadata, CoreMetadataError, NormalizedPackageName, PackageName};
use async_http_range_reader::AsyncHttpRangeReader;
use async_zip::base::read::seek::ZipFileReader;
use pep440_rs::Version;
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::compat::TokioAsyncReadCompatExt;

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum WheelMetadataError {
    #[error(".dist-info/ missing")]
    DistInfoMissing,

    #[error(".dist-info/METADATA missing")]
    MetadataMissing,

    #[error("found multiple .dist-info directories in wheel")]
    MultipleDistInfoDirs,

    #[error("invalid METADATA")]
    InvalidMetadata(#[from] CoreMetadataError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("failed to read the wheel file {0}: {1}")]
    AsyncZipError(String, #[source] async_zip::error::ZipError),

    #[error("range requests not supported or failed: {0}")]
    RangeRequest(#[from] async_http_range_reader::AsyncHttpRangeReaderError),
}

impl WheelMetadataError {
    fn from_async_zip(file: String, err: async_zip::error::ZipError) -> Self {
        match err {
            async_zip::error::ZipError::UpstreamReadError(err) => WheelMetadataError::IoError(err),
            _ => WheelMetadataError::AsyncZipError(file, err),
        }
    }
}

/// Locate the `.dist-info` directory inside a wheel that belongs to the given
/// distribution. Wheels must contain exactly one such directory; the spelling of the
/// name inside it may differ from the normalized form.
fn find_dist_info_dir<'a>(
    top_level_names: impl IntoIterator<Item = &'a str>,
    name: &NormalizedPackageName,
    version: &Version,
) -> Result<&'a str, WheelMetadataError> {
    let mut dist_info_dirs = Vec::new();
    let mut matching = Vec::new();
    for dir_name in top_level_names {
        let Some(stem) = dir_name.strip_suffix(".dist-info") else {
            continue;
        };
        dist_info_dirs.push(dir_name);
        let Some((dir_distribution, dir_version)) = stem.rsplit_once('-') else {
            continue;
        };
        let Ok(dir_distribution) = PackageName::from_str(dir_distribution) else {
            continue;
        };
        let Ok(dir_version) = Version::from_str(dir_version) else {
            continue;
        };
        if dir_distribution.as_str() == name.as_str() && &dir_version == version {
            matching.push(dir_name);
        }
    }

    match matching.as_slice() {
        [single] => Ok(*single),
        [] => {
            // Badly named wheels exist; as long as there is exactly one dist-info
            // directory in the archive it is unambiguous.
            match dist_info_dirs.as_slice() {
                [single] => Ok(*single),
                [] => Err(WheelMetadataError::DistInfoMissing),
                _ => Err(WheelMetadataError::MultipleDistInfoDirs),
            }
        }
        _ => Err(WheelMetadataError::MultipleDistInfoDirs),
    }
}

/// Reads the metadata from a wheel by only reading parts of the wheel zip.
///
/// Uses [`AsyncHttpRangeReader`] to read parts of the remote file through http range
/// requests: first the end of the file, to index the central directory of the zip,
/// then exactly the bytes that contain the METADATA member.
pub(crate) async fn lazy_read_wheel_metadata(
    name: &NormalizedPackageName,
    version: &Version,
    stream: &mut AsyncHttpRangeReader,
) -> Result<(Vec<u8>, CoreMetadata), WheelMetadataError> {
    // Best guess for the size of the central directory, which sits at the back of
    // the file.
    const CENTRAL_DIRECTORY_SIZE: u64 = 16384;
    stream
        .prefetch(stream.len().saturating_sub(CENTRAL_DIRECTORY_SIZE)..stream.len())
        .await;

    // Construct a zip reader over the stream.
    let mut reader = ZipFileReader::new(stream.compat())
        .await
        .map_err(|err| WheelMetadataError::from_async_zip("/".into(), err))?;

    // Collect all top-level names in the archive
    let top_level_names = reader
        .file()
        .entries()
        .iter()
        .filter_map(|entry| entry.filename().as_str().ok())
        .map(|filename| {
            filename
                .split_once(['/', '\\'])
                .map_or_else(|| filename, |(base, _)| base)
        })
        .collect::<HashSet<_>>();

    let dist_info = find_dist_info_dir(top_level_names.iter().copied(), name, version)?.to_owned();
    let metadata_path = format!("{dist_info}/METADATA");

    let (metadata_idx, metadata_entry) = reader
        .file()
        .entries()
        .iter()
        .enumerate()
        .find(|(_, entry)| entry.filename().as_str().ok() == Some(metadata_path.as_str()))
        .ok_or(WheelMetadataError::MetadataMissing)?;

    // The size of the entry plus the local header and the filename. The extra fields
    // would also count but their size is not in the central directory.
    let offset = metadata_entry.header_offset();
    let size = metadata_entry.compressed_size()
        + 30 // Header size in bytes
        + metadata_entry.filename().as_bytes().len() as u64;

    // The zip reader buffers in chunks of 8192, prefetch up to the next multiple of
    // the buffer size so the buffered read does not fall off the prefetched range.
    let buffer_size = 8192;
    let size = ((size + buffer_size - 1) / buffer_size) * buffer_size;

    reader
        .inner_mut()
        .get_mut()
        .prefetch(offset..offset + size)
        .await;

    // Read the contents of the METADATA member
    let mut contents = Vec::new();
    reader
        .reader_with_entry(metadata_idx)
        .await
        .map_err(|e| WheelMetadataError::from_async_zip(metadata_path.clone(), e))?
        .read_to_end_checked(&mut contents)
        .await
        .map_err(|e| WheelMetadataError::from_async_zip(metadata_path, e))?;

    let metadata = CoreMetadata::try_from(contents.as_slice())?;

    let stream = reader.into_inner().into_inner();
    let ranges = stream.requested_ranges().await;
    let total_bytes_fetched: u64 = ranges.iter().map(|r| r.end - r.start).sum();
    tracing::debug!(
        "fetched {} ranges, total of {} bytes, total file length {} ({}%)",
        ranges.len(),
        total_bytes_fetched,
        stream.len(),
        (total_bytes_fetched as f64 / stream.len() as f64 * 100000.0).round() / 100.0
    );

    Ok((contents, metadata))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_find_dist_info_dir() {
        let name = NormalizedPackageName::from_raw("typed-ast");
        let version: Version = "1.5.0".parse().unwrap();
        let dirs = ["typed_ast-1.5.0.dist-info", "typed_ast"];
        assert_eq!(
            find_dist_info_dir(dirs, &name, &version).unwrap(),
            "typed_ast-1.5.0.dist-info"
        );
    }

    #[test]
    fn test_find_dist_info_dir_fallback() {
        let name = NormalizedPackageName::from_raw("foo");
        let version: Version = "1.0".parse().unwrap();
        // Name in the archive does not match, but it is the only candidate
        let dirs = ["bar-2.0.dist-info", "bar"];
        assert_eq!(
            find_dist_info_dir(dirs, &name, &version).unwrap(),
            "bar-2.0.dist-info"
        );
    }

    #[test]
    fn test_find_dist_info_dir_ambiguous() {
        let name = NormalizedPackageName::from_raw("foo");
        let version: Version = "1.0".parse().unwrap();
        let dirs = ["bar-2.0.dist-info", "baz-3.0.dist-info"];
        assert!(matches!(
            find_dist_info_dir(dirs, &name, &version),
            Err(WheelMetadataError::MultipleDistInfoDirs)
        ));
    }
}
