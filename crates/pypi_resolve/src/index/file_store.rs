// Implementation comes from https://github.com/njsmith/posy/blob/main/src/kvstore.rs
// Licensed under MIT or Apache-2.0

use crate::utils::retry_interrupted;
use fs4::FileExt;
use std::{
    fs,
    fs::File,
    io,
    io::{Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

/// Types that can be used as keys of the [`FileStore`].
pub trait CacheKey {
    /// Returns the path suffix that should be used to store the data for this key.
    fn key(&self) -> PathBuf;
}

impl<T: CacheKey + ?Sized> CacheKey for &T {
    fn key(&self) -> PathBuf {
        (*self).key()
    }
}

impl CacheKey for [u8] {
    fn key(&self) -> PathBuf {
        let hash = rattler_digest::compute_bytes_digest::<rattler_digest::Sha256>(self);
        bytes_to_path_suffix(hash.as_slice())
    }
}

impl CacheKey for str {
    fn key(&self) -> PathBuf {
        self.as_bytes().key()
    }
}

// Some filesystems don't cope well with a single directory containing lots of files,
// so the entries are dispersed over nested directories. With a nesting depth of 3 and
// a fanout of 64 paths look like ${BASE}/${CHAR}/${CHAR}/${CHAR}/${ENTRY}, splitting
// the files over 64**3 = 262144 directories.
const DIR_NEST_DEPTH: usize = 3;

fn bytes_to_path_suffix(bytes: &[u8]) -> PathBuf {
    let mut path = PathBuf::new();
    let enc = data_encoding::BASE64URL_NOPAD.encode(bytes);
    for i in 0..DIR_NEST_DEPTH {
        path.push(&enc[i..i + 1]);
    }
    path.push(&enc[DIR_NEST_DEPTH..]);
    path
}

/// A bucket of blobs on the filesystem, safe against concurrent use: readers and
/// writers take a per-entry lock file, and writes land in a temporary sibling that is
/// atomically renamed into place. Concurrent renames into the same destination are
/// tolerated, the loser's work is discarded.
#[derive(Debug)]
pub struct FileStore {
    base: PathBuf,
    tmp: PathBuf,
}

impl FileStore {
    /// Constructs a new instance rooted at the given `base`.
    pub fn new(base: &Path) -> io::Result<Self> {
        fs::create_dir_all(base)?;

        // Get the canonical path now that we are sure the directory exists
        let base = base.canonicalize()?;

        // The temporary folder lives inside the base folder so both are on the same
        // filesystem and the rename is atomic.
        let tmp = base.join(".tmp");
        fs::create_dir_all(&tmp)?;

        Ok(Self { base, tmp })
    }

    /// Gets readable access to the data with the specified key. If no such entry
    /// exists the function `f` is called to populate the entry.
    pub fn get_or_set<K: CacheKey + ?Sized, F>(&self, key: &K, f: F) -> io::Result<impl Read + Seek>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let lock = self.lock(key)?;
        if let Some(reader) = lock.reader() {
            // If the file exists its content is immutable, no need to hold the lock
            // while reading.
            Ok(reader.detach_unlocked())
        } else {
            let mut writer = lock.begin()?;
            f(&mut writer)?;
            Ok(writer.commit()?.detach_unlocked())
        }
    }

    /// Gets readable access to the data with the specified key. Returns `None` if no
    /// such key exists in the store.
    pub fn get<K: CacheKey + ?Sized>(&self, key: &K) -> Option<impl Read + Seek> {
        if let Some(lock) = self.lock_if_exists(key) {
            if let Some(reader) = lock.reader() {
                return Some(reader.detach_unlocked());
            }
        }
        None
    }

    /// Locks a certain entry for exclusive access.
    pub fn lock<K: CacheKey + ?Sized>(&self, key: &K) -> io::Result<FileLock> {
        let path = self.base.join(key.key());
        let lock = lock(&path, LockMode::Lock)?;
        Ok(FileLock {
            tmp: self.tmp.clone(),
            _lock_file: lock,
            path,
        })
    }

    /// Locks a certain entry for exclusive access, but only if it exists. This avoids
    /// creating directory trees just to find out an entry is absent.
    fn lock_if_exists<K: CacheKey + ?Sized>(&self, key: &K) -> Option<FileLock> {
        let path = self.base.join(key.key());
        lock(&path, LockMode::IfExists).ok().map(|lock| FileLock {
            tmp: self.tmp.clone(),
            _lock_file: lock,
            path,
        })
    }
}

/// Write access to a locked [`FileStore`] entry. The data is written to a temporary
/// file and only becomes visible under the entry's path after [`LockedWriter::commit`].
pub struct LockedWriter<'a> {
    path: &'a Path,
    f: tempfile::NamedTempFile,
}

impl<'a> Write for LockedWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.f.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.f.flush()
    }
}

impl<'a> Seek for LockedWriter<'a> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.f.seek(pos)
    }
}

impl<'a> LockedWriter<'a> {
    /// Persist the content written so far and reopen it for reading.
    pub fn commit(self) -> io::Result<LockedReader<'a>> {
        self.f.as_file().sync_data()?;
        let mut file = self.f.persist(self.path)?;
        file.rewind()?;
        Ok(LockedReader {
            file,
            _data: Default::default(),
        })
    }
}

/// Read access to a locked [`FileStore`] entry.
pub struct LockedReader<'a> {
    file: File,
    _data: PhantomData<&'a ()>,
}

impl<'a> Read for LockedReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl<'a> Seek for LockedReader<'a> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl<'a> LockedReader<'a> {
    /// Returns the underlying file, giving up the lock.
    pub fn detach_unlocked(self) -> File {
        self.file
    }
}

/// Holds the lock on a [`FileStore`] entry; hands out readers and writers.
pub struct FileLock {
    /// A directory for temporary files, on the same filesystem as `path`.
    tmp: PathBuf,

    /// As long as this file is kept open this instance has exclusive access.
    _lock_file: File,

    /// The path of the entry that is actually locked.
    path: PathBuf,
}

impl FileLock {
    /// Creates a reader for the contents of the locked entry. Returns `None` if the
    /// entry does not exist yet.
    pub fn reader(&self) -> Option<LockedReader> {
        Some(LockedReader {
            file: File::open(&self.path).ok()?,
            _data: Default::default(),
        })
    }

    /// Starts writing the entry. Call [`LockedWriter::commit`] to persist the data.
    pub fn begin(&self) -> io::Result<LockedWriter> {
        Ok(LockedWriter {
            path: &self.path,
            f: tempfile::NamedTempFile::new_in(&self.tmp)?,
        })
    }

    /// Removes the entry from the store.
    pub fn remove(self) -> io::Result<()> {
        fs::remove_file(self.path)?;
        Ok(())
    }
}

#[derive(Eq, PartialEq)]
enum LockMode {
    Lock,
    IfExists,
}

/// Create a `.lock` file for the file at the specified `path`. Only a single process
/// has access to the lock-file at a time.
fn lock(path: &Path, mode: LockMode) -> io::Result<File> {
    let lock_path = path.with_extension(".lock");

    // On windows the file must be open as write to ensure it cannot be opened by
    // another process.
    let mut open_options = fs::OpenOptions::new();
    open_options.write(true);

    // Only create the parent directories when we actually intend to write.
    if mode == LockMode::Lock {
        let dir = lock_path
            .parent()
            .expect("expected the file to be rooted in some folder");
        fs::create_dir_all(dir)?;
        open_options.create(true);
    }

    let lock = open_options.open(&lock_path)?;

    // flock(2) does not handle EINTR, keep retrying when that happens.
    retry_interrupted(|| lock.lock_exclusive())?;

    Ok(lock)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let hello = b"Hello, world!".as_slice();

        let mut read_back = Vec::new();
        store
            .get_or_set(hello, |w| w.write_all(hello))
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, hello);

        // A second get_or_set must not invoke the setter again
        let mut read_back = Vec::new();
        store
            .get_or_set(hello, |_| panic!("entry should have been cached"))
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, hello);
    }

    #[test]
    fn test_get_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.get("no such key").is_none());
    }
}
