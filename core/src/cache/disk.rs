//! Disk-backed tier holding downloaded image bytes alongside their write timestamps.
//!
//! Every entry is a pair of files inside a dedicated namespace directory:
//!
//! ```text
//! <root>/Vermeil.ImageCache/<KEY>.data     raw image bytes
//! <root>/Vermeil.ImageCache/<KEY>.tstamp   UTC write time, `YYYY-MM-DD HH:MM:SSZ`
//! ```
//!
//! The filesystem gives no atomicity across the two files, so all access goes through one mutex.
//! A timestamp that is missing or unreadable makes the entry count as expired.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Error};
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::types::CacheKey;

use super::Result;

/// Namespace directory kept apart from any other application data under the root.
pub const STORE_DIRECTORY_NAME: &str = "Vermeil.ImageCache";
pub const DATA_EXTENSION: &str = "data";
pub const TIMESTAMP_EXTENSION: &str = "tstamp";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

/// Persistent key/value blob store with per-entry write timestamps.
#[derive(Debug)]
pub struct PersistentStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl PersistentStore {
    /// Create or reuse a store under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let dir = root.into().join(STORE_DIRECTORY_NAME);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating image store directory at {}", dir.display()))?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    /// Directory holding the entry files.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{DATA_EXTENSION}"))
    }

    pub fn timestamp_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{TIMESTAMP_EXTENSION}"))
    }

    pub fn exists(&self, key: &CacheKey) -> bool {
        let _guard = self.lock.lock();
        self.data_path(key).is_file()
    }

    /// Read the stored bytes regardless of age.
    pub fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock();
        self.read_unlocked(key)
    }

    /// Read the stored bytes if the entry is no older than `max_age` at `now`.
    ///
    /// An expired entry is deleted before returning `None`.
    pub fn read_fresh(
        &self,
        key: &CacheKey,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock();
        if !self.data_path(key).is_file() {
            return Ok(None);
        }
        if is_expired(self.read_timestamp_unlocked(key), max_age, now) {
            debug!(target: "cache::disk", key = %key, "entry expired on read");
            self.delete_unlocked(key)?;
            return Ok(None);
        }
        self.read_unlocked(key)
    }

    /// Write time of an entry, or [`DateTime::<Utc>::MIN_UTC`] when it cannot be determined.
    pub fn read_timestamp(&self, key: &CacheKey) -> DateTime<Utc> {
        let _guard = self.lock.lock();
        self.read_timestamp_unlocked(key)
    }

    /// Whether `key` is stored and not yet expired. Never deletes anything.
    pub fn is_fresh(&self, key: &CacheKey, max_age: Duration, now: DateTime<Utc>) -> bool {
        let _guard = self.lock.lock();
        self.data_path(key).is_file()
            && !is_expired(self.read_timestamp_unlocked(key), max_age, now)
    }

    /// Persist bytes stamped with the current time.
    pub fn write(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        self.write_at(key, bytes, Utc::now())
    }

    /// Persist bytes with an explicit write time.
    ///
    /// On failure neither artifact is left behind for `key`.
    pub fn write_at(&self, key: &CacheKey, bytes: &[u8], written_at: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock.lock();
        let stamp = written_at.format(TIMESTAMP_FORMAT).to_string();

        let result = self
            .persist(&self.data_path(key), bytes)
            .and_then(|()| self.persist(&self.timestamp_path(key), stamp.as_bytes()));

        if let Err(err) = result {
            if let Err(cleanup) = self.delete_unlocked(key) {
                trace!(target: "cache::disk", key = %key, "cleanup after failed write: {cleanup:#}")
            }
            return Err(err);
        }

        trace!(target: "cache::disk", key = %key, bytes = bytes.len(), "stored");
        Ok(())
    }

    /// Remove both artifacts for `key`. Missing files are not an error.
    pub fn delete(&self, key: &CacheKey) -> Result<()> {
        let _guard = self.lock.lock();
        self.delete_unlocked(key)
    }

    /// Keys of every stored data artifact.
    pub fn list_keys(&self) -> Result<Vec<CacheKey>> {
        let _guard = self.lock.lock();
        self.keys_with_extension(DATA_EXTENSION)
    }

    /// Remove every file in the namespace directory, returning how many were deleted.
    ///
    /// Individual failures do not stop the sweep; the first one is reported at the end.
    pub fn delete_all(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("reading image store at {}", self.dir.display()))?;

        let mut removed = 0;
        let mut first_error: Option<Error> = None;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    let err = Error::from(err).context(format!("removing {}", path.display()));
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    /// Delete every entry older than `max_age` at `now`, returning how many entries were removed.
    ///
    /// Timestamp files whose data file is gone are swept as well. An entry that cannot be
    /// deleted does not stop the sweep; the first failure is reported once it finishes.
    pub fn prune_expired(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut removed = 0;
        let mut first_error: Option<Error> = None;

        for key in self.keys_with_extension(DATA_EXTENSION)? {
            if !is_expired(self.read_timestamp_unlocked(&key), max_age, now) {
                continue;
            }
            match self.delete_unlocked(&key) {
                Ok(()) => removed += 1,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        for key in self.keys_with_extension(TIMESTAMP_EXTENSION)? {
            if self.data_path(&key).exists() {
                continue;
            }
            if let Err(err) = remove_if_present(&self.timestamp_path(&key)) {
                first_error.get_or_insert(err);
            }
        }

        if removed > 0 {
            debug!(target: "cache::disk", removed, "pruned expired entries");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    fn read_unlocked(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let path = self.data_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::from(err).context(format!("reading {}", path.display()))),
        }
    }

    fn read_timestamp_unlocked(&self, key: &CacheKey) -> DateTime<Utc> {
        fs::read_to_string(self.timestamp_path(key))
            .ok()
            .and_then(|text| parse_timestamp(&text))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn delete_unlocked(&self, key: &CacheKey) -> Result<()> {
        let data = remove_if_present(&self.data_path(key));
        let stamp = remove_if_present(&self.timestamp_path(key));
        data.and(stamp)
    }

    fn persist(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("allocating temp file in {}", self.dir.display()))?;
        tmp.write_all(bytes).with_context(|| format!("writing {}", path.display()))?;
        tmp.flush().with_context(|| format!("flushing {}", path.display()))?;
        tmp.persist(path).map_err(|err| Error::from(err.error))?;
        Ok(())
    }

    fn keys_with_extension(&self, extension: &str) -> Result<Vec<CacheKey>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("reading image store at {}", self.dir.display()))?;

        let mut keys: Vec<CacheKey> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(extension))
            .filter_map(|path| {
                path.file_stem().and_then(|stem| stem.to_str()).and_then(CacheKey::parse)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::from(err).context(format!("removing {}", path.display()))),
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.with_timezone(&Utc)))
}

fn is_expired(written_at: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
    if written_at == DateTime::<Utc>::MIN_UTC {
        return true;
    }
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| written_at.checked_add_signed(age))
        .is_some_and(|deadline| deadline < now)
}
