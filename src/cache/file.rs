//! File-backed backend: an index held in memory and rewritten to disk in full
//! after every mutation.
//!
//! On-disk layout: one JSON object in a file named after the cache identifier,
//! mapping each key to its base64 payload and the Unix time it was stored:
//!
//! ```json
//! {"__rttp__/products":{"value":"W3siaWQiOjF9XQ==","stored_at":1760572800}}
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BackendFuture, BackendKind, CacheBackend, CacheError, CacheKey};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    stored_at: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    value: String,
    stored_at: u64,
}

/// Persistent single-process backend.
///
/// The whole index is loaded when the backend is opened and every `set`,
/// `delete` or [`clear`](Self::clear) writes a complete replacement file
/// (temporary file, then rename) while holding the index lock. A failed write
/// leaves the previous file untouched and rolls the in-memory index back, so
/// memory and disk never disagree.
///
/// Entries have no TTL; they live until deleted or cleared.
pub struct FileBackend {
    path: PathBuf,
    index: Mutex<BTreeMap<CacheKey, Entry>>,
}

impl FileBackend {
    /// Opens (or starts) the cache file `dir/cache_id`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Io`] if an existing file cannot be read.
    /// - [`CacheError::Corrupt`] if it is not a valid cache file.
    pub fn open(dir: impl AsRef<Path>, cache_id: &str) -> Result<Self, CacheError> {
        let path = dir.as_ref().join(cache_id);
        let index = match fs::read(&path) {
            Ok(raw) => decode_index(&path, &raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        debug!(path = %path.display(), entries = index.len(), "file cache loaded");
        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry and persists the empty index.
    pub fn clear(&self) -> Result<(), CacheError> {
        let mut index = self.index.lock();
        let previous = std::mem::take(&mut *index);
        if let Err(e) = self.persist(&index) {
            *index = previous;
            return Err(e);
        }
        Ok(())
    }

    fn store(&self, key: &CacheKey, value: Bytes) -> Result<(), CacheError> {
        let mut index = self.index.lock();
        let entry = Entry {
            value,
            stored_at: unix_now(),
        };
        let previous = index.insert(key.clone(), entry);
        if let Err(e) = self.persist(&index) {
            match previous {
                Some(old) => index.insert(key.clone(), old),
                None => index.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut index = self.index.lock();
        let Some(old) = index.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&index) {
            index.insert(key.clone(), old);
            return Err(e);
        }
        Ok(true)
    }

    fn persist(&self, index: &BTreeMap<CacheKey, Entry>) -> Result<(), CacheError> {
        let persisted: BTreeMap<&str, PersistedEntry> = index
            .iter()
            .map(|(key, entry)| {
                (
                    key.as_str(),
                    PersistedEntry {
                        value: BASE64.encode(&entry.value),
                        stored_at: entry.stored_at,
                    },
                )
            })
            .collect();
        let raw = serde_json::to_vec(&persisted)?;

        let tmp = self.tmp_path();
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|source| {
            let _ = fs::remove_file(&tmp);
            CacheError::Io {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn decode_index(path: &Path, raw: &[u8]) -> Result<BTreeMap<CacheKey, Entry>, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let persisted: BTreeMap<String, PersistedEntry> =
        serde_json::from_slice(raw).map_err(|e| corrupt(e.to_string()))?;

    persisted
        .into_iter()
        .map(|(key, entry)| -> Result<(CacheKey, Entry), CacheError> {
            let value = BASE64
                .decode(entry.value.as_bytes())
                .map_err(|e| corrupt(format!("entry {key}: {e}")))?;
            Ok((
                CacheKey::new(key),
                Entry {
                    value: Bytes::from(value),
                    stored_at: entry.stored_at,
                },
            ))
        })
        .collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl CacheBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn get<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, Option<Bytes>> {
        let hit = self.index.lock().get(key).map(|entry| entry.value.clone());
        Box::pin(std::future::ready(Ok(hit)))
    }

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        value: Bytes,
        _ttl: Option<Duration>,
    ) -> BackendFuture<'a, ()> {
        Box::pin(std::future::ready(self.store(key, value)))
    }

    fn delete<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, bool> {
        Box::pin(std::future::ready(self.remove(key)))
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        // Every mutation is already on disk.
        Box::pin(std::future::ready(Ok(())))
    }
}
