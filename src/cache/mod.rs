//! Response caching — key derivation, storage backends and the middleware
//! that ties them together.
//!
//! A request flows through the cache like this:
//!
//! 1. [`KeyDeriver`] turns the raw path and query into a [`CacheKey`].
//! 2. The active [`CacheBackend`] is asked for the key. A hit is answered
//!    immediately and the origin handler never runs.
//! 3. On a miss a single-use [`CaptureShim`] is armed, the origin handler runs,
//!    and the shim stores the response it produced before handing it back
//!    unchanged.
//!
//! Four backends implement the same contract:
//!
//! | Backend | Suspends | TTL | Survives restart |
//! |---------|----------|-----|------------------|
//! | [`MemoryBackend`]    | no  | yes | no  |
//! | [`FileBackend`]      | no  | no  | yes |
//! | [`MemcachedBackend`] | yes | yes | yes (server side) |
//! | [`RedisBackend`]     | yes | opt-in | yes (server side) |
//!
//! Backend failures never reach the client: a failed lookup is a miss and a
//! failed store is logged.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use std::{fmt, path::PathBuf};

use bytes::Bytes;
use thiserror::Error;

pub mod capture;
pub mod file;
pub mod key;
pub mod memcached;
pub mod memory;
pub mod middleware;
pub mod redis;

pub use capture::CaptureShim;
pub use file::FileBackend;
pub use key::{CacheKey, KeyDeriver};
pub use memcached::{MemcachedBackend, MemcachedConfig};
pub use memory::MemoryBackend;
pub use middleware::CacheMiddleware;
pub use self::redis::{RedisBackend, RedisConfig};

/// Errors reported by cache backends.
///
/// The middleware never surfaces these to clients; they are logged and the
/// request degrades to the origin handler.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("key rejected by backend: {0}")]
    KeyRejected(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("stored payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// Boxed future returned by every [`CacheBackend`] operation.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Which storage technology a backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Memory,
    File,
    Memcached,
    Redis,
}

impl BackendKind {
    /// `true` when operations involve a network round trip.
    ///
    /// Stores against remote backends are spawned rather than awaited, and
    /// lookups are bounded by the middleware's lookup timeout.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::Memcached | Self::Redis)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Memcached => "memcached",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform storage contract shared by every backend.
///
/// A backend owns its handle (map, file, socket) for the life of the process
/// and is shared by all requests, so implementations serialize their own
/// mutations.
///
/// # Contract
///
/// - `get` returns `Ok(None)` for an absent or expired key. An empty payload
///   is `Ok(Some(Bytes::new()))` and is a real cached value.
/// - Once `set` has completed, `get` returns the stored value until the TTL
///   passes or the backend evicts it. An entry is never returned after its
///   deadline.
/// - Backends without TTL support ignore the `ttl` argument.
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Looks up `key`.
    fn get<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, Option<Bytes>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BackendFuture<'a, ()>;

    /// Removes `key`; resolves to whether an entry existed.
    fn delete<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, bool>;

    /// Releases the backend handle. Called once at shutdown.
    fn close(&self) -> BackendFuture<'_, ()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Backend doubles shared by the capture and middleware tests.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    /// Wraps a real backend and counts calls, optionally failing them or
    /// pretending to be remote.
    pub struct Recording {
        pub inner: Arc<dyn CacheBackend>,
        pub kind: BackendKind,
        pub gets: AtomicUsize,
        pub sets: AtomicUsize,
        pub fail_gets: bool,
        pub fail_sets: bool,
        pub hang_gets: bool,
        pub stored: Mutex<Vec<(CacheKey, Bytes, Option<Duration>)>>,
        pub set_done: Option<mpsc::UnboundedSender<()>>,
    }

    impl Recording {
        pub fn over(inner: Arc<dyn CacheBackend>) -> Self {
            Self {
                kind: inner.kind(),
                inner,
                gets: AtomicUsize::new(0),
                sets: AtomicUsize::new(0),
                fail_gets: false,
                fail_sets: false,
                hang_gets: false,
                stored: Mutex::new(Vec::new()),
                set_done: None,
            }
        }

        pub fn memory() -> Self {
            Self::over(Arc::new(MemoryBackend::unbounded()))
        }

        pub fn sets(&self) -> usize {
            self.sets.load(Ordering::SeqCst)
        }

        pub fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    impl CacheBackend for Recording {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn get<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, Option<Bytes>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.hang_gets {
                    std::future::pending::<()>().await;
                }
                if self.fail_gets {
                    return Err(CacheError::Protocol("injected get failure".into()));
                }
                self.inner.get(key).await
            })
        }

        fn set<'a>(
            &'a self,
            key: &'a CacheKey,
            value: Bytes,
            ttl: Option<Duration>,
        ) -> BackendFuture<'a, ()> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.stored.lock().push((key.clone(), value.clone(), ttl));
            Box::pin(async move {
                let result = if self.fail_sets {
                    Err(CacheError::Protocol("injected set failure".into()))
                } else {
                    self.inner.set(key, value, ttl).await
                };
                if let Some(done) = &self.set_done {
                    let _ = done.send(());
                }
                result
            })
        }

        fn delete<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, bool> {
            self.inner.delete(key)
        }

        fn close(&self) -> BackendFuture<'_, ()> {
            self.inner.close()
        }
    }
}
