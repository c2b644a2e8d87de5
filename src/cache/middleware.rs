//! The response cache as a middleware layer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{CacheBackend, CacheError, CacheKey, CaptureShim, KeyDeriver};
use crate::context::Context;
use crate::middleware::{BoxResponseFuture, Middleware, Next};
use crate::{Response, StatusCode};

/// Header reporting whether a response came from the cache.
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

struct CacheSettings {
    backend: Arc<dyn CacheBackend>,
    keys: KeyDeriver,
    ttl: Option<Duration>,
    lookup_timeout: Duration,
    content_type: String,
}

/// Serves `GET` responses from a [`CacheBackend`] and fills it on misses.
///
/// On a hit the stored payload is returned as `200 OK` and the rest of the
/// chain never runs. On a miss the request is forwarded, and a successful
/// downstream response is stored under the request's key before (local
/// backends) or while (remote backends) it is returned. Either way the
/// response carries `X-Cache: HIT` or `X-Cache: MISS`.
///
/// Other methods pass straight through. Backend errors are logged and treated
/// as misses; lookups against remote backends that take longer than the
/// lookup timeout are abandoned the same way.
///
/// On a miss the derived [`CacheKey`] is placed in the request extensions for
/// downstream handlers.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use cachegate::cache::{CacheMiddleware, MemoryBackend};
///
/// let cache = CacheMiddleware::new(Arc::new(MemoryBackend::unbounded()))
///     .ttl(Duration::from_secs(30));
/// ```
#[derive(Clone)]
pub struct CacheMiddleware {
    settings: Arc<CacheSettings>,
}

impl CacheMiddleware {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            settings: Arc::new(CacheSettings {
                backend,
                keys: KeyDeriver::default(),
                ttl: None,
                lookup_timeout: Duration::from_millis(500),
                content_type: "application/json".to_owned(),
            }),
        }
    }

    /// Entry lifetime passed to the backend. Zero means entries never expire.
    #[must_use]
    pub fn ttl(self, ttl: Duration) -> Self {
        self.map_settings(|s| s.ttl = Some(ttl).filter(|ttl| !ttl.is_zero()))
    }

    #[must_use]
    pub fn key_deriver(self, keys: KeyDeriver) -> Self {
        self.map_settings(|s| s.keys = keys)
    }

    /// Upper bound on a lookup against a remote backend.
    #[must_use]
    pub fn lookup_timeout(self, lookup_timeout: Duration) -> Self {
        self.map_settings(|s| s.lookup_timeout = lookup_timeout)
    }

    /// `Content-Type` of responses served from the cache.
    #[must_use]
    pub fn content_type(self, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        self.map_settings(|s| s.content_type = content_type)
    }

    fn map_settings(self, f: impl FnOnce(&mut CacheSettings)) -> Self {
        let mut settings = match Arc::try_unwrap(self.settings) {
            Ok(settings) => settings,
            Err(shared) => CacheSettings {
                backend: Arc::clone(&shared.backend),
                keys: shared.keys.clone(),
                ttl: shared.ttl,
                lookup_timeout: shared.lookup_timeout,
                content_type: shared.content_type.clone(),
            },
        };
        f(&mut settings);
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl CacheSettings {
    async fn lookup(&self, key: &CacheKey) -> Option<Bytes> {
        let kind = self.backend.kind();
        let result = if kind.is_remote() {
            timeout(self.lookup_timeout, self.backend.get(key))
                .await
                .unwrap_or_else(|_| {
                    Err(CacheError::Timeout {
                        operation: "cache lookup",
                        after: self.lookup_timeout,
                    })
                })
        } else {
            self.backend.get(key).await
        };

        result.unwrap_or_else(|e| {
            warn!(key = %key, backend = %kind, error = %e, "cache lookup failed, falling back to origin");
            None
        })
    }

    fn hit(&self, payload: Bytes) -> Response {
        Response::new(StatusCode::Ok)
            .header("Content-Type", self.content_type.as_str())
            .header(CACHE_STATUS_HEADER, "HIT")
            .body_bytes(Vec::from(payload))
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponseFuture {
        let settings = Arc::clone(&self.settings);
        Box::pin(async move {
            if !ctx.request().method().is_cacheable() {
                return next.run(ctx).await;
            }

            let key = settings.keys.derive(ctx.request());
            if let Some(payload) = settings.lookup(&key).await {
                debug!(key = %key, size = payload.len(), "cache hit");
                return settings.hit(payload);
            }

            debug!(key = %key, "cache miss");
            let shim = CaptureShim::arm(key.clone(), Arc::clone(&settings.backend), settings.ttl);
            ctx.extensions_mut().insert(key);
            let mut response = shim.emit(next.run(ctx).await).await;
            response.set_header(CACHE_STATUS_HEADER, "MISS");
            response
        })
    }
}
