//! Single-use response capture.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{CacheBackend, CacheKey};
use crate::Response;

/// Armed on a cache miss and consumed when the origin response is emitted.
///
/// [`emit`](Self::emit) takes the shim by value, so a response can be captured
/// at most once per request. Only `2xx` responses are stored; anything else
/// is handed back without touching the backend.
///
/// Stores against remote backends are spawned onto the runtime and the
/// response is returned without waiting for them. Local stores finish before
/// `emit` returns, so the very next lookup already sees the entry.
pub struct CaptureShim {
    key: CacheKey,
    backend: Arc<dyn CacheBackend>,
    ttl: Option<Duration>,
}

impl CaptureShim {
    pub(crate) fn arm(key: CacheKey, backend: Arc<dyn CacheBackend>, ttl: Option<Duration>) -> Self {
        Self { key, backend, ttl }
    }

    /// Records `response` if it is cacheable and returns it unchanged.
    pub async fn emit(self, response: Response) -> Response {
        if !response.status().is_success() {
            debug!(key = %self.key, status = response.status().as_u16(), "response not cached");
            return response;
        }

        let payload = Bytes::copy_from_slice(response.payload());
        if self.backend.kind().is_remote() {
            tokio::spawn(store(self.backend, self.key, payload, self.ttl));
        } else {
            store(self.backend, self.key, payload, self.ttl).await;
        }
        response
    }
}

async fn store(backend: Arc<dyn CacheBackend>, key: CacheKey, payload: Bytes, ttl: Option<Duration>) {
    let size = payload.len();
    match backend.set(&key, payload, ttl).await {
        Ok(()) => debug!(key = %key, backend = %backend.kind(), size, "response cached"),
        Err(e) => warn!(key = %key, backend = %backend.kind(), error = %e, "failed to cache response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use crate::cache::BackendKind;
    use crate::cache::testing::Recording;
    use tokio::sync::mpsc;

    fn key() -> CacheKey {
        CacheKey::new("__rttp__/products")
    }

    #[tokio::test]
    async fn success_is_stored_before_emit_returns() {
        let backend = Arc::new(Recording::memory());
        let shim = CaptureShim::arm(key(), backend.clone(), Some(Duration::from_secs(30)));

        let response = shim
            .emit(Response::new(StatusCode::Ok).body("[1,2]"))
            .await;

        assert_eq!(response.payload(), b"[1,2]");
        assert_eq!(backend.sets(), 1);
        let stored = backend.stored.lock();
        assert_eq!(stored[0].0, key());
        assert_eq!(stored[0].1, Bytes::from_static(b"[1,2]"));
        assert_eq!(stored[0].2, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn errors_pass_through_uncached() {
        for status in [StatusCode::NotFound, StatusCode::InternalServerError] {
            let backend = Arc::new(Recording::memory());
            let shim = CaptureShim::arm(key(), backend.clone(), None);
            let response = shim.emit(Response::new(status).body("nope")).await;
            assert_eq!(response.status(), status);
            assert_eq!(backend.sets(), 0);
        }
    }

    #[tokio::test]
    async fn empty_body_is_stored() {
        let backend = Arc::new(Recording::memory());
        CaptureShim::arm(key(), backend.clone(), None)
            .emit(Response::new(StatusCode::Ok))
            .await;
        assert_eq!(backend.inner.get(&key()).await.unwrap(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let mut recording = Recording::memory();
        recording.fail_sets = true;
        let backend = Arc::new(recording);

        let response = CaptureShim::arm(key(), backend.clone(), None)
            .emit(Response::new(StatusCode::Ok).body("ok"))
            .await;

        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.payload(), b"ok");
        assert_eq!(backend.sets(), 1);
    }

    #[tokio::test]
    async fn remote_store_is_spawned() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut recording = Recording::memory();
        recording.kind = BackendKind::Redis;
        recording.set_done = Some(tx);
        let backend = Arc::new(recording);

        let response = CaptureShim::arm(key(), backend.clone(), None)
            .emit(Response::new(StatusCode::Ok).body("later"))
            .await;
        assert_eq!(response.payload(), b"later");

        rx.recv().await.unwrap();
        assert_eq!(
            backend.inner.get(&key()).await.unwrap(),
            Some(Bytes::from_static(b"later"))
        );
    }
}
