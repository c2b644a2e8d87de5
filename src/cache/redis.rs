//! Redis backend over one managed, multiplexed connection.
//!
//! Every request shares the same [`ConnectionManager`]; commands from
//! concurrent requests are pipelined through its connection in the order they
//! are issued. When that connection drops, the command that noticed fails and
//! the manager reconnects in the background, so the cache comes back on its
//! own once the server does. Payloads are stored as base64 text so any byte
//! sequence survives clients that treat values as strings.

use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::{ConnectionManager, ConnectionManagerConfig};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use tokio::time::timeout;
use tracing::debug;

use super::{BackendFuture, BackendKind, CacheBackend, CacheError, CacheKey};

/// Connection settings for [`RedisBackend`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Apply the TTL passed to `set` with `SETEX`. Off by default: entries
    /// then live until Redis evicts them.
    pub expire: bool,
    pub connect_timeout: Duration,
    /// Attempts per reconnect before pending commands are failed.
    pub reconnect_retries: usize,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
            expire: false,
            connect_timeout: Duration::from_secs(2),
            reconnect_retries: 3,
        }
    }
}

pub struct RedisBackend {
    conn: ConnectionManager,
    expire: bool,
}

impl RedisBackend {
    /// Opens the shared connection.
    ///
    /// # Errors
    ///
    /// [`CacheError::Redis`] for an invalid URL or a refused connection,
    /// [`CacheError::Timeout`] if the server does not answer in time.
    pub async fn connect(config: RedisConfig) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(config.url.as_str())?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connect_timeout)
            .set_number_of_retries(config.reconnect_retries);
        let conn = timeout(
            config.connect_timeout,
            ConnectionManager::new_with_config(client, manager_config),
        )
        .await
        .map_err(|_| CacheError::Timeout {
            operation: "redis connect",
            after: config.connect_timeout,
        })??;
        debug!(url = %config.url, "redis connection established");
        Ok(Self {
            conn,
            expire: config.expire,
        })
    }

    /// Whole seconds for `SETEX`, rounded up; `None` when no expiry applies.
    fn expiry_secs(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.filter(|_| self.expire)
            .map(|ttl| ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0)))
            .filter(|secs| *secs > 0)
    }
}

impl CacheBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn get<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, Option<Bytes>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let stored: Option<String> = conn.get(key.as_str()).await?;
            stored.as_deref().map(decode_payload).transpose()
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BackendFuture<'a, ()> {
        let mut conn = self.conn.clone();
        let ttl_secs = self.expiry_secs(ttl);
        Box::pin(async move {
            let encoded = encode_payload(&value);
            match ttl_secs {
                Some(secs) => conn.set_ex::<_, _, ()>(key.as_str(), encoded, secs).await?,
                None => conn.set::<_, _, ()>(key.as_str(), encoded).await?,
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, bool> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let removed: i64 = conn.del(key.as_str()).await?;
            Ok(removed > 0)
        })
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        // The connection shuts down when the last manager clone drops.
        Box::pin(std::future::ready(Ok(())))
    }
}

fn encode_payload(value: &[u8]) -> String {
    BASE64.encode(value)
}

fn decode_payload(stored: &str) -> Result<Bytes, CacheError> {
    Ok(Bytes::from(BASE64.decode(stored)?))
}
