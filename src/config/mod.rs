//! Runtime configuration from flags and environment variables.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;

use crate::cache::{
    CacheBackend, CacheError, CacheMiddleware, FileBackend, KeyDeriver, MemcachedBackend,
    MemcachedConfig, MemoryBackend, RedisBackend, RedisConfig, key::DEFAULT_NAMESPACE,
};

/// Which storage backend serves the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    #[default]
    Memory,
    File,
    Memcached,
    Redis,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "cachegate", version, about = "Cached product catalog over HTTP")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3128)]
    pub port: u16,

    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Cache storage backend
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value_t = BackendChoice::Memory)]
    pub backend: BackendChoice,

    /// Entry lifetime in seconds; 0 disables expiry
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 30)]
    pub ttl_secs: u64,

    /// Maximum entries held by the memory backend
    #[arg(long, env = "CACHE_CAPACITY", default_value = "1024")]
    pub capacity: NonZeroUsize,

    /// Directory holding the file backend's cache file
    #[arg(long, env = "CACHE_DIR", default_value = ".")]
    pub cache_dir: PathBuf,

    /// Name of the file backend's cache file
    #[arg(long, env = "CACHE_ID", default_value = "productsCache")]
    pub cache_id: String,

    #[arg(long, env = "MEMCACHED_ADDR", default_value = "127.0.0.1:11211")]
    pub memcached_addr: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Apply the TTL on Redis entries
    #[arg(long, env = "CACHE_REDIS_EXPIRE")]
    pub redis_expire: bool,

    /// Lookup budget for remote backends, in milliseconds
    #[arg(long, env = "CACHE_LOOKUP_TIMEOUT_MS", default_value_t = 500)]
    pub lookup_timeout_ms: u64,

    /// Simulated catalog query latency, in milliseconds
    #[arg(long, env = "ORIGIN_DELAY_MS", default_value_t = 3000)]
    pub origin_delay_ms: u64,

    /// Prefix of every cache key
    #[arg(long, env = "CACHE_KEY_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub key_namespace: String,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `None` when expiry is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.ttl_secs)).filter(|ttl| !ttl.is_zero())
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn origin_delay(&self) -> Duration {
        Duration::from_millis(self.origin_delay_ms)
    }

    /// Opens the selected backend. Called once at startup.
    ///
    /// # Errors
    ///
    /// A corrupt or unreadable cache file, or an unreachable Redis server.
    /// Memcached connects lazily, so an unreachable server only shows up as
    /// misses.
    pub async fn build_backend(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        let backend: Arc<dyn CacheBackend> = match self.backend {
            BackendChoice::Memory => Arc::new(MemoryBackend::new(self.capacity)),
            BackendChoice::File => Arc::new(FileBackend::open(&self.cache_dir, &self.cache_id)?),
            BackendChoice::Memcached => {
                let memcached =
                    MemcachedBackend::new(MemcachedConfig::new(self.memcached_addr.clone()));
                info!(addr = %memcached.addr(), "memcached backend connects on first use");
                Arc::new(memcached)
            }
            BackendChoice::Redis => Arc::new(
                RedisBackend::connect(RedisConfig {
                    expire: self.redis_expire,
                    ..RedisConfig::new(self.redis_url.clone())
                })
                .await?,
            ),
        };
        info!(backend = %backend.kind(), ttl = ?self.ttl(), "cache backend ready");
        Ok(backend)
    }

    /// The cache layer configured from these settings.
    pub fn cache_middleware(&self, backend: Arc<dyn CacheBackend>) -> CacheMiddleware {
        let cache = CacheMiddleware::new(backend)
            .key_deriver(KeyDeriver::new(self.key_namespace.clone()))
            .lookup_timeout(self.lookup_timeout());
        match self.ttl() {
            Some(ttl) => cache.ttl(ttl),
            None => cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BackendKind;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("cachegate").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen_addr(), "127.0.0.1:3128");
        assert_eq!(config.backend, BackendChoice::Memory);
        assert_eq!(config.ttl(), Some(Duration::from_secs(30)));
        assert_eq!(config.capacity.get(), 1024);
        assert_eq!(config.cache_id, "productsCache");
        assert_eq!(config.lookup_timeout(), Duration::from_millis(500));
        assert_eq!(config.origin_delay(), Duration::from_secs(3));
        assert_eq!(config.key_namespace, "__rttp__");
        assert!(!config.redis_expire);
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--port",
            "8080",
            "--backend",
            "memcached",
            "--ttl-secs",
            "0",
            "--redis-expire",
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.backend, BackendChoice::Memcached);
        assert_eq!(config.ttl(), None);
        assert!(config.redis_expire);
    }

    #[tokio::test]
    async fn largest_ttl_is_accepted_and_stored() {
        let config = parse(&["--ttl-secs", "18446744073709551615"]);
        assert_eq!(config.ttl(), Some(Duration::from_secs(u64::MAX)));

        let backend = config.build_backend().await.unwrap();
        let key = crate::cache::CacheKey::new("__rttp__/products");
        backend
            .set(&key, bytes::Bytes::from_static(b"[]"), config.ttl())
            .await
            .unwrap();
        assert!(backend.get(&key).await.unwrap().is_some());
    }

    #[test]
    fn rejects_unknown_backend_and_zero_capacity() {
        assert!(Config::try_parse_from(["cachegate", "--backend", "sqlite"]).is_err());
        assert!(Config::try_parse_from(["cachegate", "--capacity", "0"]).is_err());
    }

    #[tokio::test]
    async fn builds_local_backends() {
        let dir = tempfile::tempdir().unwrap();
        let memory = parse(&[]).build_backend().await.unwrap();
        assert_eq!(memory.kind(), BackendKind::Memory);

        let dir_arg = dir.path().to_string_lossy().into_owned();
        let file = parse(&["--backend", "file", "--cache-dir", dir_arg.as_str()])
            .build_backend()
            .await
            .unwrap();
        assert_eq!(file.kind(), BackendKind::File);

        let memcached = parse(&["--backend", "memcached"]).build_backend().await.unwrap();
        assert_eq!(memcached.kind(), BackendKind::Memcached);
    }
}
