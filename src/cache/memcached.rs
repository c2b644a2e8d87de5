//! Distributed backend speaking the memcached text protocol.
//!
//! Only the commands the cache needs are implemented: `get`, `set`, `delete`
//! and `quit`. The client keeps a single connection, opened on first use and
//! dropped after any transport or protocol error so the next call reconnects.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::{BackendFuture, BackendKind, CacheBackend, CacheError, CacheKey};

/// Longest key the protocol accepts.
const MAX_KEY_LEN: usize = 250;

/// Largest value block accepted from the server.
const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;

/// Expiration values above this many seconds are read by the server as an
/// absolute Unix timestamp.
const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;

/// Connection settings for [`MemcachedBackend`].
#[derive(Debug, Clone)]
pub struct MemcachedConfig {
    /// `host:port` of the server.
    pub addr: String,
    pub connect_timeout: Duration,
    /// Bound on a single command round trip.
    pub io_timeout: Duration,
}

impl MemcachedConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:11211".to_owned(),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(1),
        }
    }
}

/// Backend shared by many processes through a memcached server.
///
/// Concurrent writers to the same key race and the last write wins. TTLs are
/// sent in whole seconds, rounded up so a sub-second TTL still expires.
pub struct MemcachedBackend {
    config: MemcachedConfig,
    conn: Mutex<Option<Connection>>,
}

impl MemcachedBackend {
    /// Creates the client. No connection is opened until the first command.
    pub fn new(config: MemcachedConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    async fn connect(&self) -> Result<Connection, CacheError> {
        let addr = &self.config.addr;
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CacheError::Timeout {
                operation: "memcached connect",
                after: self.config.connect_timeout,
            })?
            .map_err(|source| CacheError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!(addr = %addr, "memcached connection established");
        Ok(Connection {
            stream: BufReader::new(stream),
        })
    }

    /// Runs one command on the shared connection, reconnecting if needed.
    ///
    /// The connection is taken out of its slot for the round trip and put
    /// back only after a complete reply. If the caller drops this future
    /// mid-command, the half-used connection is dropped with it and the next
    /// command starts on a fresh one.
    async fn execute(&self, command: Command<'_>) -> Result<Reply, CacheError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let reply = timeout(self.config.io_timeout, conn.execute(&command))
            .await
            .map_err(|_| CacheError::Timeout {
                operation: command.name(),
                after: self.config.io_timeout,
            })??;
        *slot = Some(conn);
        Ok(reply)
    }
}

impl CacheBackend for MemcachedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memcached
    }

    fn get<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let key = validate_key(key)?;
            match self.execute(Command::Get { key }).await? {
                Reply::Value(value) => Ok(Some(value)),
                Reply::Miss => Ok(None),
                other => Err(unexpected("get", other)),
            }
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let key = validate_key(key)?;
            let exptime = expiry_field(ttl, SystemTime::now());
            match self.execute(Command::Set { key, value, exptime }).await? {
                Reply::Stored => Ok(()),
                other => Err(unexpected("set", other)),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let key = validate_key(key)?;
            match self.execute(Command::Delete { key }).await? {
                Reply::Deleted => Ok(true),
                Reply::NotFound => Ok(false),
                other => Err(unexpected("delete", other)),
            }
        })
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut conn) = self.conn.lock().await.take() {
                // The server closes without replying to `quit`.
                let _ = conn.stream.get_mut().write_all(b"quit\r\n").await;
                let _ = conn.stream.get_mut().shutdown().await;
                debug!(addr = %self.config.addr, "memcached connection closed");
            }
            Ok(())
        })
    }
}

enum Command<'a> {
    Get { key: &'a str },
    Set { key: &'a str, value: Bytes, exptime: u64 },
    Delete { key: &'a str },
}

impl Command<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "memcached get",
            Self::Set { .. } => "memcached set",
            Self::Delete { .. } => "memcached delete",
        }
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Self::Get { key } => buf.put_slice(format!("get {key}\r\n").as_bytes()),
            Self::Set { key, value, exptime } => {
                buf.reserve(value.len() + key.len() + 32);
                buf.put_slice(format!("set {key} 0 {exptime} {}\r\n", value.len()).as_bytes());
                buf.put_slice(value);
                buf.put_slice(b"\r\n");
            }
            Self::Delete { key } => buf.put_slice(format!("delete {key}\r\n").as_bytes()),
        }
        buf
    }
}

#[derive(Debug)]
enum Reply {
    Value(Bytes),
    Miss,
    Stored,
    NotStored,
    Deleted,
    NotFound,
}

struct Connection {
    stream: BufReader<TcpStream>,
}

impl Connection {
    async fn execute(&mut self, command: &Command<'_>) -> Result<Reply, CacheError> {
        self.stream.get_mut().write_all(&command.encode()).await?;
        self.stream.get_mut().flush().await?;

        let line = self.read_line().await?;
        match command {
            Command::Get { key } => self.read_retrieval(key, &line).await,
            Command::Set { .. } | Command::Delete { .. } => match line.as_str() {
                "STORED" => Ok(Reply::Stored),
                "NOT_STORED" => Ok(Reply::NotStored),
                "DELETED" => Ok(Reply::Deleted),
                "NOT_FOUND" => Ok(Reply::NotFound),
                other => Err(server_error(other)),
            },
        }
    }

    async fn read_retrieval(&mut self, key: &str, header: &str) -> Result<Reply, CacheError> {
        if header == "END" {
            return Ok(Reply::Miss);
        }

        // VALUE <key> <flags> <bytes> [<cas unique>]
        let mut fields = header.split(' ');
        let (Some("VALUE"), Some(got_key), Some(_flags), Some(len)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(server_error(header));
        };
        if got_key != key {
            return Err(CacheError::Protocol(format!(
                "memcached answered for key {got_key:?}, expected {key:?}"
            )));
        }
        let len: usize = len
            .parse()
            .ok()
            .filter(|len| *len <= MAX_VALUE_LEN)
            .ok_or_else(|| CacheError::Protocol(format!("bad value length in {header:?}")))?;

        let mut data = vec![0u8; len + 2];
        self.stream.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
            return Err(CacheError::Protocol("value block not terminated by CRLF".into()));
        }
        data.truncate(len);

        let trailer = self.read_line().await?;
        if trailer != "END" {
            return Err(server_error(&trailer));
        }
        Ok(Reply::Value(Bytes::from(data)))
    }

    async fn read_line(&mut self) -> Result<String, CacheError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(CacheError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "memcached closed the connection",
            )));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(line)
    }
}

fn server_error(line: &str) -> CacheError {
    CacheError::Protocol(format!("memcached replied {line:?}"))
}

fn unexpected(operation: &str, reply: Reply) -> CacheError {
    CacheError::Protocol(format!("unexpected reply to {operation}: {reply:?}"))
}

/// Rejects keys the server would refuse: too long, or containing whitespace or
/// control bytes.
fn validate_key(key: &CacheKey) -> Result<&str, CacheError> {
    let raw = key.as_str();
    if raw.is_empty() || raw.len() > MAX_KEY_LEN {
        return Err(CacheError::KeyRejected(format!(
            "memcached keys must be 1..={MAX_KEY_LEN} bytes, got {}",
            raw.len()
        )));
    }
    if raw.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(CacheError::KeyRejected(format!(
            "memcached keys cannot contain whitespace or control bytes: {raw:?}"
        )));
    }
    Ok(raw)
}

/// Converts a TTL to the protocol's `exptime` field.
///
/// `0` means "never expires". Up to 30 days the value is relative seconds;
/// beyond that it must be an absolute Unix time.
fn expiry_field(ttl: Option<Duration>, now: SystemTime) -> u64 {
    let Some(ttl) = ttl else {
        return 0;
    };
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    if secs == 0 {
        return 0;
    }
    if secs <= MAX_RELATIVE_EXPIRY {
        return secs;
    }
    let now = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    now.saturating_add(secs)
}
