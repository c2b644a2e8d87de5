//! End-to-end: a real listener, the product routes and the memory cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cachegate::cache::{CacheBackend, CacheMiddleware, FileBackend, MemoryBackend};
use cachegate::catalog::{self, StaticCatalog};
use cachegate::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn start(cache: CacheMiddleware, store: Arc<StaticCatalog>) -> (SocketAddr, oneshot::Sender<()>) {
    let router = Arc::new(catalog::router(cache, store));
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .run_until(
                move |req| {
                    let router = Arc::clone(&router);
                    async move { router.dispatch(req).await }
                },
                async move {
                    let _ = stopped.await;
                },
            )
            .await
            .unwrap();
    });
    (addr, stop)
}

async fn request(addr: SocketAddr, method: &str, target: &str) -> Reply {
    let head = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    send_raw(addr, &head).await
}

async fn send_raw(addr: SocketAddr, head: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head terminator");
    let head = std::str::from_utf8(&raw[..split]).unwrap();
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(n, v)| (n.to_owned(), v.to_owned()))
        .collect();
    Reply {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let store = Arc::new(StaticCatalog::seeded(Duration::from_millis(200)));
    let cache = CacheMiddleware::new(Arc::new(MemoryBackend::unbounded())).ttl(Duration::from_secs(30));
    let (addr, stop) = start(cache, store.clone()).await;

    let first = request(addr, "GET", "/products").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header("x-cache"), Some("MISS"));
    assert_eq!(first.header("content-type"), Some("application/json"));

    let started = std::time::Instant::now();
    let second = request(addr, "GET", "/products").await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(second.status, 200);
    assert_eq!(second.header("x-cache"), Some("HIT"));
    assert_eq!(second.header("content-type"), Some("application/json"));
    assert_eq!(second.body, first.body);
    assert_eq!(store.queries(), 1);

    let products: serde_json::Value = serde_json::from_slice(&second.body).unwrap();
    assert_eq!(products.as_array().map(Vec::len), Some(5));

    let _ = stop.send(());
}

#[tokio::test]
async fn query_variants_and_routing() {
    let store = Arc::new(StaticCatalog::seeded(Duration::ZERO));
    let cache = CacheMiddleware::new(Arc::new(MemoryBackend::unbounded()));
    let (addr, stop) = start(cache, store.clone()).await;

    assert_eq!(request(addr, "GET", "/products?page=1").await.header("x-cache"), Some("MISS"));
    assert_eq!(request(addr, "GET", "/products?page=2").await.header("x-cache"), Some("MISS"));
    assert_eq!(request(addr, "GET", "/products?page=1").await.header("x-cache"), Some("HIT"));
    assert_eq!(store.queries(), 2);

    let post = request(addr, "POST", "/products").await;
    assert_eq!(post.status, 405);
    assert_eq!(request(addr, "GET", "/orders").await.status, 404);

    let health = request(addr, "GET", "/health").await;
    assert_eq!(health.status, 200);
    assert_eq!(health.header("x-cache"), None);

    let _ = stop.send(());
}

#[tokio::test]
async fn file_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let store = Arc::new(StaticCatalog::seeded(Duration::ZERO));
    let backend = Arc::new(FileBackend::open(dir.path(), "productsCache").unwrap());
    let (addr, stop) = start(CacheMiddleware::new(backend.clone()), store.clone()).await;
    let first = request(addr, "GET", "/products").await;
    assert_eq!(first.header("x-cache"), Some("MISS"));
    let _ = stop.send(());
    backend.close().await.unwrap();

    let store = Arc::new(StaticCatalog::seeded(Duration::ZERO));
    let backend = Arc::new(FileBackend::open(dir.path(), "productsCache").unwrap());
    let (addr, stop) = start(CacheMiddleware::new(backend), store.clone()).await;
    let again = request(addr, "GET", "/products").await;
    assert_eq!(again.header("x-cache"), Some("HIT"));
    assert_eq!(again.body, first.body);
    assert_eq!(store.queries(), 0);
    let _ = stop.send(());
}

#[tokio::test]
async fn overflowing_content_length_is_rejected() {
    let store = Arc::new(StaticCatalog::seeded(Duration::ZERO));
    let (addr, stop) = start(CacheMiddleware::new(Arc::new(MemoryBackend::unbounded())), store.clone()).await;

    let reply = send_raw(
        addr,
        "GET /products HTTP/1.1\r\nHost: localhost\r\nContent-Length: 18446744073709551615\r\n\r\n",
    )
    .await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("connection"), Some("close"));
    assert_eq!(store.queries(), 0);

    let _ = stop.send(());
}

#[tokio::test]
async fn unrepresentable_ttl_still_caches() {
    let store = Arc::new(StaticCatalog::seeded(Duration::ZERO));
    let cache = CacheMiddleware::new(Arc::new(MemoryBackend::unbounded()))
        .ttl(Duration::from_secs(u64::MAX));
    let (addr, stop) = start(cache, store.clone()).await;

    assert_eq!(request(addr, "GET", "/products").await.header("x-cache"), Some("MISS"));
    assert_eq!(request(addr, "GET", "/products").await.header("x-cache"), Some("HIT"));
    assert_eq!(store.queries(), 1);

    let _ = stop.send(());
}
