//! Product catalog — the slow origin behind the cache.
//!
//! [`StaticCatalog`] stands in for a database: it serves a fixed product list
//! after a configurable delay, which makes the difference between a cache hit
//! and a miss easy to see.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::cache::CacheMiddleware;
use crate::context::Context;
use crate::middleware::{LoggerMiddleware, from_middleware};
use crate::router::{Handler, Router, into_handler};
use crate::{Response, StatusCode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: u32,
    pub name: String,
    pub price_cents: u64,
    pub quantity: u32,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("product store unavailable: {0}")]
    Unavailable(String),
}

pub type CatalogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CatalogError>> + Send + 'a>>;

/// Source of product records.
pub trait ProductStore: Send + Sync {
    fn all_products(&self) -> CatalogFuture<'_, Vec<Product>>;
}

/// In-memory product list with simulated query latency.
pub struct StaticCatalog {
    products: Vec<Product>,
    latency: Duration,
    failing: AtomicBool,
    queries: AtomicUsize,
}

impl StaticCatalog {
    pub fn new(products: Vec<Product>, latency: Duration) -> Self {
        Self {
            products,
            latency,
            failing: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    /// The demo inventory.
    pub fn seeded(latency: Duration) -> Self {
        let products = [
            (1, "Mechanical keyboard", 8_999, 12),
            (2, "USB-C dock", 12_950, 4),
            (3, "27\" monitor", 29_900, 7),
            (4, "Trackball", 4_500, 0),
            (5, "Laptop stand", 3_299, 31),
        ]
        .into_iter()
        .map(|(id, name, price_cents, quantity)| Product {
            id,
            name: name.to_owned(),
            price_cents,
            quantity,
        })
        .collect();
        Self::new(products, latency)
    }

    /// Makes every later query fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of queries served or failed so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl ProductStore for StaticCatalog {
    fn all_products(&self) -> CatalogFuture<'_, Vec<Product>> {
        Box::pin(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if self.failing.load(Ordering::SeqCst) {
                return Err(CatalogError::Unavailable("injected failure".into()));
            }
            Ok(self.products.clone())
        })
    }
}

/// Origin handler for `GET /products`: the full list as a JSON array, or
/// `500` if the store fails.
pub fn products_handler(store: Arc<dyn ProductStore>) -> Handler {
    into_handler(move |_ctx: Context| {
        let store = Arc::clone(&store);
        async move {
            let result = store
                .all_products()
                .await
                .map_err(|e| e.to_string())
                .and_then(|products| Response::json(&products).map_err(|e| e.to_string()));
            result.unwrap_or_else(|e| {
                error!(error = %e, "failed to load products");
                Response::new(StatusCode::InternalServerError).body("failed to load products")
            })
        }
    })
}

/// Routes served by the demo binary: a cached `/products` and an uncached
/// `/health`.
pub fn router(cache: CacheMiddleware, store: Arc<dyn ProductStore>) -> Router {
    let mut router = Router::new();
    router.route(
        crate::Method::Get,
        "/products",
        vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            from_middleware(Arc::new(cache)),
        ],
        products_handler(store),
    );
    router.get("/health", |_ctx| async { Response::new(StatusCode::Ok).body("ok") });
    router
}
