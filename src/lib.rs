//! # cachegate
//!
//! Response-caching middleware for a from-scratch async HTTP/1.1 server, with
//! interchangeable memory, file, memcached and Redis backends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cachegate::cache::{CacheMiddleware, MemoryBackend};
//! use cachegate::catalog::{self, StaticCatalog};
//! use cachegate::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = CacheMiddleware::new(Arc::new(MemoryBackend::unbounded()))
//!         .ttl(Duration::from_secs(30));
//!     let store = Arc::new(StaticCatalog::seeded(Duration::from_secs(3)));
//!     let router = Arc::new(catalog::router(cache, store));
//!
//!     let server = Server::bind("127.0.0.1:3128").await?;
//!     server
//!         .run(move |req| {
//!             let router = Arc::clone(&router);
//!             async move { router.dispatch(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
