//! Request routing — map exact paths and methods to handler chains.
//!
//! Each route owns its own middleware stack, so the response cache can sit in
//! front of exactly the routes that should be cached:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cachegate::{Response, Router, StatusCode};
//! use cachegate::middleware::{LoggerMiddleware, from_middleware};
//!
//! let mut router = Router::new();
//! router.get("/health", |_ctx| async { Response::new(StatusCode::Ok).body("ok") });
//! router.get_with(
//!     "/products",
//!     vec![from_middleware(Arc::new(LoggerMiddleware))],
//!     |_ctx| async { Response::new(StatusCode::Ok).body("[]") },
//! );
//! ```
//!
//! Paths are compared literally after dropping one trailing slash, so `/products/`
//! reaches the `/products` route. The query string never takes part in routing.

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::middleware::{BoxResponseFuture, MiddlewareHandler, Next, endpoint};
use crate::{Method, Request, Response, StatusCode};

/// Type-erased async handler.
pub type Handler = Arc<dyn Fn(Context) -> BoxResponseFuture + Send + Sync + 'static>;

/// Erases an async closure into a [`Handler`].
pub fn into_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context| -> BoxResponseFuture { Box::pin(f(ctx)) })
}

struct Route {
    method: Method,
    path: String,
    chain: Arc<[MiddlewareHandler]>,
}

/// HTTP router with per-route middleware.
///
/// Routes are tried in registration order. An unknown path yields
/// `404 Not Found`; a known path requested with an unregistered method yields
/// `405 Method Not Allowed`.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `GET path` with no middleware.
    pub fn get<F, Fut>(&mut self, path: &str, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Get, path, Vec::new(), into_handler(handler));
    }

    /// Registers `handler` for `GET path` behind `layers`, outermost first.
    pub fn get_with<F, Fut>(&mut self, path: &str, layers: Vec<MiddlewareHandler>, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Get, path, layers, into_handler(handler));
    }

    /// Registers an already erased handler for any method.
    pub fn route(
        &mut self,
        method: Method,
        path: &str,
        mut layers: Vec<MiddlewareHandler>,
        handler: Handler,
    ) {
        layers.push(endpoint(handler));
        self.routes.push(Route {
            method,
            path: normalize(path).to_owned(),
            chain: layers.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Runs `request` through the chain of the first matching route.
    pub async fn dispatch(&self, request: Request) -> Response {
        let path = normalize(request.path());
        let mut path_known = false;

        for route in &self.routes {
            if route.path != path {
                continue;
            }
            if &route.method == request.method() {
                let next = Next::new(Arc::clone(&route.chain));
                return next.run(Context::new(request)).await;
            }
            path_known = true;
        }

        if path_known {
            Response::new(StatusCode::MethodNotAllowed)
        } else {
            Response::new(StatusCode::NotFound)
        }
    }
}

fn normalize(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}
