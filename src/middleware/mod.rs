//! Middleware pipeline — ordered async layers in front of a handler.
//!
//! Each layer receives the request [`Context`] and a [`Next`] cursor. A layer
//! may answer on its own (the cache does this on a hit), forward with
//! [`Next::run`], or forward and then inspect the downstream [`Response`] (the
//! cache does this on a miss).
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by every layer.
//! - [`Next`] — cursor into the rest of the chain.
//! - [`MiddlewareHandler`] — type-erased, cheaply cloneable layer.
//! - [`from_middleware`] / [`endpoint`] — build a [`MiddlewareHandler`] from a
//!   layer or from a terminal handler.
//! - [`LoggerMiddleware`] — request/response log line.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, StatusCode, context::Context, router::Handler};

/// Boxed future returned by every layer.
pub type BoxResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
///
/// Every entry in a chain is stored as a `MiddlewareHandler`; the [`Arc`] keeps
/// advancing [`Next`] cheap.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponseFuture + Send + Sync + 'static>;

/// A cursor into the remaining middleware chain for one request.
///
/// `Next` is consumed by [`run`](Self::run), so a layer can forward a request
/// at most once.
pub struct Next {
    chain: Arc<[MiddlewareHandler]>,
    index: usize,
}

impl Next {
    /// Positions a cursor at the start of `chain`.
    pub fn new(chain: Arc<[MiddlewareHandler]>) -> Self {
        Self { chain, index: 0 }
    }

    /// Invokes the next layer and returns its response.
    ///
    /// When the chain is exhausted without any layer answering, a
    /// `500 Internal Server Error` is returned.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.chain.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core trait for all middleware.
///
/// # Contract
///
/// - Implementations are shared across Tokio tasks and must be `Send + Sync`.
/// - The returned future must be `Send` and `'static`; clone whatever shared
///   state the future needs before building it.
pub trait Middleware: Send + Sync {
    /// Handles the request, optionally delegating to `next`.
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture;
}

/// Converts a [`Middleware`] into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cachegate::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Wraps a terminal handler so it can sit at the end of a chain.
///
/// The handler never sees the cursor; whatever it returns ends the chain.
pub fn endpoint(handler: Handler) -> MiddlewareHandler {
    Arc::new(move |ctx: Context, _next: Next| handler(ctx))
}

/// Logs method, target, status, cache outcome and duration for each request.
///
/// ```text
/// GET /products - 200 (cache=HIT) 1.2ms
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            let cache = response.headers().get("x-cache").unwrap_or("-");
            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                cache = %cache,
                elapsed = ?start.elapsed(),
                "request completed"
            );
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::into_handler;
    use crate::{Method, Request};

    fn chain(handlers: Vec<MiddlewareHandler>) -> Arc<[MiddlewareHandler]> {
        handlers.into()
    }

    fn ctx(path: &str) -> Context {
        Context::new(Request::new(Method::Get, path))
    }

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
            let tag = self.0;
            Box::pin(async move {
                let mut response = next.run(ctx).await;
                let seen = response.headers().get("x-trail").unwrap_or("").to_owned();
                response.set_header("X-Trail", format!("{seen}{tag}"));
                response
            })
        }
    }

    #[tokio::test]
    async fn empty_chain_falls_back_to_500() {
        let response = Next::new(chain(vec![])).run(ctx("/")).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn layers_unwind_in_reverse_order() {
        let handler = into_handler(|_ctx| async { Response::new(StatusCode::Ok) });
        let response = Next::new(chain(vec![
            from_middleware(Arc::new(Tag("a"))),
            from_middleware(Arc::new(Tag("b"))),
            endpoint(handler),
        ]))
        .run(ctx("/"))
        .await;
        assert_eq!(response.headers().get("x-trail"), Some("ba"));
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let handler = into_handler(|_ctx| async { Response::new(StatusCode::NotFound) });
        let response = Next::new(chain(vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            endpoint(handler),
        ]))
        .run(ctx("/missing"))
        .await;
        assert_eq!(response.status(), StatusCode::NotFound);
    }
}
