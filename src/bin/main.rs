//! cachegate binary: the product catalog behind the response cache.

use std::sync::Arc;

use cachegate::catalog::{self, StaticCatalog};
use cachegate::config::Config;
use cachegate::server::Server;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = Config::parse();
    let backend = config.build_backend().await?;
    let cache = config.cache_middleware(Arc::clone(&backend));
    let store = Arc::new(StaticCatalog::seeded(config.origin_delay()));
    let router = Arc::new(catalog::router(cache, store));

    let server = Server::bind(config.listen_addr()).await?;
    info!(address = %server.local_addr(), backend = %backend.kind(), "cachegate running");

    server
        .run_until(
            move |req| {
                let router = Arc::clone(&router);
                async move { router.dispatch(req).await }
            },
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            },
        )
        .await?;

    if let Err(e) = backend.close().await {
        warn!(error = %e, "cache backend did not close cleanly");
    }
    info!("cachegate stopped");
    Ok(())
}
