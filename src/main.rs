//! tapewatch: single-connection market feed fan-out.
//!
//! One upstream connection to the trade feed, a bounded in-memory history of
//! recent events, durable batch persistence with dedup, and an HTTP/WS API
//! that any number of dashboard consumers can poll without ever touching the
//! upstream themselves.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tapewatch_backend::{api, middleware, models::Config, runtime::FeedRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(
        feed_url = %config.feed_url,
        stream = %config.feed_stream,
        "starting tapewatch backend"
    );

    // Constructing the runtime opens the database, spawns the feed manager,
    // and starts the flush/retention timers; everything downstream borrows
    // this one instance.
    let feed_runtime = FeedRuntime::get_or_init(&config)?;

    let app = api::create_router(feed_runtime.clone())
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Close the upstream transport and make a final attempt to drain the
    // pending write queue before the process exits.
    feed_runtime.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Initialize tracing with env-filterable output.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tapewatch=info,tapewatch_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
