use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use doc_router::api::api_routes;
use doc_router::config::ServiceConfig;
use doc_router::llm::create_oracle;
use doc_router::pipeline::{CapabilityRegistry, Classifier, Router, SharedRegistry};
use doc_router::status::StatusService;
use doc_router::store::open_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;

    // Held for the process lifetime so buffered log lines get flushed.
    let _log_guard = init_tracing(&config);

    eprintln!("📄 doc-router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Store: {:?}", config.store);
    eprintln!("   Workers: {}", config.router.workers);
    eprintln!("   API: http://{}:{}", config.bind_addr, config.port);

    // ── Store ───────────────────────────────────────────────────────────
    let store = open_store(&config.store)
        .await
        .context("failed to open correlation store")?;
    tracing::info!(backend = store.backend_name(), "Correlation store ready");

    // ── Pipeline ────────────────────────────────────────────────────────
    let oracle = create_oracle(&config.oracle);
    let classifier = Arc::new(Classifier::new(
        oracle,
        config.router.oracle_timeout,
        config.router.confidence_threshold,
    ));
    let registry = Arc::new(SharedRegistry::new(CapabilityRegistry::standard()));
    let (router, pool) = Router::start(store.clone(), classifier, registry, config.router.clone());

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api_routes(Arc::new(router), StatusService::new(store));
    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // The router was moved into the app; with the server gone the queue is
    // closed and the pool drains what is left.
    tracing::info!("Draining worker pool");
    pool.join().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "doc-router.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
