use std::sync::Arc;

use anyhow::Context;
use mail_relay::config::RelayConfig;
use mail_relay::relay::RelayOrchestrator;
use mail_relay::server::ingest_routes;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("Failed to load relay configuration")?;

    let _log_guard = init_tracing(&config);

    eprintln!("📮 Mail Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Ingest: http://{}/messages", config.listen_addr);
    eprintln!("   Webhook: {}", config.webhook_url);
    eprintln!(
        "   Malformed UTF-8: {:?}, retry attempts: {}",
        config.malformed_policy, config.retry.max_attempts
    );

    let orchestrator = Arc::new(
        RelayOrchestrator::from_config(&config).context("Failed to build relay pipeline")?,
    );
    let app = ingest_routes(orchestrator, config.max_concurrent);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "Ingest server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Ingest server failed")?;

    tracing::info!("Ingest server stopped");
    Ok(())
}

/// Log to stderr, or to a daily-rolling file when a log directory is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(config: &RelayConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
