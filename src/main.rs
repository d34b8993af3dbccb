use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{info, warn};

use mail_dispatcher::config::DispatcherConfig;
use mail_dispatcher::pipeline::Router;
use mail_dispatcher::store::LibSqlBackend;
use mail_dispatcher::transport::{LettreSubmitter, TlsImapConnector, TransportDeps};
use mail_dispatcher::worker::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatcherConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Mail Dispatcher v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Poll interval: {}s", config.polling_interval.as_secs());
    eprintln!(
        "   Retry: {} attempts, {}s apart",
        config.max_retry_count,
        config.retry_interval.as_secs()
    );
    eprintln!("   Forward mode: {:?}", config.forward_mode);
    eprintln!("   Press Ctrl-C to stop.\n");

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    if let Some(days) = config.log_retention_days {
        if let Err(e) = store.prune_outcomes(days).await {
            warn!(error = %e, "Failed to prune dispatch outcomes");
        }
    }

    // ── Dispatcher ───────────────────────────────────────────────────────
    let router = Arc::new(Router::new(
        store.clone(),
        store.clone(),
        config.forward_mode,
    ));
    let deps = TransportDeps::new(
        Arc::new(TlsImapConnector::new().context("Failed to build TLS connector")?),
        Arc::new(LettreSubmitter),
        config.retry_policy(),
    );
    let scheduler = Scheduler::new(store.clone(), router, deps, config.polling_interval);
    scheduler.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down, waiting for running polls");
    scheduler.stop();
    let results = scheduler.join_in_flight().await;
    let failed = results.iter().filter(|r| r.result.is_err()).count();
    info!(tasks = results.len(), failed, "Shutdown complete");
    Ok(())
}
