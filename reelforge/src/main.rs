use std::sync::Arc;

use reelforge::config::OrchestratorConfig;
use reelforge::database::{self, SqliteJobStore};
use reelforge::logging;
use reelforge::orchestrator::{Orchestrator, OrchestratorContext};
use reelforge::provider::ProviderRegistry;
use reelforge::utils::http_client::install_rustls_provider;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    install_rustls_provider();

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let (logging_config, _log_guard) = logging::init_logging(&log_dir)?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());
    #[cfg(unix)]
    logging_config.reload_on_hangup(shutdown.clone());
    info!(
        filter = %logging_config.get_filter(),
        log_dir = %logging_config.log_dir().display(),
        "Logging initialised"
    );

    let config = OrchestratorConfig::from_env()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:reelforge.db?mode=rwc".to_string());
    let pool = database::init_pool(&database_url).await?;
    database::run_migrations(&pool).await?;
    let store = Arc::new(SqliteJobStore::new(pool.clone()));

    // Platform drivers register here; the core never names a platform.
    let providers = ProviderRegistry::new();
    if providers.platforms().is_empty() {
        tracing::warn!("No video providers registered; generate tasks will fail");
    }

    let orchestrator = Orchestrator::new(OrchestratorContext::new(config, store, providers));
    orchestrator.start().await?;
    info!("reelforge running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    orchestrator.shutdown().await;
    shutdown.cancel();
    pool.close().await;
    info!("reelforge stopped");
    Ok(())
}
