use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use playtime::api::ApiServer;
use playtime::broadcast::BroadcastHub;
use playtime::config::ServerConfig;
use playtime::sessions::{
    AuditSink, ExpirationSweeper, JsonLinesAudit, SessionService, TracingAudit,
};
use playtime::store::JsonFileStore;

use super::utils::{block_on, init_logging};

/// Run the server until Ctrl+C
pub fn run_serve(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let config = ServerConfig::load_or_default(config_path)?;
    init_logging(verbose, &config.logging.level);

    block_on(serve(config))
}

pub async fn serve(config: ServerConfig) -> Result<()> {
    let store_path = config.store_path()?;
    let store = Arc::new(
        JsonFileStore::open(&store_path)
            .with_context(|| format!("Failed to open session store: {}", store_path.display()))?
            .with_default_settings(config.default_settings()),
    );
    info!("Session store: {}", store_path.display());

    let audit: Arc<dyn AuditSink> = match &config.audit.file {
        Some(path) => {
            info!("Audit trail: {}", path.display());
            Arc::new(JsonLinesAudit::new(path))
        }
        None => Arc::new(TracingAudit),
    };

    let service = Arc::new(
        SessionService::new(store.clone(), store, BroadcastHub::new()).with_audit(audit),
    );

    let sweeper = ExpirationSweeper::new(
        service.clone(),
        Duration::from_secs(config.sweeper.interval_secs),
    );
    sweeper.start().await?;

    let server = ApiServer::bind(config.bind_addr()?, service.clone()).await?;
    let result = server.serve(shutdown_signal()).await;

    sweeper.stop().await;
    info!(
        "Stopped with {} observer(s) still connected",
        service.hub().subscriber_count()
    );
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
