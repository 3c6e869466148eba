use anyhow::{Context, Result};
use flume::unbounded;
use loiter_backend::config::PresenceConfig;
use loiter_backend::runtime::BackendRuntime;
use loiter_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,loiter_backend=debug")),
        )
        .init();

    let config = PresenceConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap presence runtime")?;

    tracing::info!(
        "Starting presence daemon (needs TELEGRAM_BOT_TOKEN and LOITER_BACKEND_TOKEN; bind via LOITER_BACKEND_BIND, auth mode via LOITER_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
