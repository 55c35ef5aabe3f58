use std::sync::Arc;

use tracing::info;

use bayline::{Config, DurableStore, Engine, LogChannel, Orchestrator, SystemClock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    bayline::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("bayline.wal");
    let store = Arc::new(DurableStore::open(&wal_path, config.compact_threshold)?);

    info!("bayline starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  dispatch_concurrency: {}", config.dispatch_concurrency);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let engine = Arc::new(Engine::new(
        store,
        Arc::new(SystemClock),
        Arc::new(LogChannel),
        config,
    ));
    let mut orchestrator = Orchestrator::new(engine);
    orchestrator.start();

    // Graceful shutdown on SIGTERM/ctrl-c: let each tick finish its current item
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping ticks");
    orchestrator.stop().await;
    info!("bayline stopped");
    Ok(())
}
