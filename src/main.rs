use oddsmith::config::{Config, RunMode};
use oddsmith::cycle::App;
use oddsmith::scheduler;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // `oddsmith [config_path] [--once]`
    let mut config_path = "config/default.toml".to_string();
    let mut once = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--once" => once = true,
            other => config_path = other.to_string(),
        }
    }

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("config load failed ({e}), using defaults");
            Config::default()
        }
    };
    if let Err(e) = config.validate() {
        error!("config validation failed: {e}");
        return Err(e);
    }

    info!("================================================");
    info!("  ODDSMITH — BTC up/down paper trading engine");
    info!("  mode={:?} loop={}s event_driven={}",
        config.app.mode, config.app.loop_seconds, config.app.event_driven);
    info!("================================================");

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let mut app = App::new(config.clone());

    // Paper sessions start from a clean ledger.
    if config.app.mode == RunMode::Paper {
        app.reset_paper_state()?;
    }

    app.start_feeds(&shutdown_tx);

    if once {
        if let Err(e) = app.run_once().await {
            error!("cycle failed: {e:#}");
        }
        let _ = shutdown_tx.send(());
        return Ok(());
    }

    // Ctrl+C flips the shutdown switch for every background worker.
    let ctrl_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = ctrl_tx.send(());
        }
    });

    scheduler::run_forever(app, &shutdown_tx).await;
    Ok(())
}
