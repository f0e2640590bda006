use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::cycle::App;
use crate::models::event::Event;

/// Drive the cycle loop until shutdown.
///
/// Two pacing modes: fixed interval, or event-driven (wake on the next
/// book-stream message, with the interval as timeout). Cycles are always
/// at least `min_cycle_seconds` apart; a failed or panicking cycle is
/// logged as `loop_error` and the loop continues.
pub async fn run_forever(mut app: App, shutdown_tx: &broadcast::Sender<()>) {
    let cfg = app.config().clone();
    let interval = cfg.app.loop_seconds;
    let event_driven = cfg.app.event_driven;
    let use_ws = cfg.data.use_clob_ws;
    let min_cycle = cfg.app.min_cycle_seconds;

    let mut shutdown = shutdown_tx.subscribe();
    let mut last_ws_ts: f64 = 0.0;

    loop {
        let cycle_start = tokio::time::Instant::now();

        match AssertUnwindSafe(app.run_once()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("cycle failed: {e:#}");
                app.events.append(&Event::LoopError {
                    error: format!("{e:#}"),
                });
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                error!("cycle panicked: {msg}");
                app.events.append(&Event::LoopError { error: msg });
            }
        }

        if use_ws {
            last_ws_ts = last_ws_ts.max(app.book_feed.stats().last_msg_ts);
        }

        let elapsed = cycle_start.elapsed().as_secs_f64();
        if elapsed < min_cycle {
            tokio::time::sleep(std::time::Duration::from_secs_f64(min_cycle - elapsed)).await;
        }

        if event_driven && use_ws {
            tokio::select! {
                ts = app.book_feed.wait_for_update(
                    last_ws_ts,
                    std::time::Duration::from_secs_f64(interval),
                ) => {
                    last_ws_ts = ts;
                }
                _ = shutdown.recv() => {
                    info!("scheduler shutting down");
                    return;
                }
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs_f64(interval)) => {}
            _ = shutdown.recv() => {
                info!("scheduler shutting down");
                return;
            }
        }
    }
}
