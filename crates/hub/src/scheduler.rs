//! Periodic alert evaluation: every tick, check each reporting device
//! against its threshold and hand firing alerts to the dispatcher.
//!
//! The scheduler is a pure decision loop. Throttling lives in
//! `Dispatcher::notify_many`, so firing the same alert every tick is safe.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::CoreError;
use crate::notify::Dispatcher;
use crate::state::SharedEvents;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the alert loop until `cancel` fires. Intended to be `tokio::spawn`-ed
/// from main.
pub async fn run(
    engine: Engine,
    dispatcher: Dispatcher,
    events: SharedEvents,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(tick_sec = interval.as_secs(), "alert scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tick(&engine, &dispatcher, &events).await;
            }
        }
    }

    info!("alert scheduler stopped");
}

/// One evaluation pass. Returns how many devices fired.
pub(crate) async fn tick(engine: &Engine, dispatcher: &Dispatcher, events: &SharedEvents) -> usize {
    let names = match engine.reader().list_measurement_names().await {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, "scheduler: device discovery failed");
            return 0;
        }
    };

    let mut fired = 0;
    for id in &names {
        let alert = match engine.evaluate_threshold(id).await {
            Ok(alert) => alert,
            Err(CoreError::NotFound(_)) => continue,
            Err(e) => {
                warn!(device = %id, error = %e, "scheduler: threshold evaluation failed");
                continue;
            }
        };
        if !alert.thresholds_reached {
            continue;
        }

        fired += 1;
        info!(device = %id, "scheduler: moisture threshold reached");
        events
            .write()
            .await
            .record_alert(id, alert.message.body.clone());

        match dispatcher.notify_many(&[], &alert.message).await {
            Ok(report) => debug!(device = %id, ?report, "scheduler: alert dispatched"),
            Err(e) => warn!(device = %id, error = %e, "scheduler: alert dispatch failed"),
        }
    }
    fired
}

// ===========================================================================
// Tests
// ===========================================================================
