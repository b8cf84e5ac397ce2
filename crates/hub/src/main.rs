mod config;
mod db;
mod engine;
mod error;
mod influx;
mod normalize;
mod notify;
mod scheduler;
mod state;
#[cfg(test)]
mod test_support;
mod timeseries;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use engine::Engine;
use influx::InfluxClient;
use notify::{Dispatcher, RelayTransport};
use state::new_shared_events;
use timeseries::TimeSeriesReader;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("garden_hub=info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;
    info!(url = %cfg.database.url, "device registry ready");

    // ── Collaborators ───────────────────────────────────────────────
    let influx = InfluxClient::new(
        &cfg.influx.url,
        &cfg.influx.org,
        &cfg.influx.bucket,
        &cfg.influx.token,
    )
    .context("failed to build influx client")?;
    let reader = TimeSeriesReader::new(Arc::new(influx), cfg.influx.timeout());

    let transport = RelayTransport::new(&cfg.push.relay_url, cfg.push.timeout())
        .context("failed to build push transport")?;

    let events = new_shared_events();
    events.write().await.record_system("hub started".to_string());

    let engine = Engine::new(reader, db.clone(), &cfg.server.public_url, events.clone());
    let dispatcher = Dispatcher::new(
        db.clone(),
        Arc::new(transport),
        cfg.push.timeout(),
        events.clone(),
    );

    // ── Background alerting ─────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let scheduler = if cfg.alerts.enabled {
        Some(tokio::spawn(scheduler::run(
            engine.clone(),
            dispatcher.clone(),
            events.clone(),
            std::time::Duration::from_secs(cfg.alerts.interval_secs),
            shutdown.clone(),
        )))
    } else {
        info!("alert scheduler disabled");
        None
    };

    tokio::spawn(signal_shutdown(shutdown.clone()));

    // ── Web server (blocks until shutdown) ──────────────────────────
    let state = AppState {
        engine,
        db: db.clone(),
        dispatcher,
        events,
    };
    let served = web::serve(state, &cfg.server.bind, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
    db.close().await;
    info!("hub stopped");

    served
}

/// Cancel `token` on Ctrl-C or SIGTERM.
async fn signal_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown requested");
    token.cancel();
}
