use std::sync::Arc;

use anyhow::Context;
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, EngineEvent};
use engine::{Engine, EngineConfig, SqliteStore, Stores};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env()?;
    let engine_cfg = EngineConfig::load(&cfg.engine_config_path)
        .with_context(|| format!("loading {}", cfg.engine_config_path))?;
    info!(
        mode = engine_cfg.mode.as_deref().unwrap_or("default"),
        trials = engine_cfg.optimizer.trials,
        "EdgeKeeper starting"
    );

    // ── Database ──────────────────────────────────────────────────────────────
    let db = SqlitePool::connect(&cfg.database_url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("../../migrations")
        .run(&db)
        .await
        .context("Database migration failed")?;
    info!("Database ready");

    // ── Engine ────────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteStore::new(db));
    let (engine, handle) = Engine::new(engine_cfg, Stores::single(store))?;

    // ── Event forwarder ───────────────────────────────────────────────────────
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── API ───────────────────────────────────────────────────────────────────
    let api_state = api::AppState {
        handle: handle.clone(),
        api_token: cfg.api_token.clone(),
    };
    let port = cfg.api_port;

    tokio::spawn(engine.run());
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, port).await {
            error!(error = %e, "API server stopped");
        }
    });

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting.");
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::PhaseChanged { key, from, to, reason } => {
            info!(%key, %from, %to, reason = %reason, "Phase changed")
        }
        EngineEvent::Demoted { key, from, to, reason } => {
            warn!(%key, %from, %to, %reason, "Key demoted")
        }
        EngineEvent::OptimizationCompleted {
            key,
            run_id,
            status,
            trials,
            front_size,
            candidates,
        } => info!(%key, %run_id, %status, trials, front_size, candidates, "Optimization completed"),
        EngineEvent::OptimizationFailed { key, run_id, reason } => {
            warn!(%key, %run_id, %reason, "Optimization failed")
        }
    }
}
