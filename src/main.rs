// Moniteur; server entry point.
// Loads and validates configuration, builds the engine state, spawns the
// daily scheduler heartbeat, and serves the HTTP surface until SIGINT.

use log::info;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use moniteur::engine::config::Config;
use moniteur::engine::server;
use moniteur::engine::state::EngineState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::var("MONITEUR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("moniteur.toml"));
    let config = Config::load(&config_path)?;
    info!(
        "[main] Config loaded (dry_run={}, scheduler {:02}:{:02} UTC)",
        config.dry_run, config.scheduler.hour, config.scheduler.minute
    );

    let state = Arc::new(EngineState::new(config)?);

    // Daily report scheduler heartbeat.
    let scheduler = state.scheduler.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    // Ctrl-C flips the shared shutdown flag; every loop observes it.
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[main] SIGINT — shutting down");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    server::serve(state).await?;
    scheduler_task.await.ok();
    info!("[main] Bye");
    Ok(())
}
