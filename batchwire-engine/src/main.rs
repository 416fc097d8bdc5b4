//! Batchwire Tracker
//!
//! Runs the tracker loop for every configured backend, restoring the job
//! registry from the last checkpoint on startup and writing one back on
//! shutdown.

use anyhow::{Context, Result};
use batchwire_engine::process::{CommandExecutor, ProcessExecutor};
use batchwire_engine::{EngineConfig, JobEngine, TrackerLoop, checkpoint};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchwire_engine=info,batchwire_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Batchwire Tracker");

    let config = load_config()?;
    info!(
        "Loaded configuration: backends={:?}, poll_interval={:?}",
        config.backends, config.poll_interval
    );

    let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor);
    let engine = Arc::new(
        JobEngine::from_config(config.clone(), executor).context("Failed to build engine")?,
    );

    for kind in engine.backends().kinds() {
        let Some(entry) = engine.backends().get(&kind) else {
            continue;
        };
        match entry.backend.health_check().await {
            Ok(()) => info!("Backend {} is reachable", kind),
            Err(e) => warn!("Backend {} failed its health check: {:#}", kind, e),
        }
    }

    if let Some(path) = &config.checkpoint_path {
        if let Some(snapshot) = checkpoint::load(path).await? {
            let restored = engine
                .import_state(snapshot)
                .context("Failed to restore checkpoint")?;
            info!("Restored {} job record(s) from {}", restored, path.display());
        }
    }

    let tracker = TrackerLoop::new(Arc::clone(&engine));

    tokio::select! {
        result = tracker.run() => {
            if let Err(e) = result {
                error!("Tracker error: {:#}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    tracker.shutdown();

    if let Some(path) = &config.checkpoint_path {
        checkpoint::save(path, &engine.export_state())
            .await
            .context("Failed to write final checkpoint")?;
        info!("Saved {} job record(s) to {}", engine.registry().len(), path.display());
    }

    Ok(())
}

/// Loads configuration from environment variables
///
/// Unset variables fall back to their defaults. A malformed one stops the
/// tracker: running with a default backend list or without the checkpoint
/// would lose track of jobs already submitted.
fn load_config() -> Result<EngineConfig> {
    EngineConfig::load(|key| std::env::var(key).ok())
}
