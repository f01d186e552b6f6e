//! Stakeflow Service Binary

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stakeflow_engine::{
    InMemoryLedgerStore, LedgerStore, Notifier, RedisLedgerStore, RedisNotifier, StakingEngine,
    TracingNotifier,
};
use stakeflow_server::{router, AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Stakeflow v{}", stakeflow_common::VERSION);

    let config = ServerConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let store: Arc<dyn LedgerStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisLedgerStore::new(url).await?.with_prefix(&config.redis_prefix);
            info!(prefix = %config.redis_prefix, "Using Redis ledger store");
            Arc::new(store)
        }
        None => {
            warn!("STAKEFLOW_REDIS_URL not set, using in-memory ledger store");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    let notifier: Arc<dyn Notifier> = match (&config.redis_url, &config.notify_channel) {
        (Some(url), Some(channel)) => {
            info!(%channel, "Publishing notifications to Redis");
            Arc::new(RedisNotifier::new(url, channel).await?)
        }
        _ => Arc::new(TracingNotifier),
    };

    let engine = Arc::new(StakingEngine::new(config.engine.clone(), store, notifier)?);
    let state = AppState::new(engine.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = config
        .sweep_interval_secs
        .map(|secs| tokio::spawn(sweep_loop(engine.clone(), Duration::from_secs(secs), shutdown_rx.clone())));

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Stakeflow REST API listening on {}", config.bind_addr());
    info!("Endpoints: /health, /metrics, /api/v1/users, /api/v1/stakes, /api/v1/sweeps, /api/v1/investments");

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Some(handle) = sweeper {
        // lets an in-flight sweep finish its started stakes
        join_sweeper(handle).await;
    }

    info!("Shutting down Stakeflow");
    Ok(())
}

/// Wait for the sweep loop to exit. Returns false if it panicked or was
/// aborted, after logging the cause.
async fn join_sweeper(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Sweep loop task failed");
            false
        }
    }
}

/// Run a sweep every `interval` until shutdown. A sweep in progress stops
/// starting new stakes as soon as shutdown is signalled.
async fn sweep_loop(engine: Arc<StakingEngine>, interval: Duration, shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "Sweep loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let mut stop = shutdown.clone();
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.wait_for(|s| *s) => break,
        }

        let mut cancel = shutdown.clone();
        let cancelled = async move {
            let _ = cancel.wait_for(|s| *s).await;
        };
        match engine.run_sweep_until(chrono::Utc::now(), cancelled).await {
            Ok(summary) if summary.has_failures() => {
                warn!(sweep_id = %summary.sweep_id, failed = summary.failed.len(), "Sweep finished with failures")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Sweep failed"),
        }
    }

    info!("Sweep loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_sweeper_reports_panic() {
        let handle = tokio::spawn(async { panic!("sweep loop blew up") });
        assert!(!join_sweeper(handle).await);

        let handle = tokio::spawn(async {});
        assert!(join_sweeper(handle).await);
    }
}
