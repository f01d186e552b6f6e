//! Outbound notifications
//!
//! Delivery is best-effort. [`notify_best_effort`] bounds each attempt with a
//! timeout and logs failures; it never returns an error, so a lost
//! notification can never undo an already persisted state change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Event emitted when a stake accrued but is still running
pub const STAKE_ACCRUED: &str = "stake.accrued";
/// Event emitted when a stake completed or was paid out
pub const STAKE_COMPLETED: &str = "stake.completed";
/// Event emitted when a referral commission was credited
pub const REFERRAL_COMMISSION: &str = "referral.commission";

/// Notification delivery errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification transport error: {0}")]
    Transport(String),

    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A delivered notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(event: &str, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
            emitted_at: Utc::now(),
        }
    }
}

/// Outbound notification capability
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), NotifyError>;
}

/// Deliver a notification, swallowing and logging any failure
pub async fn notify_best_effort(
    notifier: &dyn Notifier,
    event: &str,
    payload: serde_json::Value,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, notifier.notify(event, payload)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(event, error = %e, "Notification failed");
            false
        }
        Err(_) => {
            warn!(event, error = %NotifyError::Timeout(timeout), "Notification failed");
            false
        }
    }
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), NotifyError> {
        info!(event, payload = %payload, "Notification");
        Ok(())
    }
}

/// Fans notifications out to in-process subscribers
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), NotifyError> {
        // no subscribers is not a delivery failure
        if let Err(e) = self.tx.send(Notification::new(event, payload)) {
            debug!(event = %e.0.event, "No notification subscribers");
        }
        Ok(())
    }
}

/// Publishes notifications on a Redis pub/sub channel
pub struct RedisNotifier {
    connection: ConnectionManager,
    channel: String,
}

impl RedisNotifier {
    pub async fn new(redis_url: &str, channel: &str) -> Result<Self, NotifyError> {
        let client = Client::open(redis_url)
            .map_err(|e| NotifyError::Transport(format!("Failed to create Redis client: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| NotifyError::Transport(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            connection,
            channel: channel.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), NotifyError> {
        let message = serde_json::to_string(&Notification::new(event, payload))
            .map_err(|e| NotifyError::Serialization(e.to_string()))?;

        let mut conn = self.connection.clone();
        let receivers: i64 = conn
            .publish(&self.channel, message)
            .await
            .map_err(|e| NotifyError::Transport(format!("Redis PUBLISH failed: {}", e)))?;

        debug!(event, channel = %self.channel, receivers, "Published notification");
        Ok(())
    }
}
