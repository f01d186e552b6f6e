//! Stakeflow server configuration

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stakeflow_engine::{EngineConfig, PayoutPolicy};
use std::str::FromStr;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Redis URL; the in-memory store is used when absent
    pub redis_url: Option<String>,
    /// Key prefix for the Redis store
    pub redis_prefix: String,
    /// Redis pub/sub channel for notifications; notifications are logged
    /// when absent
    pub notify_channel: Option<String>,
    /// Run a sweep every this many seconds
    pub sweep_interval_secs: Option<u64>,
    /// Engine options
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            redis_url: None,
            redis_prefix: "stakeflow".to_string(),
            notify_channel: None,
            sweep_interval_secs: None,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `.env` and the process environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from defaults overridden by `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        // a full engine config file is the base; single options override it
        if let Some(path) = lookup("STAKEFLOW_ENGINE_CONFIG") {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read engine config {}", path))?;
            cfg.engine = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid engine config {}", path))?;
        }

        // Railway-style PORT first, STAKEFLOW_PORT wins if both are set
        if let Some(port) = parse::<u16>(&lookup, "PORT")? {
            cfg.port = port;
        }
        if let Some(host) = lookup("STAKEFLOW_HOST") {
            cfg.host = host;
        }
        if let Some(port) = parse::<u16>(&lookup, "STAKEFLOW_PORT")? {
            cfg.port = port;
        }

        cfg.redis_url = lookup("STAKEFLOW_REDIS_URL").filter(|url| !url.is_empty());
        if let Some(prefix) = lookup("STAKEFLOW_REDIS_PREFIX") {
            cfg.redis_prefix = prefix;
        }
        cfg.notify_channel = lookup("STAKEFLOW_NOTIFY_CHANNEL").filter(|c| !c.is_empty());
        cfg.sweep_interval_secs = parse::<u64>(&lookup, "STAKEFLOW_SWEEP_INTERVAL_SECS")?.filter(|s| *s > 0);

        // Engine thresholds
        if let Some(v) = parse::<Decimal>(&lookup, "STAKEFLOW_MINIMUM_STAKE_AMOUNT")? {
            cfg.engine.minimum_stake_amount = v;
        }
        if let Some(v) = parse::<Decimal>(&lookup, "STAKEFLOW_MINIMUM_QUALIFYING_AMOUNT")? {
            cfg.engine.minimum_qualifying_amount = v;
        }
        if let Some(v) = parse::<Decimal>(&lookup, "STAKEFLOW_CAP_MULTIPLIER")? {
            cfg.engine.cap_multiplier = v;
        }
        if let Some(v) = parse::<Decimal>(&lookup, "STAKEFLOW_MAX_DURATION_DAYS")? {
            cfg.engine.max_duration_days = Some(v);
        }
        if let Some(v) = parse::<usize>(&lookup, "STAKEFLOW_SWEEP_CONCURRENCY")? {
            cfg.engine.sweep_concurrency = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "STAKEFLOW_NOTIFY_TIMEOUT_MS")? {
            cfg.engine.notify_timeout_ms = v;
        }
        if let Some(policy) = lookup("STAKEFLOW_PAYOUT_POLICY") {
            cfg.engine.payout_policy = match policy.as_str() {
                "reward_only" => PayoutPolicy::RewardOnly,
                "reward_and_principal" => PayoutPolicy::RewardAndPrincipal,
                other => anyhow::bail!("Unknown STAKEFLOW_PAYOUT_POLICY: {}", other),
            };
        }

        Ok(cfg)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}={}: {}", key, raw, e)),
        None => Ok(None),
    }
}
