//! # Stakeflow Server
//!
//! HTTP surface over the staking engine: wallets, stakes, investments,
//! on-demand sweeps and Prometheus metrics.

pub mod config;
pub mod routes;

pub use config::ServerConfig;
pub use routes::{router, ApiError, AppState};
