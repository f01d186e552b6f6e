//! Error types for the Stakeflow engine
//!
//! Provides a unified error type and domain-specific error variants

use thiserror::Error;

/// Result type alias using StakeflowError
pub type Result<T> = std::result::Result<T, StakeflowError>;

/// Unified error type for Stakeflow operations
#[derive(Debug, Error)]
pub enum StakeflowError {
    // Input rejected before anything was applied
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // Wallet errors
    #[error("Wallet error: {0}")]
    Wallet(#[from] crate::types::account::WalletError),

    // Pure calculation errors
    #[error("Calculation error: {0}")]
    Calculation(#[from] CalculationError),

    // Primary operand missing
    #[error("Not found: {0}")]
    NotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StakeflowError {
    /// Short machine-readable category, used in sweep failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Wallet(crate::types::account::WalletError::InsufficientBalance { .. }) => {
                "insufficient_balance"
            }
            Self::Wallet(_) => "wallet",
            Self::Calculation(_) => "calculation",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

/// Input validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(String),

    #[error("Amount {amount} is below the minimum of {minimum}")]
    BelowMinimum { amount: String, minimum: String },

    #[error("User {0} already exists")]
    DuplicateUser(String),

    #[error("A user cannot refer themselves")]
    SelfReferral,
}

/// Reward arithmetic errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalculationError {
    #[error("Principal must be positive, got {0}")]
    InvalidPrincipal(String),

    #[error("Daily rate must not be negative, got {0}")]
    InvalidRate(String),

    #[error("Cap must not be negative, got {0}")]
    InvalidCap(String),

    #[error("Rate table is invalid: {0}")]
    InvalidRateTable(String),

    #[error("Reward calculation overflow")]
    Overflow,
}

impl From<serde_json::Error> for StakeflowError {
    fn from(err: serde_json::Error) -> Self {
        StakeflowError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for StakeflowError {
    fn from(err: anyhow::Error) -> Self {
        StakeflowError::Internal(err.to_string())
    }
}
