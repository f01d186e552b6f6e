//! # Stakeflow Common
//!
//! Shared records and errors for the Stakeflow staking reward engine.
//!
//! ## Core Types
//!
//! - [`Stake`]: a principal accruing a frozen daily rate up to a cap
//! - [`UserAccount`]: wallet balance plus referral level and counters
//! - [`StakeflowError`]: unified error taxonomy

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{CalculationError, Result, StakeflowError, ValidationError};
pub use types::{
    account::{UserAccount, WalletError, INITIAL_LEVEL},
    stake::{Stake, StakeStatus},
};

/// Stakeflow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
