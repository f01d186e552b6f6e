//! Ledger storage
//!
//! Storage backends for stakes, user accounts and the reward ledger:
//! - InMemoryLedgerStore: DashMap-backed, per-record locking
//! - RedisLedgerStore: Lua compare-and-swap scripts on versioned records
//!
//! Every wallet mutation is applied as an atomic read-modify-write against
//! the stored record, never as an overwrite of an earlier snapshot.

pub mod memory;
pub mod redis_store;

pub use self::memory::InMemoryLedgerStore;
pub use self::redis_store::RedisLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stakeflow_common::{Stake, StakeflowError, UserAccount, ValidationError, WalletError};
use uuid::Uuid;

/// A mutation applied to a freshly loaded account.
///
/// May run more than once under optimistic retry, so it must only depend on
/// the account it is given.
pub type UserMutation<'a> = dyn Fn(&mut UserAccount) -> Result<(), WalletError> + Send + Sync + 'a;

/// Trait for ledger storage backends
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Stakes that still need a sweep: active, or completed but unpaid
    async fn load_active_stakes(&self) -> Result<Vec<Stake>, StoreError>;

    /// Get a stake by ID
    async fn load_stake(&self, id: &Uuid) -> Result<Option<Stake>, StoreError>;

    /// Persist an existing stake as version `stake.version + 1`.
    ///
    /// Fails with [`StoreError::StaleStake`] unless the stored record is
    /// still at `stake.version`.
    async fn save_stake(&self, stake: &Stake) -> Result<(), StoreError>;

    /// Debit the owner by the principal and insert the stake, atomically
    async fn create_stake(&self, stake: &Stake) -> Result<AccountChange, StoreError>;

    /// Get a user by ID
    async fn load_user(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError>;

    /// Insert a new user; fails if the ID is taken
    async fn insert_user(&self, user: &UserAccount) -> Result<(), StoreError>;

    /// Apply `mutation` to the stored account atomically
    async fn update_user(
        &self,
        user_id: &str,
        mutation: &UserMutation<'_>,
    ) -> Result<AccountChange, StoreError>;

    /// Credit `amount` to the owner unless a reward entry for `stake_id`
    /// already exists. The ledger entry and the credit land together.
    async fn settle_reward(
        &self,
        stake_id: &Uuid,
        owner_id: &str,
        amount: Decimal,
    ) -> Result<Settlement, StoreError>;

    /// Atomic wallet increment
    async fn credit_wallet(&self, user_id: &str, amount: Decimal) -> Result<AccountChange, StoreError> {
        self.update_user(user_id, &move |account: &mut UserAccount| account.credit(amount))
            .await
    }

    /// Atomic wallet decrement; rejected without partial debit when the
    /// balance is short
    async fn debit_wallet(&self, user_id: &str, amount: Decimal) -> Result<AccountChange, StoreError> {
        self.update_user(user_id, &move |account: &mut UserAccount| account.debit(amount))
            .await
    }
}

/// Account state before and after an atomic update
#[derive(Debug, Clone, PartialEq)]
pub struct AccountChange {
    pub before: UserAccount,
    pub after: UserAccount,
}

impl AccountChange {
    /// Net change to the wallet balance
    pub fn balance_delta(&self) -> Decimal {
        self.after.wallet_balance - self.before.wallet_balance
    }
}

/// Outcome of a reward settlement
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// The owner was credited now
    Credited(AccountChange),
    /// An earlier settlement already paid this stake
    AlreadySettled(RewardEntry),
}

/// Reward ledger entry, unique per stake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub stake_id: Uuid,
    pub owner_id: String,
    pub amount: Decimal,
    pub settled_at: DateTime<Utc>,
}

impl RewardEntry {
    pub fn new(stake_id: Uuid, owner_id: &str, amount: Decimal) -> Self {
        Self {
            stake_id,
            owner_id: owner_id.to_string(),
            amount,
            settled_at: Utc::now(),
        }
    }
}

/// Errors from ledger store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("User already exists: {0}")]
    DuplicateUser(String),

    #[error("Stake already exists: {0}")]
    DuplicateStake(Uuid),

    #[error("Stake {id} changed since it was loaded (expected version {expected})")]
    StaleStake { id: Uuid, expected: u64 },

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("Concurrent update on {key} not resolved after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("Storage error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for StakeflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => StakeflowError::NotFound(what),
            StoreError::DuplicateUser(id) => ValidationError::DuplicateUser(id).into(),
            StoreError::Wallet(err) => StakeflowError::Wallet(err),
            StoreError::Serialization(msg) => StakeflowError::Serialization(msg),
            other => StakeflowError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_store_error_mapping() {
        let err: StakeflowError = StoreError::NotFound("user bob".into()).into();
        assert!(matches!(err, StakeflowError::NotFound(_)));

        let err: StakeflowError = StoreError::Wallet(WalletError::InsufficientBalance {
            required: dec!(10),
            available: dec!(1),
        })
        .into();
        assert_eq!(err.kind(), "insufficient_balance");

        let err: StakeflowError = StoreError::Backend("connection reset".into()).into();
        assert!(matches!(err, StakeflowError::Storage(_)));
    }

    #[test]
    fn test_balance_delta() {
        let before = UserAccount::new("alice").with_balance(dec!(10));
        let mut after = before.clone();
        after.credit(dec!(6)).unwrap();
        let change = AccountChange { before, after };
        assert_eq!(change.balance_delta(), dec!(6));
    }
}
