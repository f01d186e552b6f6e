//! User account - wallet balance plus referral standing
//!
//! The wallet is the one record touched concurrently by stake payouts,
//! referral commissions, stake creation and withdrawals. Every mutation
//! goes through [`UserAccount::credit`]/[`UserAccount::debit`] on a freshly
//! loaded copy and bumps `version`, so stores can apply it as a
//! compare-and-swap instead of a blind overwrite.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Level every new account starts at
pub const INITIAL_LEVEL: u32 = 1;

/// Wallet operation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WalletError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
}

/// A platform user as seen by the reward engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    /// Opaque user identifier
    pub id: String,

    /// Spendable balance
    pub wallet_balance: Decimal,

    /// Who referred this user. A lookup edge only, never ownership.
    pub referred_by: Option<String>,

    /// Referral level, selects the commission tier (>= 1)
    pub level: u32,

    /// Referred users whose investment qualified
    pub active_users_count: u32,

    /// Version for optimistic concurrency control
    pub version: u64,

    /// Timestamp of last modification
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    /// Create a new empty account at level 1
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            wallet_balance: Decimal::ZERO,
            referred_by: None,
            level: INITIAL_LEVEL,
            active_users_count: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Set the referrer
    pub fn referred_by(mut self, referrer_id: impl Into<String>) -> Self {
        self.referred_by = Some(referrer_id.into());
        self
    }

    /// Create an account with an opening balance
    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.wallet_balance = balance;
        self
    }

    /// Credit the wallet
    pub fn credit(&mut self, amount: Decimal) -> Result<(), WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount);
        }

        self.wallet_balance += amount;
        self.touch();
        Ok(())
    }

    /// Debit the wallet; nothing changes unless the full amount is available
    pub fn debit(&mut self, amount: Decimal) -> Result<(), WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount);
        }

        if self.wallet_balance < amount {
            return Err(WalletError::InsufficientBalance {
                required: amount,
                available: self.wallet_balance,
            });
        }

        self.wallet_balance -= amount;
        self.touch();
        Ok(())
    }

    /// Record one more qualifying referral
    pub fn record_active_referral(&mut self) {
        self.active_users_count = self.active_users_count.saturating_add(1);
        self.touch();
    }

    /// Promote one level when the active count has reached the current level.
    ///
    /// Returns true when a promotion happened.
    pub fn try_level_up(&mut self) -> bool {
        if self.active_users_count >= self.level {
            self.level += 1;
            self.touch();
            true
        } else {
            false
        }
    }

    /// Check the version a caller read against the current one
    pub fn check_version(&self, expected: u64) -> Result<(), WalletError> {
        if self.version != expected {
            return Err(WalletError::VersionConflict {
                expected,
                found: self.version,
            });
        }
        Ok(())
    }

    /// Update version and timestamp
    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl std::fmt::Display for UserAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UserAccount({}, balance={}, level={}, active={})",
            self.id, self.wallet_balance, self.level, self.active_users_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_account() {
        let account = UserAccount::new("alice");
        assert_eq!(account.wallet_balance, Decimal::ZERO);
        assert_eq!(account.level, 1);
        assert_eq!(account.active_users_count, 0);
        assert!(account.referred_by.is_none());
    }

    #[test]
    fn test_credit_debit() {
        let mut account = UserAccount::new("alice");

        account.credit(dec!(100)).unwrap();
        assert_eq!(account.wallet_balance, dec!(100));

        account.debit(dec!(30)).unwrap();
        assert_eq!(account.wallet_balance, dec!(70));
    }

    #[test]
    fn test_insufficient_balance_leaves_wallet_untouched() {
        let mut account = UserAccount::new("alice").with_balance(dec!(50));
        let version = account.version;

        let result = account.debit(dec!(100));
        assert!(matches!(result, Err(WalletError::InsufficientBalance { .. })));
        assert_eq!(account.wallet_balance, dec!(50));
        assert_eq!(account.version, version);
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        let mut account = UserAccount::new("alice");
        assert_eq!(account.credit(Decimal::ZERO), Err(WalletError::InvalidAmount));
        assert_eq!(account.debit(dec!(-1)), Err(WalletError::InvalidAmount));
    }

    #[test]
    fn test_level_up_threshold_is_current_level() {
        let mut account = UserAccount::new("bob");
        assert!(!account.try_level_up());

        account.record_active_referral();
        assert!(account.try_level_up());
        assert_eq!(account.level, 2);

        // one active referral is not enough for level 3
        assert!(!account.try_level_up());
    }

    #[test]
    fn test_version_increment() {
        let mut account = UserAccount::new("alice");
        let initial_version = account.version;

        account.credit(dec!(10)).unwrap();
        assert_eq!(account.version, initial_version + 1);
        assert!(account.check_version(initial_version).is_err());
        assert!(account.check_version(initial_version + 1).is_ok());
    }
}
