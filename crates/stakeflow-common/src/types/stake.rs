//! Stake record
//!
//! A stake (investment) is never deleted. It accrues while `Active`, moves
//! to `Completed` exactly once, and is flagged `released` exactly once after
//! its payout has been credited to the owner.
//!
//! `version` counts stored writes. Stores only accept a write carrying the
//! version they hold, so a copy loaded before another writer's commit can
//! never overwrite it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stake status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeStatus {
    Active,
    Completed,
}

impl std::fmt::Display for StakeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A staked principal accruing a frozen daily rate up to a cap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stake {
    /// Stake identifier
    pub id: Uuid,
    /// Owning user
    pub owner_id: String,
    /// Staked amount
    pub principal: Decimal,
    /// Daily reward percent, frozen at creation
    pub daily_rate_percent: Decimal,
    /// Reward accrued so far
    pub earned: Decimal,
    /// Maximum reward, frozen at creation
    pub cap_amount: Decimal,
    pub status: StakeStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Payout has been credited to the owner
    pub released: bool,
    pub updated_at: DateTime<Utc>,
    /// Stored write count
    #[serde(default)]
    pub version: u64,
}

impl Stake {
    /// Create an active stake with its terms frozen
    pub fn new(
        owner_id: impl Into<String>,
        principal: Decimal,
        daily_rate_percent: Decimal,
        cap_amount: Decimal,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner_id: owner_id.into(),
            principal,
            daily_rate_percent,
            earned: Decimal::ZERO,
            cap_amount,
            status: StakeStatus::Active,
            started_at,
            completed_at: None,
            released: false,
            updated_at: started_at,
            version: 0,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == StakeStatus::Active
    }

    /// Completed with the payout still owed
    #[inline]
    pub fn awaiting_release(&self) -> bool {
        self.status == StakeStatus::Completed && !self.released
    }

    /// Still needs work from a sweep
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.is_active() || self.awaiting_release()
    }

    /// Transition to `Completed`. Returns false if already completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == StakeStatus::Completed {
            return false;
        }
        self.status = StakeStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Flag the payout as credited. Returns false if not completed or
    /// already released.
    pub fn mark_released(&mut self, now: DateTime<Utc>) -> bool {
        if !self.awaiting_release() {
            return false;
        }
        self.released = true;
        self.updated_at = now;
        true
    }
}
