//! # Stakeflow Engine
//!
//! Stake accrual, completion, payout and referral commissions.
//!
//! ## Components
//!
//! - **Rates**: tiered daily rate resolved once when a stake opens
//! - **Accrual**: capped linear reward over fractional elapsed days
//! - **Lifecycle**: Active → Completed → released, each step at most once
//! - **Referral**: single-level commission cascade with level promotion
//! - **Scheduler**: concurrent, cancellable sweep over pending stakes
//! - **Store**: in-memory (DashMap) and Redis ledger backends
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     StakingEngine                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ RateTable  │  │RewardScheduler│──│  StakeLifecycle  │  │
//! │  └────────────┘  └──────────────┘  └──────────────────┘  │
//! │  ┌────────────────┐          │               │           │
//! │  │ReferralCascade │──────────┴───────┬───────┘           │
//! │  └────────────────┘                  ▼                   │
//! │                    ┌──────────────────────────────────┐  │
//! │                    │  LedgerStore   │    Notifier      │  │
//! │                    └──────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod accrual;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod rates;
pub mod referral;
pub mod scheduler;
pub mod store;

pub use config::EngineConfig;
pub use engine::{OpenedStake, StakeView, StakingEngine};
pub use lifecycle::{CompletionRule, PayoutPolicy, StakeLifecycle, StakeOutcome};
pub use metrics::EngineMetrics;
pub use notify::{BroadcastNotifier, Notification, Notifier, NotifyError, RedisNotifier, TracingNotifier};
pub use rates::{RateTable, RateTier};
pub use referral::{CascadeOutcome, CommissionPolicy, InvestmentReceipt, ReferralCascade};
pub use scheduler::{RewardScheduler, SweepFailure, SweepSummary};
pub use store::{
    AccountChange, InMemoryLedgerStore, LedgerStore, RedisLedgerStore, RewardEntry, Settlement, StoreError,
};
