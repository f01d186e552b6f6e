//! Engine facade
//!
//! Wires the rate table, lifecycle, referral cascade and sweep scheduler
//! around one store, one notifier and one metrics set.

use crate::accrual::{accrue, cap_for, days_to_cap, elapsed_days_between, progress_percent};
use crate::config::EngineConfig;
use crate::lifecycle::StakeLifecycle;
use crate::metrics::EngineMetrics;
use crate::notify::Notifier;
use crate::rates::RateTable;
use crate::referral::{CommissionPolicy, InvestmentReceipt, ReferralCascade};
use crate::scheduler::{RewardScheduler, SweepSummary};
use crate::store::LedgerStore;
use chrono::{DateTime, Utc};
use futures::Future;
use rust_decimal::Decimal;
use serde::Serialize;
use stakeflow_common::{Result, Stake, StakeflowError, UserAccount, ValidationError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// A stake with a live projection of its progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StakeView {
    pub stake: Stake,
    pub elapsed_days: Decimal,
    /// What the stake would hold if swept now
    pub projected_earned: Decimal,
    pub progress_percent: Decimal,
    /// Days from start until the cap is reached at the frozen rate
    pub days_to_cap: Option<Decimal>,
}

/// A newly opened stake and the referral cascade it triggered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenedStake {
    pub stake: Stake,
    /// `None` when the cascade failed after the stake was committed
    pub referral: Option<InvestmentReceipt>,
}

/// Staking and referral engine
pub struct StakingEngine {
    config: EngineConfig,
    rates: RateTable,
    store: Arc<dyn LedgerStore>,
    metrics: Arc<EngineMetrics>,
    cascade: ReferralCascade,
    scheduler: RewardScheduler,
}

impl StakingEngine {
    /// Build an engine; fails on an invalid configuration
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let rates = config.rate_table()?;
        let metrics = Arc::new(
            EngineMetrics::new().map_err(|e| StakeflowError::Internal(format!("metrics: {}", e)))?,
        );
        let notify_timeout = Duration::from_millis(config.notify_timeout_ms);

        let lifecycle = Arc::new(StakeLifecycle::new(
            store.clone(),
            config.completion_rule(),
            config.payout_policy,
        ));
        let cascade = ReferralCascade::new(
            store.clone(),
            notifier.clone(),
            metrics.clone(),
            CommissionPolicy {
                minimum_qualifying_amount: config.minimum_qualifying_amount,
                rates_by_level: config.commission_rates_by_level.clone(),
            },
            notify_timeout,
        );
        let scheduler = RewardScheduler::new(
            store.clone(),
            lifecycle,
            notifier,
            metrics.clone(),
            config.sweep_concurrency,
            notify_timeout,
        );

        info!(
            tiers = rates.tiers().len(),
            payout = ?config.payout_policy,
            concurrency = config.sweep_concurrency,
            "Staking engine ready"
        );

        Ok(Self {
            config,
            rates,
            store,
            metrics,
            cascade,
            scheduler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Create a wallet at level 1. A referrer, when given, must exist.
    #[instrument(skip(self))]
    pub async fn register_user(&self, user_id: &str, referred_by: Option<&str>) -> Result<UserAccount> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(ValidationError::MissingField { field: "user_id" }.into());
        }

        let mut account = UserAccount::new(user_id);
        if let Some(referrer) = referred_by.map(str::trim).filter(|r| !r.is_empty()) {
            if referrer == user_id {
                return Err(ValidationError::SelfReferral.into());
            }
            if self.store.load_user(referrer).await?.is_none() {
                return Err(StakeflowError::NotFound(format!("referrer {}", referrer)));
            }
            account = account.referred_by(referrer);
        }

        self.store.insert_user(&account).await?;
        info!(user = %account.id, referrer = ?account.referred_by, "User registered");
        Ok(account)
    }

    pub async fn user(&self, user_id: &str) -> Result<UserAccount> {
        self.store
            .load_user(user_id)
            .await?
            .ok_or_else(|| StakeflowError::NotFound(format!("user {}", user_id)))
    }

    /// Fund a wallet
    #[instrument(skip(self))]
    pub async fn deposit(&self, user_id: &str, amount: Decimal) -> Result<UserAccount> {
        ensure_positive(amount)?;
        let change = self.store.credit_wallet(user_id, amount).await?;
        Ok(change.after)
    }

    /// Debit a wallet; rejected without partial debit when the balance is short
    #[instrument(skip(self))]
    pub async fn withdraw(&self, user_id: &str, amount: Decimal) -> Result<UserAccount> {
        ensure_positive(amount)?;
        let change = self.store.debit_wallet(user_id, amount).await?;
        info!(user = %user_id, amount = %amount, balance = %change.after.wallet_balance, "Withdrawal applied");
        Ok(change.after)
    }

    /// Stake `principal` from the owner's wallet starting now
    pub async fn open_stake(&self, owner_id: &str, principal: Decimal) -> Result<OpenedStake> {
        self.open_stake_at(owner_id, principal, Utc::now()).await
    }

    /// Stake `principal` from the owner's wallet with rate and cap frozen
    /// at `started_at`, then run the referral cascade for the investment.
    ///
    /// The stake stands once committed; a failed cascade is logged and
    /// reported as a missing receipt.
    #[instrument(skip(self))]
    pub async fn open_stake_at(
        &self,
        owner_id: &str,
        principal: Decimal,
        started_at: DateTime<Utc>,
    ) -> Result<OpenedStake> {
        if owner_id.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "owner_id" }.into());
        }
        let rate = self.rates.rate_for(principal)?;
        let cap = cap_for(principal, self.config.cap_multiplier)?;

        let stake = Stake::new(owner_id, principal, rate, cap, started_at);
        let change = self.store.create_stake(&stake).await?;

        info!(
            stake_id = %stake.id,
            owner = %owner_id,
            principal = %principal,
            rate = %rate,
            cap = %cap,
            balance = %change.after.wallet_balance,
            "Stake opened"
        );

        let referral = match self.cascade.record_investment(owner_id, principal).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                error!(stake_id = %stake.id, error = %e, "Referral cascade failed for opened stake");
                None
            }
        };

        Ok(OpenedStake { stake, referral })
    }

    /// Record an investment funded outside the engine for the referral
    /// cascade. Stakes opened here already run it.
    pub async fn record_investment(&self, user_id: &str, amount: Decimal) -> Result<InvestmentReceipt> {
        self.cascade.record_investment(user_id, amount).await
    }

    pub async fn run_sweep(&self) -> Result<SweepSummary> {
        self.scheduler.run_sweep().await
    }

    pub async fn run_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        self.scheduler.run_sweep_at(now).await
    }

    pub async fn run_sweep_until<F>(&self, now: DateTime<Utc>, cancel: F) -> Result<SweepSummary>
    where
        F: Future<Output = ()> + Send,
    {
        self.scheduler.run_sweep_until(now, cancel).await
    }

    /// Stake plus a read-only projection at the current time
    pub async fn stake_view(&self, stake_id: &Uuid) -> Result<StakeView> {
        self.stake_view_at(stake_id, Utc::now()).await
    }

    pub async fn stake_view_at(&self, stake_id: &Uuid, now: DateTime<Utc>) -> Result<StakeView> {
        let stake = self
            .store
            .load_stake(stake_id)
            .await?
            .ok_or_else(|| StakeflowError::NotFound(format!("stake {}", stake_id)))?;

        let elapsed_days = elapsed_days_between(stake.started_at, now);
        let projected_earned = if stake.is_active() {
            accrue(stake.principal, stake.daily_rate_percent, elapsed_days, stake.cap_amount)?
                .max(stake.earned)
        } else {
            stake.earned
        };
        let days_to_cap = stake
            .cap_amount
            .checked_div(stake.principal)
            .and_then(|multiplier| days_to_cap(stake.daily_rate_percent, multiplier));

        Ok(StakeView {
            progress_percent: progress_percent(projected_earned, stake.cap_amount),
            elapsed_days,
            projected_earned,
            days_to_cap,
            stake,
        })
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount(amount.to_string()).into());
    }
    Ok(())
}
