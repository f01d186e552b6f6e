//! Stake lifecycle
//!
//! ```text
//!   Active ──(earned ≥ cap | elapsed ≥ max duration)──▶ Completed ──▶ released
//! ```
//!
//! [`advance`] is the pure part: accrue, clamp the delta at zero, detect
//! completion. [`StakeLifecycle::process`] adds the payout and persistence.
//! Both are safe to repeat: a second call at the same instant changes
//! nothing, and the payout is guarded by the store's reward ledger.
//! Writes are versioned; a copy that went stale while it was being
//! processed is reloaded and advanced again, never written over the newer
//! record.

use crate::accrual::{accrue, elapsed_days_between, progress_percent};
use crate::store::{LedgerStore, Settlement, StoreError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stakeflow_common::{CalculationError, Result, Stake, StakeflowError};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Reloads of a stake that changed underneath one `process` call
pub const MAX_STALE_RELOADS: u32 = 4;

/// What ends a stake besides reaching its cap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRule {
    /// Complete once this many days have elapsed
    pub max_duration_days: Option<Decimal>,
}

/// What a completed stake credits to its owner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutPolicy {
    /// Earned reward only; the principal is not returned
    #[default]
    RewardOnly,
    /// Earned reward plus the principal
    RewardAndPrincipal,
}

impl PayoutPolicy {
    pub fn payout_for(&self, stake: &Stake) -> Decimal {
        match self {
            Self::RewardOnly => stake.earned,
            Self::RewardAndPrincipal => stake.earned + stake.principal,
        }
    }
}

/// Result of one pure accrual step
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub elapsed_days: Decimal,
    /// Amount added to `earned` by this step
    pub delta: Decimal,
    /// This step moved the stake to `Completed`
    pub completed_now: bool,
}

/// Accrue a stake up to `now` and detect completion.
///
/// Never decreases `earned`; a completed stake is left untouched.
pub fn advance(
    stake: &mut Stake,
    now: DateTime<Utc>,
    rule: &CompletionRule,
) -> std::result::Result<Advance, CalculationError> {
    let elapsed_days = elapsed_days_between(stake.started_at, now);
    if !stake.is_active() {
        return Ok(Advance {
            elapsed_days,
            delta: Decimal::ZERO,
            completed_now: false,
        });
    }

    let new_earned = accrue(
        stake.principal,
        stake.daily_rate_percent,
        elapsed_days,
        stake.cap_amount,
    )?;

    let delta = (new_earned - stake.earned).max(Decimal::ZERO);
    if delta > Decimal::ZERO {
        stake.earned += delta;
        stake.updated_at = now;
    }

    let duration_elapsed = rule
        .max_duration_days
        .map_or(false, |max| elapsed_days >= max);
    let completed_now =
        (stake.earned >= stake.cap_amount || duration_elapsed) && stake.complete(now);

    Ok(Advance {
        elapsed_days,
        delta,
        completed_now,
    })
}

/// What processing one stake did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StakeOutcome {
    pub stake_id: Uuid,
    pub owner_id: String,
    pub delta: Decimal,
    pub earned: Decimal,
    pub progress_percent: Decimal,
    pub completed_now: bool,
    /// Payout flag set during this call
    pub released_now: bool,
    /// Amount credited to the owner during this call
    pub paid_out: Decimal,
    /// Whether the stake was written back
    pub persisted: bool,
}

impl StakeOutcome {
    /// Completed and paid
    pub fn finalized(&self) -> bool {
        self.released_now
    }

    pub fn changed(&self) -> bool {
        self.persisted
    }
}

/// Applies the lifecycle to stored stakes
pub struct StakeLifecycle {
    store: Arc<dyn LedgerStore>,
    rule: CompletionRule,
    payout: PayoutPolicy,
}

impl StakeLifecycle {
    pub fn new(store: Arc<dyn LedgerStore>, rule: CompletionRule, payout: PayoutPolicy) -> Self {
        Self {
            store,
            rule,
            payout,
        }
    }

    pub fn rule(&self) -> &CompletionRule {
        &self.rule
    }

    pub fn payout_policy(&self) -> PayoutPolicy {
        self.payout
    }

    /// Advance one stake to `now`, pay it out if it is complete and unpaid,
    /// and persist any change.
    #[instrument(skip(self, stake), fields(stake_id = %stake.id, owner = %stake.owner_id))]
    pub async fn process(&self, mut stake: Stake, now: DateTime<Utc>) -> Result<StakeOutcome> {
        let mut paid_out = Decimal::ZERO;

        for reload in 0..=MAX_STALE_RELOADS {
            let mut outcome = self.apply(&mut stake, now).await?;
            paid_out += outcome.paid_out;
            outcome.paid_out = paid_out;

            if !outcome.persisted {
                return Ok(outcome);
            }
            match self.store.save_stake(&stake).await {
                Ok(()) => return Ok(outcome),
                Err(StoreError::StaleStake { expected, .. }) => {
                    debug!(expected, reload, "Stake changed since it was loaded, reloading");
                    stake = self
                        .store
                        .load_stake(&stake.id)
                        .await?
                        .ok_or_else(|| StakeflowError::NotFound(format!("stake {}", stake.id)))?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Contention {
            key: format!("stake {}", stake.id),
            attempts: MAX_STALE_RELOADS + 1,
        }
        .into())
    }

    /// One pass over an in-memory copy: accrue, then settle the payout if
    /// owed. `persisted` on the result means the copy needs writing.
    async fn apply(&self, stake: &mut Stake, now: DateTime<Utc>) -> Result<StakeOutcome> {
        let step = advance(stake, now, &self.rule)?;

        if step.completed_now {
            info!(earned = %stake.earned, cap = %stake.cap_amount, "Stake completed");
        }

        let mut paid_out = Decimal::ZERO;
        let mut released_now = false;

        if stake.awaiting_release() {
            let payout = self.payout.payout_for(stake);
            if payout > Decimal::ZERO {
                match self
                    .store
                    .settle_reward(&stake.id, &stake.owner_id, payout)
                    .await?
                {
                    Settlement::Credited(change) => {
                        paid_out = payout;
                        info!(
                            amount = %payout,
                            balance = %change.after.wallet_balance,
                            "Stake payout credited"
                        );
                    }
                    Settlement::AlreadySettled(entry) => {
                        debug!(settled_at = %entry.settled_at, "Payout already in reward ledger");
                    }
                }
            }
            released_now = stake.mark_released(now);
        }

        Ok(StakeOutcome {
            stake_id: stake.id,
            owner_id: stake.owner_id.clone(),
            delta: step.delta,
            earned: stake.earned,
            progress_percent: progress_percent(stake.earned, stake.cap_amount),
            completed_now: step.completed_now,
            released_now,
            paid_out,
            persisted: step.delta > Decimal::ZERO || step.completed_now || released_now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use stakeflow_common::{StakeStatus, UserAccount};

    fn stake_at(start: DateTime<Utc>) -> Stake {
        Stake::new("alice", dec!(1000), dec!(1.6), dec!(3000), start)
    }

    #[test]
    fn test_advance_accrues_delta() {
        let start = Utc::now();
        let mut stake = stake_at(start);

        let step = advance(&mut stake, start + Duration::days(10), &CompletionRule::default()).unwrap();
        assert_eq!(step.delta, dec!(160));
        assert_eq!(stake.earned, dec!(160));
        assert!(!step.completed_now);

        let step = advance(&mut stake, start + Duration::days(11), &CompletionRule::default()).unwrap();
        assert_eq!(step.delta, dec!(16));
        assert_eq!(stake.earned, dec!(176));
    }

    #[test]
    fn test_clock_skew_never_decreases_earned() {
        let start = Utc::now();
        let mut stake = stake_at(start);
        advance(&mut stake, start + Duration::days(10), &CompletionRule::default()).unwrap();

        let step = advance(&mut stake, start + Duration::days(5), &CompletionRule::default()).unwrap();
        assert_eq!(step.delta, Decimal::ZERO);
        assert_eq!(stake.earned, dec!(160));

        let step = advance(&mut stake, start - Duration::days(1), &CompletionRule::default()).unwrap();
        assert_eq!(step.delta, Decimal::ZERO);
        assert_eq!(stake.earned, dec!(160));
    }

    #[test]
    fn test_completes_at_cap_once() {
        let start = Utc::now();
        let mut stake = stake_at(start);
        let end = start + Duration::milliseconds(16_200_000_000);

        let step = advance(&mut stake, end, &CompletionRule::default()).unwrap();
        assert!(step.completed_now);
        assert_eq!(stake.earned, dec!(3000));
        assert_eq!(stake.status, StakeStatus::Completed);
        assert_eq!(stake.completed_at, Some(end));

        let later = end + Duration::days(30);
        let step = advance(&mut stake, later, &CompletionRule::default()).unwrap();
        assert!(!step.completed_now);
        assert_eq!(step.delta, Decimal::ZERO);
        assert_eq!(stake.completed_at, Some(end));
    }

    #[test]
    fn test_duration_rule_completes_before_cap() {
        let start = Utc::now();
        let mut stake = stake_at(start);
        let rule = CompletionRule {
            max_duration_days: Some(dec!(30)),
        };

        let step = advance(&mut stake, start + Duration::days(30), &rule).unwrap();
        assert!(step.completed_now);
        assert_eq!(stake.earned, dec!(480));
    }

    #[test]
    fn test_payout_policy() {
        let mut stake = stake_at(Utc::now());
        stake.earned = dec!(3000);
        assert_eq!(PayoutPolicy::RewardOnly.payout_for(&stake), dec!(3000));
        assert_eq!(PayoutPolicy::RewardAndPrincipal.payout_for(&stake), dec!(4000));
    }

    async fn lifecycle_with_stake(start: DateTime<Utc>) -> (Arc<InMemoryLedgerStore>, StakeLifecycle, Stake) {
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .insert_user(&UserAccount::new("alice").with_balance(dec!(1000)))
            .await
            .unwrap();
        let stake = stake_at(start);
        store.create_stake(&stake).await.unwrap();
        let lifecycle = StakeLifecycle::new(store.clone(), CompletionRule::default(), PayoutPolicy::RewardOnly);
        (store, lifecycle, stake)
    }

    #[tokio::test]
    async fn test_process_is_idempotent_at_same_instant() {
        let start = Utc::now();
        let (store, lifecycle, stake) = lifecycle_with_stake(start).await;
        let now = start + Duration::days(3);

        let first = lifecycle.process(stake.clone(), now).await.unwrap();
        assert!(first.persisted);

        let reloaded = store.load_stake(&stake.id).await.unwrap().unwrap();
        let second = lifecycle.process(reloaded.clone(), now).await.unwrap();
        assert!(!second.persisted);
        assert_eq!(second.delta, Decimal::ZERO);

        let after = store.load_stake(&stake.id).await.unwrap().unwrap();
        assert_eq!(after, reloaded);
    }

    #[tokio::test]
    async fn test_process_pays_reward_once() {
        let start = Utc::now();
        let (store, lifecycle, stake) = lifecycle_with_stake(start).await;
        let end = start + Duration::milliseconds(16_200_000_000);

        let outcome = lifecycle.process(stake.clone(), end).await.unwrap();
        assert!(outcome.completed_now);
        assert!(outcome.finalized());
        assert_eq!(outcome.paid_out, dec!(3000));

        // replay the stale copy, as a retried sweep would
        let replay = lifecycle.process(stake, end).await.unwrap();
        assert_eq!(replay.paid_out, Decimal::ZERO);

        let alice = store.load_user("alice").await.unwrap().unwrap();
        assert_eq!(alice.wallet_balance, dec!(3000));
        assert_eq!(store.reward_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_copy_never_regresses_completed_stake() {
        let start = Utc::now();
        let (store, lifecycle, stake) = lifecycle_with_stake(start).await;
        let end = start + Duration::milliseconds(16_200_000_000);

        lifecycle.process(stake.clone(), end).await.unwrap();
        let finished = store.load_stake(&stake.id).await.unwrap().unwrap();

        // a copy loaded before completion, processed at an earlier instant
        let late = lifecycle.process(stake.clone(), start + Duration::days(10)).await.unwrap();
        assert!(!late.persisted);
        assert!(!late.completed_now);
        assert_eq!(late.earned, dec!(3000));
        assert_eq!(late.paid_out, Decimal::ZERO);

        let stored = store.load_stake(&stake.id).await.unwrap().unwrap();
        assert_eq!(stored, finished);
        assert_eq!(stored.completed_at, Some(end));
        assert!(stored.released);
    }

    #[tokio::test]
    async fn test_stale_copy_of_active_stake_is_re_advanced() {
        let start = Utc::now();
        let (store, lifecycle, stake) = lifecycle_with_stake(start).await;

        lifecycle.process(stake.clone(), start + Duration::days(10)).await.unwrap();

        let outcome = lifecycle.process(stake.clone(), start + Duration::days(11)).await.unwrap();
        assert!(outcome.persisted);
        assert_eq!(outcome.delta, dec!(16));

        let stored = store.load_stake(&stake.id).await.unwrap().unwrap();
        assert_eq!(stored.earned, dec!(176));
        assert_eq!(stored.version, 2);
    }
}
