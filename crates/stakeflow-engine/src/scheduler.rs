//! Reward distribution sweep
//!
//! A sweep loads every pending stake (active, or completed but unpaid) and
//! runs each one through [`StakeLifecycle::process`] independently. Up to
//! `concurrency` stakes are in flight at once. A failure on one stake is
//! recorded in the summary and never stops the rest.
//!
//! A sweep can be cut short with [`RewardScheduler::run_sweep_until`]: once
//! the cancel future resolves no further stakes are started, stakes already
//! in flight run to completion, and the untouched ones are left for the next
//! sweep.

use crate::lifecycle::{StakeLifecycle, StakeOutcome};
use crate::metrics::EngineMetrics;
use crate::notify::{notify_best_effort, Notifier, STAKE_ACCRUED, STAKE_COMPLETED};
use crate::store::LedgerStore;
use chrono::{DateTime, Utc};
use futures::future::{self, Future};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use stakeflow_common::{Result, StakeflowError, Stake};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument};
use uuid::Uuid;

/// A stake that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    pub stake_id: Uuid,
    pub kind: &'static str,
    pub reason: String,
}

/// Aggregate result of one sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepSummary {
    pub sweep_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Pending stakes found at the start of the sweep
    pub candidates: usize,
    /// Stakes processed without error
    pub processed: usize,
    /// Stakes that moved to completed during this sweep
    pub completed: usize,
    /// Stakes paid out during this sweep
    pub released: usize,
    pub failed: Vec<SweepFailure>,
    pub total_accrued: Decimal,
    pub total_paid_out: Decimal,
    /// The sweep stopped early
    pub cancelled: bool,
    /// Stakes never started because of cancellation
    pub skipped: usize,
}

impl SweepSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Runs reward sweeps over the pending stakes of a store
pub struct RewardScheduler {
    store: Arc<dyn LedgerStore>,
    lifecycle: Arc<StakeLifecycle>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<EngineMetrics>,
    concurrency: usize,
    notify_timeout: Duration,
}

impl RewardScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        lifecycle: Arc<StakeLifecycle>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<EngineMetrics>,
        concurrency: usize,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            store,
            lifecycle,
            notifier,
            metrics,
            concurrency: concurrency.max(1),
            notify_timeout,
        }
    }

    /// Sweep at the current time
    pub async fn run_sweep(&self) -> Result<SweepSummary> {
        self.run_sweep_at(Utc::now()).await
    }

    /// Sweep as of `now`
    pub async fn run_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        self.run_sweep_until(now, future::pending::<()>()).await
    }

    /// Sweep as of `now`, starting no new stakes once `cancel` resolves.
    ///
    /// Only loading the candidate set can fail the sweep as a whole.
    #[instrument(skip(self, cancel))]
    pub async fn run_sweep_until<F>(&self, now: DateTime<Utc>, cancel: F) -> Result<SweepSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let sweep_id = Uuid::now_v7();
        let started_at = Utc::now();
        let timer = Instant::now();

        let stakes = self.store.load_active_stakes().await?;
        let candidates = stakes.len();
        info!(%sweep_id, candidates, "Starting reward sweep");

        let results: Vec<(Uuid, Result<StakeOutcome>)> = stream::iter(stakes)
            .take_until(cancel)
            .map(|stake| self.process_one(stake, now))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = SweepSummary {
            sweep_id,
            started_at,
            finished_at: started_at,
            candidates,
            processed: 0,
            completed: 0,
            released: 0,
            failed: Vec::new(),
            total_accrued: Decimal::ZERO,
            total_paid_out: Decimal::ZERO,
            cancelled: results.len() < candidates,
            skipped: candidates - results.len(),
        };

        for (stake_id, result) in results {
            match result {
                Ok(outcome) => {
                    summary.processed += 1;
                    summary.total_accrued += outcome.delta;
                    summary.total_paid_out += outcome.paid_out;
                    if outcome.completed_now {
                        summary.completed += 1;
                    }
                    if outcome.released_now {
                        summary.released += 1;
                    }
                }
                Err(e) => {
                    error!(%sweep_id, %stake_id, error = %e, "Stake processing failed");
                    summary.failed.push(failure(stake_id, &e));
                }
            }
        }
        summary.finished_at = Utc::now();

        self.metrics.sweeps_total.inc();
        self.metrics
            .sweep_duration_seconds
            .observe(timer.elapsed().as_secs_f64());
        self.metrics.stakes_processed_total.inc_by(summary.processed as u64);
        self.metrics.stakes_completed_total.inc_by(summary.completed as u64);
        self.metrics.stake_failures_total.inc_by(summary.failed.len() as u64);
        self.metrics.record_payout(summary.total_paid_out);

        info!(
            %sweep_id,
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed.len(),
            skipped = summary.skipped,
            total_accrued = %summary.total_accrued,
            total_paid_out = %summary.total_paid_out,
            "Reward sweep finished"
        );

        Ok(summary)
    }

    async fn process_one(&self, stake: Stake, now: DateTime<Utc>) -> (Uuid, Result<StakeOutcome>) {
        let stake_id = stake.id;
        let result = self.lifecycle.process(stake, now).await;
        if let Ok(outcome) = &result {
            self.announce(outcome).await;
        }
        (stake_id, result)
    }

    async fn announce(&self, outcome: &StakeOutcome) {
        let event = if outcome.completed_now || outcome.released_now {
            STAKE_COMPLETED
        } else if outcome.delta > Decimal::ZERO {
            STAKE_ACCRUED
        } else {
            return;
        };

        let payload = json!({
            "stake_id": outcome.stake_id,
            "owner_id": outcome.owner_id,
            "earned": outcome.earned,
            "delta": outcome.delta,
            "progress_percent": outcome.progress_percent,
            "finalized": outcome.finalized(),
        });
        if !notify_best_effort(self.notifier.as_ref(), event, payload, self.notify_timeout).await {
            self.metrics.notification_failures_total.inc();
        }
    }
}

fn failure(stake_id: Uuid, err: &StakeflowError) -> SweepFailure {
    SweepFailure {
        stake_id,
        kind: err.kind(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{CompletionRule, PayoutPolicy};
    use crate::notify::BroadcastNotifier;
    use crate::store::InMemoryLedgerStore;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use stakeflow_common::UserAccount;

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        notifier: Arc<BroadcastNotifier>,
        scheduler: RewardScheduler,
    }

    fn fixture(concurrency: usize) -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let lifecycle = Arc::new(StakeLifecycle::new(
            store.clone(),
            CompletionRule::default(),
            PayoutPolicy::RewardOnly,
        ));
        let scheduler = RewardScheduler::new(
            store.clone(),
            lifecycle,
            notifier.clone(),
            Arc::new(EngineMetrics::new().unwrap()),
            concurrency,
            Duration::from_secs(1),
        );
        Fixture {
            store,
            notifier,
            scheduler,
        }
    }

    async fn open(
        store: &InMemoryLedgerStore,
        owner: &str,
        principal: Decimal,
        rate: Decimal,
        start: DateTime<Utc>,
    ) -> Stake {
        store
            .insert_user(&UserAccount::new(owner).with_balance(principal))
            .await
            .unwrap();
        let stake = Stake::new(owner, principal, rate, principal * dec!(3), start);
        store.create_stake(&stake).await.unwrap();
        stake
    }

    #[tokio::test]
    async fn test_sweep_accrues_and_completes() {
        let fx = fixture(4);
        let start = Utc::now();
        let slow = open(&fx.store, "alice", dec!(1000), dec!(1.6), start).await;
        let fast = open(&fx.store, "bob", dec!(100), dec!(3), start).await;

        // 100 days: alice at 1600 of 3000, bob capped at 300
        let summary = fx
            .scheduler
            .run_sweep_at(start + ChronoDuration::days(100))
            .await
            .unwrap();

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.released, 1);
        assert_eq!(summary.total_paid_out, dec!(300));
        assert_eq!(summary.total_accrued, dec!(1900));
        assert!(!summary.has_failures());
        assert!(!summary.cancelled);

        let slow = fx.store.load_stake(&slow.id).await.unwrap().unwrap();
        assert_eq!(slow.earned, dec!(1600));
        assert!(slow.is_active());

        let fast = fx.store.load_stake(&fast.id).await.unwrap().unwrap();
        assert!(fast.released);
        let bob = fx.store.load_user("bob").await.unwrap().unwrap();
        assert_eq!(bob.wallet_balance, dec!(300));

        let pending = fx.store.load_active_stakes().await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_second_sweep_pays_nothing() {
        let fx = fixture(2);
        let start = Utc::now();
        open(&fx.store, "bob", dec!(100), dec!(3), start).await;
        let end = start + ChronoDuration::days(100);

        let first = fx.scheduler.run_sweep_at(end).await.unwrap();
        assert_eq!(first.total_paid_out, dec!(300));

        let second = fx.scheduler.run_sweep_at(end).await.unwrap();
        assert_eq!(second.candidates, 0);
        assert_eq!(second.total_paid_out, Decimal::ZERO);

        let bob = fx.store.load_user("bob").await.unwrap().unwrap();
        assert_eq!(bob.wallet_balance, dec!(300));
    }

    #[tokio::test]
    async fn test_notifications_carry_progress() {
        let fx = fixture(1);
        let mut rx = fx.notifier.subscribe();
        let start = Utc::now();
        open(&fx.store, "alice", dec!(1000), dec!(1.6), start).await;

        fx.scheduler
            .run_sweep_at(start + ChronoDuration::days(10))
            .await
            .unwrap();

        let note = rx.recv().await.unwrap();
        assert_eq!(note.event, STAKE_ACCRUED);
        assert_eq!(note.payload["finalized"], false);
        let earned: Decimal = note.payload["earned"].as_str().unwrap().parse().unwrap();
        assert_eq!(earned, dec!(160));
    }

    #[tokio::test]
    async fn test_cancelled_sweep_skips_everything() {
        let fx = fixture(2);
        let start = Utc::now();
        open(&fx.store, "alice", dec!(1000), dec!(1.6), start).await;
        open(&fx.store, "bob", dec!(100), dec!(3), start).await;

        let summary = fx
            .scheduler
            .run_sweep_until(start + ChronoDuration::days(10), future::ready(()))
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.skipped, 2);
        assert_eq!(fx.store.load_active_stakes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let fx = fixture(16);
        let summary = fx.scheduler.run_sweep().await.unwrap();
        assert_eq!(summary.candidates, 0);
        assert!(!summary.cancelled);
    }
}
