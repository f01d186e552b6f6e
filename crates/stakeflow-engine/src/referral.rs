//! Referral commission cascade
//!
//! A qualifying investment credits the investor's immediate referrer with a
//! commission picked by the referrer's level, counts one more active
//! referral, and promotes the referrer once that count reaches its level.
//! Only the immediate referrer is paid; the upline is not walked.
//!
//! | level | commission |
//! |-------|------------|
//! | 1     | 12%        |
//! | 2     | 5%         |
//! | 3     | 2%         |
//! | 4     | 2%         |
//! | 5+    | 0%         |

use crate::metrics::EngineMetrics;
use crate::notify::{notify_best_effort, Notifier, REFERRAL_COMMISSION};
use crate::store::{LedgerStore, StoreError};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::json;
use stakeflow_common::{
    CalculationError, Result, StakeflowError, UserAccount, ValidationError, WalletError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Commission thresholds and rates
#[derive(Debug, Clone)]
pub struct CommissionPolicy {
    pub minimum_qualifying_amount: Decimal,
    pub rates_by_level: BTreeMap<u32, Decimal>,
}

impl CommissionPolicy {
    /// Commission percent for a level; unlisted levels earn nothing
    pub fn rate_for_level(&self, level: u32) -> Decimal {
        self.rates_by_level.get(&level).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn qualifies(&self, amount: Decimal) -> bool {
        amount >= self.minimum_qualifying_amount
    }

    /// Commission owed at every configured level for `amount`
    fn commissions_for(&self, amount: Decimal) -> std::result::Result<BTreeMap<u32, Decimal>, CalculationError> {
        self.rates_by_level
            .iter()
            .map(|(level, rate)| {
                amount
                    .checked_mul(*rate)
                    .map(|v| (*level, v / dec!(100)))
                    .ok_or(CalculationError::Overflow)
            })
            .collect()
    }
}

/// What the cascade did for one investment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CascadeOutcome {
    /// Amount below the qualifying threshold
    BelowThreshold,
    /// Investor has no referrer
    NoReferrer,
    /// Referrer record is missing
    DanglingReferrer { referrer_id: String },
    /// Referrer updated
    Credited {
        referrer_id: String,
        level_before: u32,
        level_after: u32,
        commission_rate_percent: Decimal,
        commission: Decimal,
        active_users_count: u32,
        referrer_balance: Decimal,
    },
}

/// Result of recording an investment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvestmentReceipt {
    pub user_id: String,
    pub amount: Decimal,
    pub qualifying: bool,
    #[serde(flatten)]
    pub outcome: CascadeOutcome,
}

impl InvestmentReceipt {
    /// Commission credited, zero when nothing was paid
    pub fn commission(&self) -> Decimal {
        match &self.outcome {
            CascadeOutcome::Credited { commission, .. } => *commission,
            _ => Decimal::ZERO,
        }
    }
}

/// Single-level referral commission cascade
pub struct ReferralCascade {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<EngineMetrics>,
    policy: CommissionPolicy,
    notify_timeout: Duration,
}

impl ReferralCascade {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<EngineMetrics>,
        policy: CommissionPolicy,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            metrics,
            policy,
            notify_timeout,
        }
    }

    pub fn policy(&self) -> &CommissionPolicy {
        &self.policy
    }

    /// Record an investment by `user_id` and pay its referrer if it qualifies
    #[instrument(skip(self))]
    pub async fn record_investment(&self, user_id: &str, amount: Decimal) -> Result<InvestmentReceipt> {
        if user_id.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "user_id" }.into());
        }
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount.to_string()).into());
        }

        let investor = self
            .store
            .load_user(user_id)
            .await?
            .ok_or_else(|| StakeflowError::NotFound(format!("user {}", user_id)))?;

        let receipt = |qualifying: bool, outcome: CascadeOutcome| InvestmentReceipt {
            user_id: user_id.to_string(),
            amount,
            qualifying,
            outcome,
        };

        if !self.policy.qualifies(amount) {
            debug!(minimum = %self.policy.minimum_qualifying_amount, "Investment below qualifying amount");
            return Ok(receipt(false, CascadeOutcome::BelowThreshold));
        }

        let referrer_id = match investor.referred_by.as_deref() {
            Some(id) if id != investor.id => id.to_string(),
            _ => return Ok(receipt(true, CascadeOutcome::NoReferrer)),
        };

        let commissions = self.policy.commissions_for(amount)?;
        let mutation = |referrer: &mut UserAccount| -> std::result::Result<(), WalletError> {
            referrer.record_active_referral();
            if let Some(commission) = commissions.get(&referrer.level) {
                if *commission > Decimal::ZERO {
                    referrer.credit(*commission)?;
                }
            }
            referrer.try_level_up();
            Ok(())
        };

        let change = match self.store.update_user(&referrer_id, &mutation).await {
            Ok(change) => change,
            Err(StoreError::NotFound(_)) => {
                warn!(referrer = %referrer_id, "Referrer record missing, skipping commission");
                return Ok(receipt(true, CascadeOutcome::DanglingReferrer { referrer_id }));
            }
            Err(e) => return Err(e.into()),
        };

        let commission = change.balance_delta();
        let outcome = CascadeOutcome::Credited {
            referrer_id: referrer_id.clone(),
            level_before: change.before.level,
            level_after: change.after.level,
            commission_rate_percent: self.policy.rate_for_level(change.before.level),
            commission,
            active_users_count: change.after.active_users_count,
            referrer_balance: change.after.wallet_balance,
        };

        info!(
            referrer = %referrer_id,
            commission = %commission,
            level = change.after.level,
            "Referral commission applied"
        );
        if commission > Decimal::ZERO {
            self.metrics.record_commission(commission);
        }

        let delivered = notify_best_effort(
            self.notifier.as_ref(),
            REFERRAL_COMMISSION,
            json!({
                "referrer_id": referrer_id,
                "investor_id": user_id,
                "amount": amount,
                "commission": commission,
                "level": change.after.level,
            }),
            self.notify_timeout,
        )
        .await;
        if !delivered {
            self.metrics.notification_failures_total.inc();
        }

        Ok(receipt(true, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_commission_rates;
    use crate::notify::TracingNotifier;
    use crate::store::InMemoryLedgerStore;

    fn policy() -> CommissionPolicy {
        CommissionPolicy {
            minimum_qualifying_amount: dec!(50),
            rates_by_level: default_commission_rates(),
        }
    }

    async fn setup(referrer: Option<UserAccount>) -> (Arc<InMemoryLedgerStore>, ReferralCascade) {
        let store = Arc::new(InMemoryLedgerStore::new());
        if let Some(referrer) = referrer {
            store.insert_user(&referrer).await.unwrap();
        }
        store
            .insert_user(&UserAccount::new("investor").referred_by("ref"))
            .await
            .unwrap();
        store.insert_user(&UserAccount::new("loner")).await.unwrap();

        let cascade = ReferralCascade::new(
            store.clone(),
            Arc::new(TracingNotifier),
            Arc::new(EngineMetrics::new().unwrap()),
            policy(),
            Duration::from_secs(1),
        );
        (store, cascade)
    }

    #[test]
    fn test_rate_for_level() {
        let policy = policy();
        assert_eq!(policy.rate_for_level(1), dec!(12));
        assert_eq!(policy.rate_for_level(2), dec!(5));
        assert_eq!(policy.rate_for_level(3), dec!(2));
        assert_eq!(policy.rate_for_level(4), dec!(2));
        assert_eq!(policy.rate_for_level(5), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_level_one_referrer_earns_twelve_percent() {
        let (store, cascade) = setup(Some(UserAccount::new("ref"))).await;

        let receipt = cascade.record_investment("investor", dec!(50)).await.unwrap();
        assert!(receipt.qualifying);
        assert_eq!(receipt.commission(), dec!(6));

        let referrer = store.load_user("ref").await.unwrap().unwrap();
        assert_eq!(referrer.wallet_balance, dec!(6));
        assert_eq!(referrer.active_users_count, 1);
        assert_eq!(referrer.level, 2);
    }

    #[tokio::test]
    async fn test_below_threshold_pays_nothing() {
        let (store, cascade) = setup(Some(UserAccount::new("ref"))).await;

        let receipt = cascade.record_investment("investor", dec!(49)).await.unwrap();
        assert!(!receipt.qualifying);
        assert_eq!(receipt.outcome, CascadeOutcome::BelowThreshold);

        let referrer = store.load_user("ref").await.unwrap().unwrap();
        assert_eq!(referrer.wallet_balance, Decimal::ZERO);
        assert_eq!(referrer.active_users_count, 0);
        assert_eq!(referrer.version, 0);
    }

    #[tokio::test]
    async fn test_next_event_pays_at_promoted_level() {
        let (store, cascade) = setup(Some(UserAccount::new("ref"))).await;

        cascade.record_investment("investor", dec!(100)).await.unwrap();
        let receipt = cascade.record_investment("investor", dec!(100)).await.unwrap();

        match receipt.outcome {
            CascadeOutcome::Credited {
                level_before,
                level_after,
                commission,
                ..
            } => {
                assert_eq!(level_before, 2);
                assert_eq!(level_after, 3);
                assert_eq!(commission, dec!(5));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let referrer = store.load_user("ref").await.unwrap().unwrap();
        assert_eq!(referrer.wallet_balance, dec!(17));
    }

    #[tokio::test]
    async fn test_high_level_counts_without_commission() {
        let mut referrer = UserAccount::new("ref");
        referrer.level = 5;
        let (store, cascade) = setup(Some(referrer)).await;

        let receipt = cascade.record_investment("investor", dec!(1000)).await.unwrap();
        assert_eq!(receipt.commission(), Decimal::ZERO);

        let referrer = store.load_user("ref").await.unwrap().unwrap();
        assert_eq!(referrer.active_users_count, 1);
        assert_eq!(referrer.level, 5);
    }

    #[tokio::test]
    async fn test_dangling_referrer_is_noop() {
        let (_store, cascade) = setup(None).await;

        let receipt = cascade.record_investment("investor", dec!(500)).await.unwrap();
        assert_eq!(
            receipt.outcome,
            CascadeOutcome::DanglingReferrer {
                referrer_id: "ref".into()
            }
        );
    }

    #[tokio::test]
    async fn test_no_referrer() {
        let (_store, cascade) = setup(Some(UserAccount::new("ref"))).await;
        let receipt = cascade.record_investment("loner", dec!(500)).await.unwrap();
        assert_eq!(receipt.outcome, CascadeOutcome::NoReferrer);
    }

    #[tokio::test]
    async fn test_validation_and_unknown_investor() {
        let (_store, cascade) = setup(Some(UserAccount::new("ref"))).await;

        assert!(matches!(
            cascade.record_investment("", dec!(50)).await,
            Err(StakeflowError::Validation(_))
        ));
        assert!(matches!(
            cascade.record_investment("investor", dec!(-5)).await,
            Err(StakeflowError::Validation(_))
        ));
        assert!(matches!(
            cascade.record_investment("nobody", dec!(50)).await,
            Err(StakeflowError::NotFound(_))
        ));
    }
}
