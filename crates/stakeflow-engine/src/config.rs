//! Engine configuration

use crate::accrual::cap_for;
use crate::lifecycle::{CompletionRule, PayoutPolicy};
use crate::rates::{RateTable, RateTier};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use stakeflow_common::{CalculationError, Result, StakeflowError};
use std::collections::BTreeMap;

/// Default minimum stake principal
pub const DEFAULT_MINIMUM_STAKE: Decimal = dec!(5);

/// Default reward cap as a multiple of principal
pub const DEFAULT_CAP_MULTIPLIER: Decimal = dec!(3);

/// Default minimum investment that pays a referral commission
pub const DEFAULT_MINIMUM_QUALIFYING_AMOUNT: Decimal = dec!(50);

/// Default number of stakes processed concurrently within a sweep
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 16;

/// Recognized engine options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Smallest principal accepted for a stake
    pub minimum_stake_amount: Decimal,
    /// Ordered daily rate tiers
    pub rate_tiers: Vec<RateTier>,
    /// Reward cap = principal × multiplier
    pub cap_multiplier: Decimal,
    /// Optional duration after which a stake completes regardless of cap
    pub max_duration_days: Option<Decimal>,
    /// What a completed stake pays out
    pub payout_policy: PayoutPolicy,
    /// Investments below this amount never pay commission
    pub minimum_qualifying_amount: Decimal,
    /// Referral commission percent keyed by referrer level
    pub commission_rates_by_level: BTreeMap<u32, Decimal>,
    /// Stakes processed in parallel during a sweep
    pub sweep_concurrency: usize,
    /// Upper bound on a single notification attempt
    pub notify_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            minimum_stake_amount: DEFAULT_MINIMUM_STAKE,
            rate_tiers: RateTable::default_tiers(),
            cap_multiplier: DEFAULT_CAP_MULTIPLIER,
            max_duration_days: None,
            payout_policy: PayoutPolicy::RewardOnly,
            minimum_qualifying_amount: DEFAULT_MINIMUM_QUALIFYING_AMOUNT,
            commission_rates_by_level: default_commission_rates(),
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
            notify_timeout_ms: 2000,
        }
    }
}

/// Level 1 → 12%, level 2 → 5%, levels 3 and 4 → 2%
pub fn default_commission_rates() -> BTreeMap<u32, Decimal> {
    BTreeMap::from([(1, dec!(12)), (2, dec!(5)), (3, dec!(2)), (4, dec!(2))])
}

impl EngineConfig {
    /// Build the rate table described by this configuration
    pub fn rate_table(&self) -> Result<RateTable> {
        Ok(RateTable::new(self.minimum_stake_amount, self.rate_tiers.clone())?)
    }

    pub fn completion_rule(&self) -> CompletionRule {
        CompletionRule {
            max_duration_days: self.max_duration_days,
        }
    }

    /// Reject configurations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        self.rate_table()?;

        if self.cap_multiplier <= Decimal::ZERO {
            return Err(StakeflowError::Config(format!(
                "cap_multiplier must be positive, got {}",
                self.cap_multiplier
            )));
        }
        // the cap must be representable for the smallest stake
        cap_for(self.minimum_stake_amount, self.cap_multiplier)?;

        if let Some(days) = self.max_duration_days {
            if days <= Decimal::ZERO {
                return Err(StakeflowError::Config(format!(
                    "max_duration_days must be positive, got {}",
                    days
                )));
            }
        }

        if self.minimum_qualifying_amount < Decimal::ZERO {
            return Err(StakeflowError::Config(
                "minimum_qualifying_amount cannot be negative".into(),
            ));
        }

        for (level, rate) in &self.commission_rates_by_level {
            if *level == 0 {
                return Err(StakeflowError::Config("commission level 0 is not a valid level".into()));
            }
            if *rate < Decimal::ZERO || *rate > dec!(100) {
                return Err(CalculationError::InvalidRate(rate.to_string()).into());
            }
        }

        if self.sweep_concurrency == 0 {
            return Err(StakeflowError::Config("sweep_concurrency must be at least 1".into()));
        }

        Ok(())
    }
}
