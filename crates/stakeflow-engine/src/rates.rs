//! Daily rate tiers
//!
//! | amount range | daily rate |
//! |--------------|------------|
//! | [5, 500]     | 1.5%       |
//! | (500, 1000]  | 1.6%       |
//! | (1000, 2000] | 1.7%       |
//! | (2000, 3000] | 1.8%       |
//! | (3000, 5000] | 1.9%       |
//! | (5000, ∞)    | 2.0%       |
//!
//! The rate is resolved once when a stake is opened and frozen on the
//! record; changing the table never touches existing stakes.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use stakeflow_common::{CalculationError, ValidationError};

/// One tier: amounts up to and including `up_to` earn `daily_rate_percent`.
/// The last tier is open-ended (`up_to = None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTier {
    pub up_to: Option<Decimal>,
    pub daily_rate_percent: Decimal,
}

impl RateTier {
    pub fn new(up_to: Option<Decimal>, daily_rate_percent: Decimal) -> Self {
        Self {
            up_to,
            daily_rate_percent,
        }
    }
}

/// Validated, ordered rate table
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    minimum: Decimal,
    tiers: Vec<RateTier>,
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            minimum: dec!(5),
            tiers: Self::default_tiers(),
        }
    }
}

impl RateTable {
    /// Build a table, checking that tiers are ordered, non-overlapping,
    /// increasing in rate and closed by exactly one open-ended tier.
    pub fn new(minimum: Decimal, tiers: Vec<RateTier>) -> Result<Self, CalculationError> {
        if minimum <= Decimal::ZERO {
            return Err(CalculationError::InvalidRateTable(format!(
                "minimum must be positive, got {}",
                minimum
            )));
        }
        if tiers.is_empty() {
            return Err(CalculationError::InvalidRateTable("no tiers".into()));
        }

        let mut lower = minimum;
        let mut previous_rate: Option<Decimal> = None;
        let last = tiers.len() - 1;

        for (i, tier) in tiers.iter().enumerate() {
            if tier.daily_rate_percent < Decimal::ZERO {
                return Err(CalculationError::InvalidRate(
                    tier.daily_rate_percent.to_string(),
                ));
            }
            if let Some(prev) = previous_rate {
                if tier.daily_rate_percent <= prev {
                    return Err(CalculationError::InvalidRateTable(format!(
                        "tier {} rate {} does not increase on {}",
                        i, tier.daily_rate_percent, prev
                    )));
                }
            }
            previous_rate = Some(tier.daily_rate_percent);

            match (tier.up_to, i == last) {
                (Some(up_to), false) => {
                    if up_to < lower || (i > 0 && up_to == lower) {
                        return Err(CalculationError::InvalidRateTable(format!(
                            "tier {} upper bound {} is below {}",
                            i, up_to, lower
                        )));
                    }
                    lower = up_to;
                }
                (None, true) => {}
                (Some(_), true) => {
                    return Err(CalculationError::InvalidRateTable(
                        "last tier must be open-ended".into(),
                    ))
                }
                (None, false) => {
                    return Err(CalculationError::InvalidRateTable(format!(
                        "tier {} is open-ended but not last",
                        i
                    )))
                }
            }
        }

        Ok(Self { minimum, tiers })
    }

    pub fn default_tiers() -> Vec<RateTier> {
        vec![
            RateTier::new(Some(dec!(500)), dec!(1.5)),
            RateTier::new(Some(dec!(1000)), dec!(1.6)),
            RateTier::new(Some(dec!(2000)), dec!(1.7)),
            RateTier::new(Some(dec!(3000)), dec!(1.8)),
            RateTier::new(Some(dec!(5000)), dec!(1.9)),
            RateTier::new(None, dec!(2.0)),
        ]
    }

    /// Smallest stakeable amount
    pub fn minimum(&self) -> Decimal {
        self.minimum
    }

    pub fn tiers(&self) -> &[RateTier] {
        &self.tiers
    }

    /// Daily rate percent for a principal
    pub fn rate_for(&self, amount: Decimal) -> Result<Decimal, ValidationError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount.to_string()));
        }
        if amount < self.minimum {
            return Err(ValidationError::BelowMinimum {
                amount: amount.to_string(),
                minimum: self.minimum.to_string(),
            });
        }

        let tier = self
            .tiers
            .iter()
            .find(|tier| tier.up_to.map_or(true, |up_to| amount <= up_to))
            .unwrap_or_else(|| &self.tiers[self.tiers.len() - 1]);
        Ok(tier.daily_rate_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        let table = RateTable::default();
        let cases = [
            (dec!(5), dec!(1.5)),
            (dec!(500), dec!(1.5)),
            (dec!(501), dec!(1.6)),
            (dec!(1000), dec!(1.6)),
            (dec!(1001), dec!(1.7)),
            (dec!(2000), dec!(1.7)),
            (dec!(2001), dec!(1.8)),
            (dec!(3000), dec!(1.8)),
            (dec!(3001), dec!(1.9)),
            (dec!(5000), dec!(1.9)),
            (dec!(5001), dec!(2.0)),
            (dec!(1000000), dec!(2.0)),
        ];
        for (amount, expected) in cases {
            assert_eq!(table.rate_for(amount).unwrap(), expected, "amount {}", amount);
        }
    }

    #[test]
    fn test_fractional_amount_just_above_boundary() {
        let table = RateTable::default();
        assert_eq!(table.rate_for(dec!(500.01)).unwrap(), dec!(1.6));
    }

    #[test]
    fn test_below_minimum_rejected() {
        let table = RateTable::default();
        assert!(matches!(
            table.rate_for(dec!(4)),
            Err(ValidationError::BelowMinimum { .. })
        ));
        assert!(matches!(
            table.rate_for(dec!(4.99)),
            Err(ValidationError::BelowMinimum { .. })
        ));
        assert!(matches!(
            table.rate_for(Decimal::ZERO),
            Err(ValidationError::NonPositiveAmount(_))
        ));
    }

    #[test]
    fn test_rejects_unordered_tiers() {
        let tiers = vec![
            RateTier::new(Some(dec!(1000)), dec!(1.5)),
            RateTier::new(Some(dec!(500)), dec!(1.6)),
            RateTier::new(None, dec!(2.0)),
        ];
        assert!(RateTable::new(dec!(5), tiers).is_err());
    }

    #[test]
    fn test_rejects_non_increasing_rates() {
        let tiers = vec![
            RateTier::new(Some(dec!(500)), dec!(1.6)),
            RateTier::new(None, dec!(1.6)),
        ];
        assert!(RateTable::new(dec!(5), tiers).is_err());
    }

    #[test]
    fn test_rejects_closed_last_tier() {
        let tiers = vec![RateTier::new(Some(dec!(500)), dec!(1.5))];
        assert!(RateTable::new(dec!(5), tiers).is_err());
    }
}
