//! Reward accrual
//!
//! ```text
//! raw    = principal × rate / 100 × elapsed_days
//! earned = min(raw, cap)
//! ```
//!
//! `elapsed_days` is fractional, derived from the millisecond wall-clock
//! difference, so partial days accrue and the result does not depend on
//! how often a sweep runs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use stakeflow_common::CalculationError;

/// Milliseconds in one day
pub const MILLIS_PER_DAY: i64 = 86_400_000;

const HUNDRED: Decimal = dec!(100);

/// Fractional days from `start` to `now`; zero when `now` is not after `start`
pub fn elapsed_days_between(start: DateTime<Utc>, now: DateTime<Utc>) -> Decimal {
    let millis = (now - start).num_milliseconds();
    if millis <= 0 {
        return Decimal::ZERO;
    }
    Decimal::from(millis) / Decimal::from(MILLIS_PER_DAY)
}

/// Reward cap for a principal
pub fn cap_for(principal: Decimal, multiplier: Decimal) -> Result<Decimal, CalculationError> {
    if principal <= Decimal::ZERO {
        return Err(CalculationError::InvalidPrincipal(principal.to_string()));
    }
    principal
        .checked_mul(multiplier)
        .ok_or(CalculationError::Overflow)
}

/// Total reward earned after `elapsed_days`, clamped at `cap`.
///
/// Negative elapsed time counts as zero.
pub fn accrue(
    principal: Decimal,
    daily_rate_percent: Decimal,
    elapsed_days: Decimal,
    cap: Decimal,
) -> Result<Decimal, CalculationError> {
    if principal <= Decimal::ZERO {
        return Err(CalculationError::InvalidPrincipal(principal.to_string()));
    }
    if daily_rate_percent < Decimal::ZERO {
        return Err(CalculationError::InvalidRate(daily_rate_percent.to_string()));
    }
    if cap < Decimal::ZERO {
        return Err(CalculationError::InvalidCap(cap.to_string()));
    }

    let days = elapsed_days.max(Decimal::ZERO);
    let per_day = principal
        .checked_mul(daily_rate_percent)
        .ok_or(CalculationError::Overflow)?
        / HUNDRED;

    // an overflow here means raw accrual is far past any representable cap
    let raw = per_day.checked_mul(days).unwrap_or(Decimal::MAX);
    Ok(raw.min(cap))
}

/// Progress towards the cap in percent, never above 100
pub fn progress_percent(earned: Decimal, cap: Decimal) -> Decimal {
    if cap <= Decimal::ZERO {
        return HUNDRED;
    }
    earned
        .checked_div(cap)
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
        .unwrap_or(HUNDRED)
        .min(HUNDRED)
        .max(Decimal::ZERO)
}

/// Days needed to reach `cap_multiplier × principal` at a daily rate
pub fn days_to_cap(daily_rate_percent: Decimal, cap_multiplier: Decimal) -> Option<Decimal> {
    if daily_rate_percent <= Decimal::ZERO {
        return None;
    }
    cap_multiplier
        .checked_mul(HUNDRED)
        .and_then(|n| n.checked_div(daily_rate_percent))
}
