//! Prometheus metrics for the engine

use prometheus::{Counter, Histogram, HistogramOpts, IntCounter, Registry};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Prometheus metrics for sweeps, payouts and commissions
pub struct EngineMetrics {
    pub sweeps_total: IntCounter,
    pub sweep_duration_seconds: Histogram,
    pub stakes_processed_total: IntCounter,
    pub stakes_completed_total: IntCounter,
    pub stake_failures_total: IntCounter,
    pub notification_failures_total: IntCounter,
    pub payouts_total: Counter,
    pub commissions_total: Counter,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            sweeps_total: IntCounter::new("stakeflow_sweeps_total", "Reward sweeps run")?,
            sweep_duration_seconds: Histogram::with_opts(
                HistogramOpts::new("stakeflow_sweep_duration_seconds", "Reward sweep duration")
                    .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            )?,
            stakes_processed_total: IntCounter::new(
                "stakeflow_stakes_processed_total",
                "Stakes advanced without error",
            )?,
            stakes_completed_total: IntCounter::new(
                "stakeflow_stakes_completed_total",
                "Stakes that reached completion",
            )?,
            stake_failures_total: IntCounter::new(
                "stakeflow_stake_failures_total",
                "Stakes whose transition failed during a sweep",
            )?,
            notification_failures_total: IntCounter::new(
                "stakeflow_notification_failures_total",
                "Notifications that could not be delivered",
            )?,
            payouts_total: Counter::new(
                "stakeflow_payouts_total",
                "Amount credited to owners by completed stakes",
            )?,
            commissions_total: Counter::new(
                "stakeflow_commissions_total",
                "Amount credited to referrers as commission",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.sweeps_total.clone()))?;
        registry.register(Box::new(self.sweep_duration_seconds.clone()))?;
        registry.register(Box::new(self.stakes_processed_total.clone()))?;
        registry.register(Box::new(self.stakes_completed_total.clone()))?;
        registry.register(Box::new(self.stake_failures_total.clone()))?;
        registry.register(Box::new(self.notification_failures_total.clone()))?;
        registry.register(Box::new(self.payouts_total.clone()))?;
        registry.register(Box::new(self.commissions_total.clone()))?;
        Ok(())
    }

    pub fn record_payout(&self, amount: Decimal) {
        self.payouts_total.inc_by(amount.to_f64().unwrap_or(0.0).max(0.0));
    }

    pub fn record_commission(&self, amount: Decimal) {
        self.commissions_total.inc_by(amount.to_f64().unwrap_or(0.0).max(0.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_register_and_record() {
        let metrics = EngineMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        metrics.record_payout(dec!(3000));
        metrics.record_commission(dec!(6));
        metrics.sweeps_total.inc();

        assert_eq!(metrics.payouts_total.get(), 3000.0);
        assert_eq!(metrics.commissions_total.get(), 6.0);
        assert_eq!(registry.gather().len(), 8);
    }

    #[test]
    fn test_double_registration_fails() {
        let metrics = EngineMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
