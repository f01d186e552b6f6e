//! Stakeflow calculator benchmarks
//!
//! Covers the per-stake hot path of a sweep:
//! - Rate tier lookup
//! - Capped accrual
//! - The pure lifecycle step

use chrono::{Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use stakeflow_common::Stake;
use stakeflow_engine::accrual::{accrue, elapsed_days_between, progress_percent};
use stakeflow_engine::lifecycle::{advance, CompletionRule};
use stakeflow_engine::RateTable;
use std::time::Duration;

// ============ RATE TABLE ============

fn bench_rate_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("rates");
    group.measurement_time(Duration::from_secs(5));

    let table = match RateTable::new(dec!(5), RateTable::default_tiers()) {
        Ok(table) => table,
        Err(e) => panic!("default tiers rejected: {}", e),
    };

    for amount in [dec!(5), dec!(1000), dec!(5001), dec!(250000)] {
        group.bench_with_input(BenchmarkId::new("rate_for", amount), &amount, |b, amount| {
            b.iter(|| table.rate_for(black_box(*amount)))
        });
    }

    group.finish();
}

// ============ ACCRUAL ============

fn bench_accrual(c: &mut Criterion) {
    let mut group = c.benchmark_group("accrual");
    group.measurement_time(Duration::from_secs(5));

    let start = Utc::now();
    let now = start + ChronoDuration::milliseconds(1_234_567_890);

    group.bench_function("elapsed_days", |b| {
        b.iter(|| elapsed_days_between(black_box(start), black_box(now)))
    });

    group.bench_function("accrue", |b| {
        b.iter(|| {
            accrue(
                black_box(dec!(1000)),
                black_box(dec!(1.6)),
                black_box(dec!(14.28898)),
                black_box(dec!(3000)),
            )
        })
    });

    group.bench_function("progress_percent", |b| {
        b.iter(|| progress_percent(black_box(dec!(1234.56)), black_box(dec!(3000))))
    });

    group.finish();
}

// ============ LIFECYCLE ============

fn bench_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    group.measurement_time(Duration::from_secs(5));

    let start = Utc::now();
    let rule = CompletionRule::default();

    for batch_size in [100usize, 1_000, 10_000] {
        let stakes: Vec<Stake> = (0..batch_size)
            .map(|i| {
                let principal = Decimal::from(5 + (i % 10_000) as i64);
                Stake::new("bench", principal, dec!(1.7), principal * dec!(3), start)
            })
            .collect();
        let now = start + ChronoDuration::days(30);

        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("advance_batch", batch_size), &stakes, |b, stakes| {
            b.iter_batched(
                || stakes.clone(),
                |mut batch| {
                    for stake in batch.iter_mut() {
                        let _ = advance(black_box(stake), now, &rule);
                    }
                    batch
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rate_lookup, bench_accrual, bench_advance);
criterion_main!(benches);
