// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Criterion benchmark suite for the TrialGate hot paths.
//!
//! - Trial consumption (fresh ledger and exhausted ledger)
//! - Feature access resolution
//! - Timing prediction over a populated event window
//! - Bandit arm selection
//! - Audit append + hash chain computation
//!
//! Run with: `cargo bench --bench trialgate_benchmark`

use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use trialgate_core::{
    access::FeatureAccessResolver,
    audit::AuditTrail,
    config::{Config, OptimizerConfig, RetentionPolicy, ScoringConfig},
    events::DomainEvent,
    optimizer::PromptOptimizer,
    scoring::BehavioralScoringEngine,
    storage::InMemoryStorage,
    trial::{ConsumeRequest, TrialManager},
    types::{
        AuthState, BehavioralEvent, DeviceClass, EventKind, Experiment, PromptCandidate, PromptConfig,
        PromptStyle, RewardMetric, ScoringContext, TrialLedger, TriggerType, VisitorContext,
    },
};

fn unlimited_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.max_requests = u32::MAX;
    config
}

// ---------------------------------------------------------------------------
// Consumption
// ---------------------------------------------------------------------------

fn consume_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("consume");
    let manager = TrialManager::new(unlimited_config(), InMemoryStorage::new());

    let counter = AtomicU64::new(0);
    group.bench_function("fresh_ledger", |bencher| {
        bencher.iter(|| {
            let fingerprint = format!("device-{}", counter.fetch_add(1, Ordering::Relaxed));
            let outcome = manager.consume(ConsumeRequest::new(&fingerprint, "video_analysis"));
            black_box(outcome)
        });
    });

    for _ in 0..5 {
        let _ = manager.consume(ConsumeRequest::new("exhausted", "video_analysis"));
    }
    group.bench_function("exhausted_ledger", |bencher| {
        bencher.iter(|| black_box(manager.consume(ConsumeRequest::new(black_box("exhausted"), "video_analysis"))));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn resolve_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("resolve");
    let resolver = FeatureAccessResolver::default();
    let ledger = TrialLedger::new("device", 5, 0, None);

    for feature in ["video_analysis", "save_report", "api_access", "unknown_feature"] {
        group.bench_with_input(BenchmarkId::new("anonymous", feature), feature, |bencher, feature| {
            bencher.iter(|| black_box(resolver.resolve(black_box(feature), &AuthState::Anonymous, Some(&ledger))));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

fn predict_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("predict");
    let engine = BehavioralScoringEngine::new(
        ScoringConfig::default(),
        RetentionPolicy::default(),
        InMemoryStorage::new(),
    );

    let kinds = [
        EventKind::PageView,
        EventKind::FeatureClick,
        EventKind::Click,
        EventKind::Scroll,
        EventKind::Search,
        EventKind::SaveAttempt,
    ];
    for window in [10usize, 100, 1_000] {
        let fingerprint = format!("device-{window}");
        for index in 0..window {
            let kind = kinds[index % kinds.len()];
            let event = BehavioralEvent::new(&fingerprint, "session", kind, 1_000_000 + index as u64 * 100)
                .with("page", format!("page-{}", index % 7))
                .with("depth", 0.5);
            let _ = engine.ingest(event);
        }
        let context = ScoringContext {
            fingerprint,
            session_duration_ms: 300_000,
            trial_remaining: 3,
            device_class: DeviceClass::Desktop,
            current_page: None,
            now_ms: 1_000_000 + window as u64 * 100,
        };
        group.bench_with_input(BenchmarkId::new("window", window), &context, |bencher, context| {
            bencher.iter(|| black_box(engine.predict(black_box(context))));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

fn select_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("select");
    let optimizer = PromptOptimizer::with_seed(OptimizerConfig::default(), InMemoryStorage::new(), 1);
    let experiment = Experiment::with_defaults("login", RewardMetric::ConversionRate, optimizer.config());
    let _ = optimizer.register_experiment(experiment);

    for (index, color) in ["blue", "green", "orange", "purple"].iter().enumerate() {
        let id = format!("arm-{index}");
        let config = PromptConfig {
            copy: "unlock_more".into(),
            style: PromptStyle {
                color: (*color).into(),
                size: "medium".into(),
            },
            timing_hint: TriggerType::Delayed,
        };
        let _ = optimizer.add_candidate(PromptCandidate::new(&id, "login", config));
        let _ = optimizer.update_performance(&id, 500, 60, 10 + index as u64 * 5);
    }

    let visitor = VisitorContext {
        device_class: DeviceClass::Mobile,
        user_type: None,
        hour_of_day: 20,
    };
    group.bench_function("ucb1_four_arms", |bencher| {
        bencher.iter(|| black_box(optimizer.select(black_box("login"), black_box(&visitor))));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

fn audit_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("audit");

    group.bench_function("append_1000", |bencher| {
        bencher.iter(|| {
            let trail = AuditTrail::new();
            for index in 0..1_000u64 {
                trail.append(
                    DomainEvent::LedgerUnblocked {
                        fingerprint: format!("device-{}", index % 10),
                    },
                    index,
                );
            }
            black_box(trail.chain_tip())
        });
    });

    let trail = AuditTrail::new();
    for index in 0..1_000u64 {
        trail.append(DomainEvent::IngestionRecovered, index);
    }
    group.bench_function("verify_1000", |bencher| {
        bencher.iter(|| black_box(trail.verify()));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Criterion harness
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    consume_benchmark,
    resolve_benchmark,
    predict_benchmark,
    select_benchmark,
    audit_benchmark,
);

criterion_main!(benches);
