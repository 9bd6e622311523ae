// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # TrialGate walkthrough
//!
//! Drives one anonymous visitor through their trial quota, shows the login
//! prompt plan on exhaustion, feeds prompt outcomes back to the optimizer and
//! prints the audit chain.  Run with:
//!
//! ```bash
//! RUST_LOG=trialgate=info,trialgate_core=debug cargo run --example walkthrough
//! ```

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use trialgate_core::{
    async_engine::AsyncTrialGate,
    audit::AuditFilter,
    config::Config,
    engine::{GateRequest, TrialGateEngine},
    events::RecordingSink,
    mirror::LocalMirror,
    storage::InMemoryStorage,
    types::{
        ActionKind, BehavioralEvent, DeviceClass, EventKind, Experiment, PromptCandidate, PromptConfig,
        PromptStyle, RewardMetric, TriggerType, VisitorContext,
    },
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("TrialGate walkthrough\n");

    // -----------------------------------------------------------------------
    // 1. Engine with one prompt experiment
    // -----------------------------------------------------------------------
    let engine = TrialGateEngine::new(Config::default(), InMemoryStorage::new());
    let experiment = Experiment::with_defaults("login-prompt", RewardMetric::ConversionRate, engine.optimizer.config());
    engine.optimizer.register_experiment(experiment)?;
    for (id, color) in [("calm", "blue"), ("bold", "orange")] {
        let config = PromptConfig {
            copy: format!("login_prompt_{id}"),
            style: PromptStyle {
                color: color.into(),
                size: "medium".into(),
            },
            timing_hint: TriggerType::Immediate,
        };
        engine.optimizer.add_candidate(PromptCandidate::new(id, "login-prompt", config))?;
    }
    let engine = engine.with_prompt_experiment("login-prompt");

    let sink = Arc::new(RecordingSink::default());
    engine.events().subscribe(sink.clone());

    let gate = AsyncTrialGate::spawn(engine);
    let visitor = VisitorContext {
        device_class: DeviceClass::Desktop,
        user_type: None,
        hour_of_day: 15,
    };

    // -----------------------------------------------------------------------
    // 2. Spend the quota
    // -----------------------------------------------------------------------
    let started = gate.engine().now_ms();
    for (offset, feature) in ["video_analysis", "channel_analysis", "keyword_research", "trend_report"]
        .iter()
        .enumerate()
    {
        gate.ingest(
            BehavioralEvent::new("device-42", "session-1", EventKind::FeatureClick, started + offset as u64)
                .with("target", *feature),
        );
        let mut request = GateRequest::anonymous("device-42", feature, visitor.clone());
        request.session_duration_ms = 4 * 60_000;
        let decision = gate.check(request).await?;
        println!(
            "  {feature:<18} allowed={:<5} reason={:<16} remaining={:?}",
            decision.access.allowed,
            decision.access.reason.as_str(),
            decision.access.remaining
        );
        if let Some(plan) = decision.prompt {
            println!(
                "    prompt: trigger={} urgency={:?} ({})",
                plan.prediction.should_trigger, plan.prediction.urgency, plan.prediction.message
            );
            if let Some(selection) = plan.selection {
                println!("    arm: {} via {:?}", selection.candidate.id, selection.strategy);
                let engine = gate.engine();
                engine.prompt_shown("device-42", &selection.candidate.id, "impression-1")?;
                engine.prompt_converted("device-42", &selection.candidate.id, "conversion-1")?;
            }
        }
    }
    println!();

    // -----------------------------------------------------------------------
    // 3. Client mirror catches up with the server
    // -----------------------------------------------------------------------
    let mut mirror = LocalMirror::new("device-42", 5);
    let _request = mirror.optimistic_consume(ActionKind::VideoAnalysis, 1, started);
    println!("Mirror before sync: {} remaining (optimistic)", mirror.display_remaining());
    let status = gate.sync_mirror(&mut mirror).await?;
    println!(
        "Mirror after sync:  {} remaining (server says {} of {})\n",
        mirror.display_remaining(),
        status.remaining,
        status.total
    );

    // -----------------------------------------------------------------------
    // 4. Fold feedback in and inspect the audit chain
    // -----------------------------------------------------------------------
    let report = gate.engine().run_batch_update()?;
    println!("Batch update applied {} feedback event(s)", report.applied);

    let records = gate.engine().query_audit(&AuditFilter {
        fingerprint: Some("device-42".into()),
        ..AuditFilter::default()
    });
    println!("Audit records for device-42: {}", records.len());
    for record in &records {
        println!("  #{:<3} {:<18} {}", record.sequence, record.event.kind(), &record.hash[..16]);
    }
    println!("Chain valid: {}", gate.engine().audit().verify());
    println!("Events seen by subscriber: {:?}", sink.kinds());

    Ok(())
}
