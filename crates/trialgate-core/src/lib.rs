// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # trialgate-core
//!
//! Core engine for TrialGate: a per-device trial quota ledger, a feature
//! access resolver, a behavioral engine that predicts when a login prompt
//! will land, and a bandit that learns which prompt to show.
//!
//! ## Architecture
//!
//! ```text
//! TrialGateEngine<S: LedgerStore + BehaviorStore + ArmStore>
//!   ├── TrialManager<S>             — initialize / consume / status / reset / block
//!   ├── FeatureAccessResolver       — auth state + ledger + permission table → verdict
//!   ├── BehavioralScoringEngine<S>  — event window → factors → timing prediction
//!   ├── PromptOptimizer<S>          — UCB1 / ε-greedy arm selection, batch feedback
//!   └── EventBus ──▶ AuditTrail     — typed domain events, hash-chained log
//!
//! LocalMirror                       — client-side optimistic view, reconciled
//!                                     against LedgerStatus snapshots
//! AsyncTrialGate<S>  (feature async) — deadlines, fire-and-forget ingestion,
//!                                     periodic optimizer updates
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use trialgate_core::{
//!     config::Config,
//!     engine::{GateRequest, TrialGateEngine},
//!     storage::InMemoryStorage,
//!     types::{AccessReason, DeviceClass, VisitorContext},
//! };
//!
//! let engine = TrialGateEngine::new(Config::default(), InMemoryStorage::new());
//! let visitor = VisitorContext { device_class: DeviceClass::Desktop, user_type: None, hour_of_day: 11 };
//!
//! // channel_analysis costs 2 of the 5 default trials.
//! let decision = engine.check(GateRequest::anonymous("device-1", "channel_analysis", visitor.clone())).unwrap();
//! assert_eq!(decision.access.reason, AccessReason::Trial);
//! assert_eq!(decision.access.remaining, Some(3));
//!
//! // Saving needs an account regardless of quota.
//! let decision = engine.check(GateRequest::anonymous("device-1", "save_report", visitor)).unwrap();
//! assert_eq!(decision.access.reason, AccessReason::LoginRequired);
//! ```

pub mod access;
#[cfg(feature = "async")]
pub mod async_engine;
pub mod audit;
pub mod clock;
pub mod config;
#[cfg(feature = "config-loader")]
pub mod config_loader;
pub mod engine;
pub mod error;
pub mod events;
pub mod factors;
pub mod mirror;
pub mod optimizer;
pub mod rate_limit;
pub mod retry;
pub mod scoring;
pub mod storage;
pub mod trial;
pub mod types;

// Re-export the most commonly used items at the crate root so consumers can
// write `use trialgate_core::TrialGateEngine;` instead of the fully
// qualified path.
pub use access::{FeatureAccessResolver, FeaturePermissionTable, QuotaView};
#[cfg(feature = "async")]
pub use async_engine::AsyncTrialGate;
pub use audit::{AuditFilter, AuditRecord, AuditTrail};
pub use config::Config;
pub use engine::{GateDecision, GateRequest, PromptPlan, TrialGateEngine};
pub use error::{OptimizerError, ScoringError, StoreError, TrialError};
pub use events::{DomainEvent, EventBus, EventSink};
pub use mirror::LocalMirror;
pub use optimizer::PromptOptimizer;
pub use scoring::BehavioralScoringEngine;
pub use storage::{ArmStore, BehaviorStore, InMemoryStorage, LedgerStore};
pub use trial::{ConsumeRequest, TrialManager};
pub use types::{
    Access, AccessReason, ActionKind, AuthState, ConsumeOutcome, ConsumeStatus, LedgerStatus,
    TimingPrediction, TrialLedger,
};
