// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # trialgate-std
//!
//! `std`-only storage backends for `trialgate-core`.
//!
//! This crate provides [`FileStorage`], a JSON file-backed implementation of
//! the ledger, behavior and arm stores, suitable for single-process servers
//! and local tooling that do not need a full database.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trialgate_core::{config::Config, TrialGateEngine};
//! use trialgate_std::FileStorage;
//!
//! let storage = FileStorage::open("/var/lib/trialgate/state.json")
//!     .expect("failed to open storage file");
//!
//! let engine = TrialGateEngine::new(Config::default(), Arc::new(storage));
//! ```

pub mod storage;

pub use storage::file::FileStorage;
