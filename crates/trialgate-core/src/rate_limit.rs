// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Anti-fraud burst limiter for trial consumption.
//!
//! A sliding-window counter keyed by `(fingerprint, source ip)`.  It runs
//! before any weight logic; a rejection never touches the ledger.
//!
//! Memory is bounded two ways: a cleanup pass every `cleanup_interval`
//! checks drops idle keys, and `max_tracked_keys` caps the map outright.
//! When the cap is reached a new key is rejected after a forced cleanup.
//!
//! Timestamps are Unix milliseconds supplied by the caller's
//! [`Clock`](crate::clock::Clock), so the limiter runs wherever the clock
//! does (including Workers, where `std::time::Instant` is unavailable).

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::RateLimitConfig;
use crate::error::TrialError;

type Key = (String, Option<IpAddr>);

/// Sliding-window limiter.  Thread-safe; share it by reference.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<HashMap<Key, Vec<u64>>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    /// Record a consumption attempt at `now_ms`, or reject it with the time
    /// until the oldest request in the window expires.
    pub fn check(
        &self,
        fingerprint: &str,
        source_ip: Option<IpAddr>,
        now_ms: u64,
    ) -> Result<(), TrialError> {
        let window = self.config.window_ms;
        let cutoff = now_ms.saturating_sub(window);

        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval.max(1) == 0 {
            tracing::debug!(checks = count, "running periodic rate limiter cleanup");
            self.cleanup(now_ms);
        }

        let key: Key = (fingerprint.to_owned(), source_ip);
        let mut state = self.state.write();

        if !state.contains_key(&key) && state.len() >= self.config.max_tracked_keys {
            state.retain(|_, stamps| {
                stamps.retain(|stamp| *stamp > cutoff);
                !stamps.is_empty()
            });
            if state.len() >= self.config.max_tracked_keys {
                tracing::warn!(
                    fingerprint,
                    tracked = state.len(),
                    "rejecting new key: tracked key limit reached"
                );
                return Err(TrialError::RateLimited {
                    retry_after_ms: self.config.window_ms,
                });
            }
        }

        let stamps = state.entry(key).or_default();
        stamps.retain(|stamp| *stamp > cutoff);

        if stamps.len() >= self.config.max_requests as usize {
            let retry_after = stamps
                .first()
                .map(|oldest| window.saturating_sub(now_ms.saturating_sub(*oldest)))
                .unwrap_or(window);
            tracing::warn!(
                fingerprint,
                ip = ?source_ip,
                requests = stamps.len(),
                max = self.config.max_requests,
                "consumption rate limit exceeded"
            );
            return Err(TrialError::RateLimited {
                retry_after_ms: retry_after.max(1),
            });
        }

        stamps.push(now_ms);
        Ok(())
    }

    /// Remove keys with no requests inside the window ending at `now_ms`.
    pub fn cleanup(&self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.config.window_ms);
        let mut state = self.state.write();
        state.retain(|_, stamps| {
            stamps.retain(|stamp| *stamp > cutoff);
            !stamps.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.state.read().len()
    }
}
