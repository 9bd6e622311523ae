// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Tamper-evident audit trail of domain events.
//!
//! [`AuditTrail`] is an [`EventSink`]: subscribe it to the engine's
//! [`EventBus`](crate::events::EventBus) and every consumption, denial,
//! block, reset and prompt event is appended to a hash chain.  It exposes
//! three operations:
//!
//! * [`query`](AuditTrail::query)   — filter recorded events
//! * [`verify`](AuditTrail::verify) — recompute the chain
//! * [`chain_tip`](AuditTrail::chain_tip)
//!
//! The trail is recording only.  Trial actions on the ledger remain the
//! authoritative consumption log; this chain covers everything else too.
//!
//! Memory is bounded: past `capacity` records the oldest are pruned.  The
//! retained suffix still verifies, anchored on the hash of the last pruned
//! record.  Export regularly if the full history matters.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::events::{DomainEvent, EventRecord, EventSink};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One link of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub event: DomainEvent,
    pub hash: String,
    pub prev_hash: String,
}

/// Query filter.  `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub fingerprint: Option<String>,
    /// Event kind as returned by [`DomainEvent::kind`].
    pub kind: Option<String>,
    /// Inclusive lower bound.
    pub since_ms: Option<u64>,
    /// Exclusive upper bound.
    pub until_ms: Option<u64>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        let fingerprint_ok = self
            .fingerprint
            .as_deref()
            .map_or(true, |wanted| record.event.fingerprint() == Some(wanted));
        let kind_ok = self
            .kind
            .as_deref()
            .map_or(true, |wanted| record.event.kind() == wanted);
        let since_ok = self.since_ms.map_or(true, |since| record.timestamp_ms >= since);
        let until_ok = self.until_ms.map_or(true, |until| record.timestamp_ms < until);
        fingerprint_ok && kind_ok && since_ok && until_ok
    }
}

/// Default number of records kept by [`AuditTrail::new`].
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct Chain {
    records: VecDeque<AuditRecord>,
    capacity: usize,
    next_sequence: u64,
    /// `prev_hash` of the oldest retained record.
    anchor_hash: String,
    last_hash: String,
}

/// Hash-chained event log.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use trialgate_core::audit::{AuditFilter, AuditTrail};
/// use trialgate_core::events::{DomainEvent, EventBus};
///
/// let bus = EventBus::new();
/// let trail = Arc::new(AuditTrail::new());
/// bus.subscribe(trail.clone());
///
/// bus.publish(DomainEvent::LedgerBlocked { fingerprint: "f1".into(), reason: "burst".into() }, 10);
/// bus.publish(DomainEvent::LedgerUnblocked { fingerprint: "f2".into() }, 20);
///
/// let filter = AuditFilter { fingerprint: Some("f1".into()), ..AuditFilter::default() };
/// assert_eq!(trail.query(&filter).len(), 1);
/// assert!(trail.verify());
/// ```
#[derive(Debug)]
pub struct AuditTrail {
    chain: Mutex<Chain>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    /// Create an empty trail holding at most [`DEFAULT_AUDIT_CAPACITY`]
    /// records.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chain: Mutex::new(Chain {
                records: VecDeque::new(),
                capacity: capacity.max(1),
                next_sequence: 0,
                anchor_hash: GENESIS_HASH.to_owned(),
                last_hash: GENESIS_HASH.to_owned(),
            }),
        }
    }

    /// Append `event`.  Both grants and denials are recorded.
    pub fn append(&self, event: DomainEvent, timestamp_ms: u64) {
        let mut chain = self.chain.lock();
        let sequence = chain.next_sequence;
        chain.next_sequence += 1;
        let prev_hash = chain.last_hash.clone();
        let hash = compute_hash(sequence, timestamp_ms, &event, &prev_hash);
        chain.last_hash = hash.clone();
        chain.records.push_back(AuditRecord {
            sequence,
            timestamp_ms,
            event,
            hash,
            prev_hash,
        });
        while chain.records.len() > chain.capacity {
            if let Some(pruned) = chain.records.pop_front() {
                chain.anchor_hash = pruned.hash;
            }
        }
    }

    /// Matching records, oldest first, truncated to `filter.limit`.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        let chain = self.chain.lock();
        let matching = chain.records.iter().filter(|record| filter.matches(record));
        match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    /// Recompute every retained link.  `false` means a record was altered.
    pub fn verify(&self) -> bool {
        let chain = self.chain.lock();
        let first = chain.records.front().map_or(0, |record| record.sequence);
        verify_links(&chain.records, first, &chain.anchor_hash)
    }

    /// Hash of the newest record (genesis hash when empty).
    pub fn chain_tip(&self) -> String {
        self.chain.lock().last_hash.clone()
    }

    pub fn len(&self) -> usize {
        self.chain.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records pruned so far to stay within capacity.
    pub fn pruned(&self) -> u64 {
        let chain = self.chain.lock();
        chain.next_sequence - chain.records.len() as u64
    }

    /// Copy of the retained chain, for export.
    pub fn export(&self) -> Vec<AuditRecord> {
        self.chain.lock().records.iter().cloned().collect()
    }
}

impl EventSink for AuditTrail {
    fn emit(&self, record: &EventRecord) {
        self.append(record.event.clone(), record.timestamp_ms);
    }
}

/// Check an exported chain that starts at genesis.
pub fn verify_records(records: &[AuditRecord]) -> bool {
    verify_links(records, 0, GENESIS_HASH)
}

/// Check an exported chain whose first record follows `anchor_hash`, e.g.
/// the export of a trail that has pruned its head.
pub fn verify_segment(records: &[AuditRecord], anchor_hash: &str) -> bool {
    let first = records.first().map_or(0, |record| record.sequence);
    verify_links(records, first, anchor_hash)
}

fn verify_links<'a>(
    records: impl IntoIterator<Item = &'a AuditRecord>,
    first_sequence: u64,
    anchor_hash: &str,
) -> bool {
    let mut prev_hash = anchor_hash.to_owned();
    for (offset, record) in records.into_iter().enumerate() {
        if record.sequence != first_sequence + offset as u64 || record.prev_hash != prev_hash {
            return false;
        }
        let expected = compute_hash(record.sequence, record.timestamp_ms, &record.event, &prev_hash);
        if record.hash != expected {
            return false;
        }
        prev_hash = expected;
    }
    true
}

// ---------------------------------------------------------------------------
// Hash chain implementation
// ---------------------------------------------------------------------------

/// FNV-1a over the canonical JSON of the event plus the previous hash,
/// widened to 64 hex chars.  Stable across processes and toolchains, so
/// exported chains verify anywhere.  Structural linking only; sign exports
/// externally if cryptographic strength is required.
fn compute_hash(sequence: u64, timestamp_ms: u64, event: &DomainEvent, prev_hash: &str) -> String {
    let body = serde_json::to_string(event).unwrap_or_else(|_| event.kind().to_owned());
    let payload = format!("{prev_hash}:{sequence}:{timestamp_ms}:{body}");

    let mut out = String::with_capacity(64);
    // Four lanes with different seeds give a full-width digest.
    for lane in 0..4u64 {
        out.push_str(&format!("{:016x}", fnv1a_64(payload.as_bytes(), lane)));
    }
    out
}

fn fnv1a_64(bytes: &[u8], lane: u64) -> u64 {
    const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
    const FNV_PRIME: u64 = 1_099_511_628_211;
    let mut hash = FNV_OFFSET ^ lane.wrapping_mul(FNV_PRIME);
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
