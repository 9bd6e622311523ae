// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # trialgate-wasm
//!
//! WebAssembly bindings for the browser half of TrialGate.
//!
//! The browser keeps a [`LocalMirror`] of its trial ledger so the UI can
//! react before the server answers, gates features with the same
//! [`FeatureAccessResolver`] the server uses, captures behavioral events and
//! asks the scoring engine when a login prompt would land.  Nothing here is
//! authoritative: the server's consume and status responses always win.
//!
//! ## Architecture
//!
//! Each session is a [`ClientSession`] stored in a thread-local registry
//! keyed by integer handles, because WASM is single-threaded and
//! `wasm_bindgen` cannot export opaque Rust structs across the JS boundary
//! without serialisation overhead.
//!
//! ## Exported Functions
//!
//! | Function                     | Description                                          |
//! |------------------------------|------------------------------------------------------|
//! | `create_session`             | Start a session for a fingerprint                    |
//! | `create_session_with_config` | Same, with an explicit JSON `Config`                 |
//! | `destroy_session`            | Release a session handle                             |
//! | `set_auth_state`             | Record sign-in / sign-out from the identity layer    |
//! | `display_remaining`          | Quota the UI should show                             |
//! | `optimistic_consume`         | Debit locally and build the consume request body     |
//! | `apply_consume_response`     | Fold the server's consume answer into the mirror     |
//! | `rollback`                   | Forget a request that never reached the server       |
//! | `reconcile`                  | Adopt a status snapshot from the server              |
//! | `resolve`                    | Access verdict from the last server snapshot         |
//! | `capture_event`              | Record a behavioral event                            |
//! | `predict` / `predict_js`     | Login-prompt timing prediction                       |
//! | `mirror_state`               | The mirror as JSON, for persistence in localStorage  |
//!
//! ## JavaScript Usage
//!
//! ```js
//! import init, {
//!   create_session, optimistic_consume, apply_consume_response,
//!   capture_event, predict, display_remaining,
//! } from '@trialgate/wasm';
//!
//! await init();
//!
//! const handle = create_session(fingerprint, 5);
//! capture_event(handle, 'feature_click', JSON.stringify({ feature: 'video_analysis' }), Date.now());
//!
//! const request = JSON.parse(optimistic_consume(handle, 'video_analysis', Date.now()));
//! const response = await fetch('/api/trials/consume', { method: 'POST', body: JSON.stringify(request) });
//! apply_consume_response(handle, request.requestId, await response.text());
//!
//! const timing = JSON.parse(predict(handle, Date.now(), location.pathname));
//! if (timing.should_trigger) showLoginPrompt(timing.recommended_delay_ms);
//! ```

use std::cell::RefCell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trialgate_core::{
    access::FeatureAccessResolver,
    config::Config,
    mirror::{LocalMirror, REQUEST_ID_KEY},
    scoring::BehavioralScoringEngine,
    storage::InMemoryStorage,
    types::{
        ActionKind, AuthState, BehavioralEvent, ConsumeOutcome, ConsumeStatus, DeviceClass,
        EventKind, LedgerStatus, Metadata, ScoringContext, TimingPrediction, TrialAction,
    },
};
use wasm_bindgen::prelude::*;

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

/// Client-side state for one fingerprint.
pub struct ClientSession {
    config: Config,
    mirror: LocalMirror,
    resolver: FeatureAccessResolver,
    scoring: BehavioralScoringEngine<InMemoryStorage>,
    auth: AuthState,
    device_class: DeviceClass,
    session_id: String,
    started_at_ms: Option<u64>,
}

impl ClientSession {
    fn new(fingerprint: &str, config: Config) -> Self {
        let resolver = FeatureAccessResolver::new(Default::default(), config.weights.clone());
        let scoring = BehavioralScoringEngine::new(
            config.scoring.clone(),
            config.retention.clone(),
            InMemoryStorage::new(),
        );
        Self {
            mirror: LocalMirror::new(fingerprint, config.default_trial_count),
            resolver,
            scoring,
            auth: AuthState::Anonymous,
            device_class: DeviceClass::Desktop,
            session_id: format!("{fingerprint}-session"),
            started_at_ms: None,
            config,
        }
    }

    fn session_duration_ms(&mut self, now_ms: u64) -> u64 {
        let started = *self.started_at_ms.get_or_insert(now_ms);
        now_ms.saturating_sub(started)
    }
}

// WASM is single-threaded; RefCell<HashMap<...>> is safe here.
thread_local! {
    static SESSIONS: RefCell<HashMap<u32, ClientSession>> = RefCell::new(HashMap::new());
    static NEXT_HANDLE: RefCell<u32> = const { RefCell::new(0) };
}

/// Allocate a new session handle. Handles wrap around at `u32::MAX - 1` to
/// reserve `u32::MAX` as the error sentinel.
fn next_handle() -> u32 {
    NEXT_HANDLE.with(|counter| {
        let handle = *counter.borrow();
        let next = if handle >= u32::MAX - 1 { 0 } else { handle + 1 };
        *counter.borrow_mut() = next;
        handle
    })
}

fn register(session: ClientSession) -> u32 {
    let handle = next_handle();
    SESSIONS.with(|sessions| {
        sessions.borrow_mut().insert(handle, session);
    });
    handle
}

/// Run a closure with mutable access to a session. Returns `Err(message)`
/// if the handle is unknown.
fn with_session<F, R>(handle: u32, callback: F) -> Result<R, String>
where
    F: FnOnce(&mut ClientSession) -> R,
{
    SESSIONS.with(|sessions| match sessions.borrow_mut().get_mut(&handle) {
        Some(session) => Ok(callback(session)),
        None => Err(format!("unknown session handle {handle}")),
    })
}

fn error_json(message: impl std::fmt::Display) -> String {
    serde_json::json!({ "error": message.to_string() }).to_string()
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(error_json)
}

// ---------------------------------------------------------------------------
// Server response shapes
// ---------------------------------------------------------------------------

/// Body of the consume route as served over HTTP.
#[derive(Debug, Deserialize)]
struct ConsumeResponseBody {
    success: bool,
    remaining: u32,
    total: u32,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: String,
}

impl ConsumeResponseBody {
    /// The HTTP body flags both refusals as `blocked`; only the reason tells
    /// an anti-fraud block apart from exhaustion.
    fn into_outcome(self, weight: u32) -> ConsumeOutcome {
        let status = match (self.success, self.reason.as_deref()) {
            (true, _) => ConsumeStatus::Consumed,
            (false, Some("blocked")) => ConsumeStatus::Blocked,
            (false, Some(_)) => ConsumeStatus::InsufficientTrials,
            (false, None) if self.blocked => ConsumeStatus::Blocked,
            (false, None) => ConsumeStatus::InsufficientTrials,
        };
        ConsumeOutcome {
            success: self.success,
            status,
            remaining: self.remaining,
            total: self.total,
            blocked: status == ConsumeStatus::Blocked,
            exhausted: status == ConsumeStatus::InsufficientTrials,
            weight,
            message: self.message,
        }
    }
}

/// Body of the status route as served over HTTP.
#[derive(Debug, Deserialize)]
struct StatusResponseBody {
    #[serde(default)]
    fingerprint: String,
    remaining: u32,
    total: u32,
    #[serde(rename = "isBlocked", alias = "is_blocked", default)]
    is_blocked: bool,
    #[serde(rename = "nextResetAt", alias = "next_reset_at_ms", default)]
    next_reset_at: Option<u64>,
    #[serde(rename = "recentActions", alias = "recent_actions", default)]
    recent_actions: Vec<TrialAction>,
}

/// Consume request body the page should POST.
#[derive(Debug, Serialize)]
struct ConsumeRequestBody {
    #[serde(rename = "actionKind")]
    action_kind: ActionKind,
    fingerprint: String,
    metadata: Metadata,
    #[serde(rename = "requestId")]
    request_id: String,
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Start a session for `fingerprint`, assuming `assumed_total` trials until
/// the first server snapshot arrives.
#[wasm_bindgen]
pub fn create_session(fingerprint: &str, assumed_total: u32) -> u32 {
    let config = Config {
        default_trial_count: assumed_total,
        ..Config::default()
    };
    register(ClientSession::new(fingerprint, config))
}

/// Start a session with an explicit configuration (partial JSON is fine,
/// missing fields take their defaults).
///
/// Returns the session handle, or `u32::MAX` on parse error.
#[wasm_bindgen]
pub fn create_session_with_config(fingerprint: &str, config_json: &str) -> u32 {
    match serde_json::from_str::<Config>(config_json) {
        Ok(config) => register(ClientSession::new(fingerprint, config)),
        Err(_) => u32::MAX,
    }
}

/// Release the session associated with `handle`.
#[wasm_bindgen]
pub fn destroy_session(handle: u32) {
    SESSIONS.with(|sessions| {
        sessions.borrow_mut().remove(&handle);
    });
}

/// Record the identity layer's verdict, e.g.
/// `{"status":"authenticated","plan":"pro"}` or `{"status":"anonymous"}`.
#[wasm_bindgen]
pub fn set_auth_state(handle: u32, auth_json: &str) -> bool {
    let Ok(auth) = serde_json::from_str::<AuthState>(auth_json) else {
        return false;
    };
    with_session(handle, |session| session.auth = auth).is_ok()
}

/// `mobile`, `desktop` or `tablet`.
#[wasm_bindgen]
pub fn set_device_class(handle: u32, device_class: &str) -> bool {
    let Ok(device_class) = serde_json::from_value::<DeviceClass>(Value::String(device_class.into()))
    else {
        return false;
    };
    with_session(handle, |session| session.device_class = device_class).is_ok()
}

// ---------------------------------------------------------------------------
// Local mirror
// ---------------------------------------------------------------------------

/// Quota the UI should show.  `u32::MAX` for an unknown handle.
#[wasm_bindgen]
pub fn display_remaining(handle: u32) -> u32 {
    with_session(handle, |session| session.mirror.display_remaining()).unwrap_or(u32::MAX)
}

/// Debit `action_kind` locally and return the JSON body to POST to the
/// consume route.  The body's `requestId` identifies the pending entry.
#[wasm_bindgen]
pub fn optimistic_consume(handle: u32, action_kind: &str, now_ms: f64) -> String {
    let kind: ActionKind = match action_kind.parse() {
        Ok(kind) => kind,
        Err(error) => return error_json(error),
    };
    with_session(handle, |session| {
        let weight_hint = session.config.weights.weight_of(kind).unwrap_or(1);
        let request = session.mirror.optimistic_consume(kind, weight_hint, now_ms as u64);
        let request_id = request
            .metadata
            .get(REQUEST_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        to_json(&ConsumeRequestBody {
            action_kind: kind,
            fingerprint: request.fingerprint,
            metadata: request.metadata,
            request_id,
        })
    })
    .unwrap_or_else(error_json)
}

/// Fold the consume route's JSON body into the mirror.  Returns `false` if
/// the handle or body is invalid.
#[wasm_bindgen]
pub fn apply_consume_response(handle: u32, request_id: &str, response_json: &str) -> bool {
    let Ok(body) = serde_json::from_str::<ConsumeResponseBody>(response_json) else {
        return false;
    };
    with_session(handle, |session| {
        let weight = session
            .mirror
            .pending()
            .iter()
            .find(|action| action.request_id == request_id)
            .map_or(0, |action| action.weight_hint);
        session
            .mirror
            .apply_consume_response(request_id, &body.into_outcome(weight));
    })
    .is_ok()
}

/// Drop a pending entry whose request failed in transit.
/// Returns `false` on an unknown handle.
#[wasm_bindgen]
pub fn rollback(handle: u32, request_id: &str) -> bool {
    with_session(handle, |session| session.mirror.rollback(request_id)).is_ok()
}

/// Adopt the status route's JSON body.  Returns how many pending entries it
/// confirmed, or `-1` on an invalid handle or body.
#[wasm_bindgen]
pub fn reconcile(handle: u32, status_json: &str) -> i32 {
    let Ok(body) = serde_json::from_str::<StatusResponseBody>(status_json) else {
        return -1;
    };
    with_session(handle, |session| {
        let fingerprint = if body.fingerprint.is_empty() {
            session.mirror.fingerprint().to_owned()
        } else {
            body.fingerprint
        };
        let status = LedgerStatus {
            fingerprint,
            remaining: body.remaining,
            total: body.total,
            is_blocked: body.is_blocked,
            next_reset_at_ms: body.next_reset_at,
            recent_actions: body.recent_actions,
        };
        i32::try_from(session.mirror.reconcile(status)).unwrap_or(i32::MAX)
    })
    .unwrap_or(-1)
}

/// The mirror as JSON.
#[wasm_bindgen]
pub fn mirror_state(handle: u32) -> String {
    with_session(handle, |session| to_json(&session.mirror)).unwrap_or_else(error_json)
}

// ---------------------------------------------------------------------------
// Access and timing
// ---------------------------------------------------------------------------

/// Access verdict for `feature` against the last server snapshot.
///
/// For UI gating only; the server re-resolves against its own ledger.
#[wasm_bindgen]
pub fn resolve(handle: u32, feature: &str) -> String {
    with_session(handle, |session| {
        // Pending debits are display-only.  No snapshot yet means no ledger.
        let snapshot = session.mirror.authoritative();
        to_json(&session.resolver.resolve(feature, &session.auth, snapshot))
    })
    .unwrap_or_else(error_json)
}

/// Record a behavioral event.  `kind` is the snake_case event name
/// (`page_view`, `feature_click`, ...); `data_json` an object or empty.
#[wasm_bindgen]
pub fn capture_event(handle: u32, kind: &str, data_json: &str, now_ms: f64) -> bool {
    let Ok(kind) = serde_json::from_value::<EventKind>(Value::String(kind.into())) else {
        return false;
    };
    let data: Metadata = if data_json.trim().is_empty() {
        Metadata::new()
    } else {
        match serde_json::from_str(data_json) {
            Ok(data) => data,
            Err(_) => return false,
        }
    };
    with_session(handle, |session| {
        let now_ms = now_ms as u64;
        session.session_duration_ms(now_ms);
        let mut event = BehavioralEvent::new(session.mirror.fingerprint(), &session.session_id, kind, now_ms);
        event.data = data;
        event.device_class = session.device_class;
        session.scoring.ingest(event).is_ok()
    })
    .unwrap_or(false)
}

fn predict_inner(handle: u32, now_ms: f64, current_page: Option<String>) -> Result<TimingPrediction, String> {
    with_session(handle, |session| {
        let now_ms = now_ms as u64;
        let context = ScoringContext {
            fingerprint: session.mirror.fingerprint().to_owned(),
            session_duration_ms: session.session_duration_ms(now_ms),
            trial_remaining: session.mirror.display_remaining(),
            device_class: session.device_class,
            current_page,
            now_ms,
        };
        session.scoring.predict(&context)
    })
}

/// Login-prompt timing prediction as JSON.
#[wasm_bindgen]
pub fn predict(handle: u32, now_ms: f64, current_page: Option<String>) -> String {
    match predict_inner(handle, now_ms, current_page) {
        Ok(prediction) => to_json(&prediction),
        Err(message) => error_json(message),
    }
}

/// Login-prompt timing prediction as a JS object.
#[wasm_bindgen]
pub fn predict_js(handle: u32, now_ms: f64, current_page: Option<String>) -> Result<JsValue, JsValue> {
    let prediction = predict_inner(handle, now_ms, current_page).map_err(|message| JsValue::from_str(&message))?;
    serde_wasm_bindgen::to_value(&prediction).map_err(JsValue::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, target_arch = "wasm32"))]
mod wasm_tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    fn predict_js_returns_an_object() {
        let handle = create_session("f1", 5);
        let value = predict_js(handle, 1_000.0, None).unwrap();
        assert!(value.is_object());
        destroy_session(handle);
    }
}
