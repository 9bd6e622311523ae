// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # trialgate-cf
//!
//! HTTP surface of the trial ledger, usable natively and from Cloudflare
//! Workers.
//!
//! [`TrialApi`] turns consume / status / reset calls into status codes and
//! JSON bodies.  It has no I/O of its own, so the whole contract is testable
//! without the Workers runtime.  With the `cf-worker` feature,
//! [`handle_request`] routes a `worker::Request` through it and keeps ledgers
//! in a KV namespace.
//!
//! ## Routes
//!
//! ```text
//! POST /api/trials/consume  {actionKind, fingerprint, metadata}
//!     200 {success, remaining, total, blocked, message}
//!     400 missing required parameter / invalid action type
//!     403 {success:false, blocked:true, reason:"exhausted"|"blocked"}
//!     429 Retry-After: <seconds>
//!     503 store unavailable
//!
//! GET  /api/trials/status?fingerprint=...
//!     200 {remaining, total, isBlocked, nextResetAt, recentActions}
//!     400 missing fingerprint
//!
//! POST /api/trials/reset    {fingerprint, preserveActions}
//!     200 status body, 403 outside development
//! ```
//!
//! ## KV caveat
//!
//! Workers KV is eventually consistent.  The handler hydrates the isolate's
//! ledger from KV before each call and writes it back afterwards; the
//! compare-and-swap guarantee holds within one isolate, and across isolates
//! the higher ledger version wins.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trialgate_core::{
    clock::Clock,
    config::{Config, Environment, RateLimitConfig},
    error::{StoreError, TrialError},
    storage::{InMemoryStorage, LedgerStore},
    trial::{ConsumeRequest, TrialManager},
    types::{ConsumeOutcome, ConsumeStatus, LedgerStatus, Metadata, TrialLedger},
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the trial API.
///
/// # Example (wrangler.toml context)
///
/// ```toml
/// [vars]
/// TRIALGATE_LEDGER_KV_BINDING = "TRIAL_KV"
/// TRIALGATE_ENVIRONMENT = "production"
/// TRIALGATE_DEFAULT_TRIAL_COUNT = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfConfig {
    /// Name of the KV namespace binding holding ledgers, one JSON value per
    /// `ledger:<fingerprint>` key.
    #[serde(default = "default_kv_binding")]
    pub ledger_kv_binding: String,

    /// Gates the reset route.  Defaults to production.
    #[serde(default)]
    pub environment: Environment,

    #[serde(default = "default_trial_count")]
    pub default_trial_count: u32,

    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,

    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
}

fn default_kv_binding() -> String {
    "TRIAL_KV".to_string()
}

fn default_trial_count() -> u32 {
    trialgate_core::config::DEFAULT_TRIAL_COUNT
}

fn default_rate_limit_max_requests() -> u32 {
    RateLimitConfig::default().max_requests
}

fn default_rate_limit_window_ms() -> u64 {
    RateLimitConfig::default().window_ms
}

impl Default for CfConfig {
    fn default() -> Self {
        Self {
            ledger_kv_binding: default_kv_binding(),
            environment: Environment::default(),
            default_trial_count: default_trial_count(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
        }
    }
}

impl CfConfig {
    /// Core configuration derived from these settings.
    pub fn to_engine_config(&self) -> Config {
        Config {
            environment: self.environment,
            default_trial_count: self.default_trial_count,
            rate_limit: RateLimitConfig {
                max_requests: self.rate_limit_max_requests,
                window_ms: self.rate_limit_window_ms,
                ..RateLimitConfig::default()
            },
            ..Config::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall clock of the Workers runtime.  `std::time::SystemTime` is
/// unavailable on `wasm32-unknown-unknown`, so ledger windows and the rate
/// limiter read `Date.now()` instead.
#[cfg(feature = "cf-worker")]
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerClock;

#[cfg(feature = "cf-worker")]
impl Clock for WorkerClock {
    fn now_ms(&self) -> u64 {
        worker::Date::now().as_millis()
    }
}

/// Clock used by [`TrialApi::with_store`]: `Date.now()` inside a Worker,
/// the system clock everywhere else.
pub fn default_clock() -> Arc<dyn Clock> {
    #[cfg(all(feature = "cf-worker", target_arch = "wasm32"))]
    {
        Arc::new(WorkerClock)
    }
    #[cfg(not(all(feature = "cf-worker", target_arch = "wasm32")))]
    {
        Arc::new(trialgate_core::clock::SystemClock)
    }
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

/// JSON body of the consume route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumeBody {
    #[serde(default, rename = "actionKind", alias = "action_kind")]
    pub action_kind: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// JSON body of the reset route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetBody {
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default, rename = "preserveActions", alias = "preserve_actions")]
    pub preserve_actions: bool,
}

/// A transport-agnostic HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Value of the `Retry-After` header, in whole seconds.
    pub retry_after_secs: Option<u64>,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            retry_after_secs: None,
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "success": false, "error": message.into() }),
            retry_after_secs: None,
        }
    }

    fn from_error(error: &TrialError) -> Self {
        let mut response = Self::error(error.status_code(), error.to_string());
        if let TrialError::RateLimited { retry_after_ms } = error {
            response.retry_after_secs = Some(retry_after_ms.div_ceil(1000).max(1));
        }
        response
    }
}

fn consume_body(outcome: &ConsumeOutcome) -> (u16, Value) {
    let reason = match outcome.status {
        ConsumeStatus::Consumed => None,
        ConsumeStatus::InsufficientTrials => Some("exhausted"),
        ConsumeStatus::Blocked => Some("blocked"),
    };
    let status = if outcome.success { 200 } else { 403 };
    let mut body = json!({
        "success": outcome.success,
        "remaining": outcome.remaining,
        "total": outcome.total,
        "blocked": !outcome.success,
        "message": outcome.message,
    });
    if let Some(reason) = reason {
        body["reason"] = json!(reason);
    }
    (status, body)
}

fn status_body(status: &LedgerStatus) -> Value {
    json!({
        "fingerprint": status.fingerprint,
        "remaining": status.remaining,
        "total": status.total,
        "isBlocked": status.is_blocked,
        "nextResetAt": status.next_reset_at_ms,
        "recentActions": status.recent_actions,
    })
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// The trial ledger behind an HTTP contract.
///
/// # Usage (without the `cf-worker` feature, for testing)
///
/// ```rust
/// use trialgate_cf::{CfConfig, TrialApi};
///
/// let api = TrialApi::new(CfConfig::default());
///
/// let response = api.consume_json(r#"{"actionKind":"video_analysis","fingerprint":"f1"}"#, None);
/// assert_eq!(response.status, 200);
/// assert_eq!(response.body["remaining"], 4);
///
/// let response = api.consume_json(r#"{"actionKind":"video_analysis"}"#, None);
/// assert_eq!(response.status, 400);
/// ```
pub struct TrialApi<S: LedgerStore = InMemoryStorage> {
    config: CfConfig,
    manager: TrialManager<S>,
}

impl TrialApi<InMemoryStorage> {
    /// An API over a fresh in-memory store.
    pub fn new(config: CfConfig) -> Self {
        Self::with_store(config, InMemoryStorage::new())
    }
}

impl<S: LedgerStore> TrialApi<S> {
    pub fn with_store(config: CfConfig, store: S) -> Self {
        let manager = TrialManager::new(config.to_engine_config(), store).with_clock(default_clock());
        Self { config, manager }
    }

    /// Replace the time source for renewal windows and rate limiting.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: self.config,
            manager: self.manager.with_clock(clock),
        }
    }

    pub fn config(&self) -> &CfConfig {
        &self.config
    }

    pub fn manager(&self) -> &TrialManager<S> {
        &self.manager
    }

    /// Parse a consume body.  Malformed JSON is a 400.
    pub fn parse_consume(body: &str) -> Result<ConsumeBody, ApiResponse> {
        serde_json::from_str(body).map_err(|error| {
            tracing::debug!(%error, "malformed consume body");
            ApiResponse::error(400, format!("invalid request body: {error}"))
        })
    }

    /// `POST /api/trials/consume` with a raw JSON body.
    pub fn consume_json(&self, body: &str, source_ip: Option<IpAddr>) -> ApiResponse {
        match Self::parse_consume(body) {
            Ok(body) => self.consume(body, source_ip),
            Err(response) => response,
        }
    }

    /// `POST /api/trials/consume`.
    pub fn consume(&self, body: ConsumeBody, source_ip: Option<IpAddr>) -> ApiResponse {
        let request = ConsumeRequest {
            fingerprint: body.fingerprint,
            action_kind: body.action_kind,
            metadata: body.metadata,
            source_ip,
        };
        match self.manager.consume(request) {
            Ok(outcome) => {
                let (status, body) = consume_body(&outcome);
                ApiResponse {
                    status,
                    body,
                    retry_after_secs: None,
                }
            }
            Err(error) => {
                if error.status_code() >= 500 {
                    tracing::error!(%error, "consume failed");
                }
                ApiResponse::from_error(&error)
            }
        }
    }

    /// `GET /api/trials/status?fingerprint=...`.
    pub fn status(&self, fingerprint: Option<&str>) -> ApiResponse {
        let Some(fingerprint) = fingerprint.filter(|value| !value.trim().is_empty()) else {
            return ApiResponse::from_error(&TrialError::MissingParameter("fingerprint"));
        };
        match self.manager.status(fingerprint) {
            Ok(status) => ApiResponse::ok(status_body(&status)),
            Err(error) => ApiResponse::from_error(&error),
        }
    }

    /// `POST /api/trials/reset`.  Refused with 403 outside development.
    pub fn reset(&self, body: ResetBody) -> ApiResponse {
        match self.manager.reset(&body.fingerprint, body.preserve_actions) {
            Ok(ledger) => ApiResponse::ok(status_body(&LedgerStatus::from(&ledger))),
            Err(error) => ApiResponse::from_error(&error),
        }
    }

    /// Install `ledger` if it is newer than the local copy.  Returns whether
    /// the local store changed.
    pub fn hydrate(&self, ledger: &TrialLedger) -> Result<bool, StoreError> {
        let store = self.manager.store();
        let local_version = store.get_ledger(&ledger.fingerprint)?.map(|local| local.version);
        if local_version.is_some_and(|version| version >= ledger.version) {
            return Ok(false);
        }
        store.put_ledger(ledger, local_version)?;
        Ok(true)
    }

    /// Current local copy of a ledger, for write-back.
    pub fn snapshot(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError> {
        self.manager.store().get_ledger(fingerprint)
    }
}

// ---------------------------------------------------------------------------
// Cloudflare Workers integration (behind feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "cf-worker")]
fn ledger_key(fingerprint: &str) -> String {
    format!("ledger:{fingerprint}")
}

#[cfg(feature = "cf-worker")]
fn rust_error(error: impl std::fmt::Display) -> worker::Error {
    worker::Error::RustError(error.to_string())
}

#[cfg(feature = "cf-worker")]
async fn hydrate_from_kv(
    kv: &worker::kv::KvStore,
    api: &TrialApi,
    fingerprint: &str,
) -> worker::Result<()> {
    if fingerprint.trim().is_empty() {
        return Ok(());
    }
    if let Some(raw) = kv.get(&ledger_key(fingerprint)).text().await.map_err(rust_error)? {
        let ledger: TrialLedger = serde_json::from_str(&raw).map_err(rust_error)?;
        api.hydrate(&ledger).map_err(rust_error)?;
    }
    Ok(())
}

#[cfg(feature = "cf-worker")]
async fn persist_to_kv(
    kv: &worker::kv::KvStore,
    api: &TrialApi,
    fingerprint: &str,
) -> worker::Result<()> {
    if let Some(ledger) = api.snapshot(fingerprint).map_err(rust_error)? {
        let raw = serde_json::to_string(&ledger).map_err(rust_error)?;
        kv.put(&ledger_key(fingerprint), raw)
            .map_err(rust_error)?
            .execute()
            .await
            .map_err(rust_error)?;
    }
    Ok(())
}

#[cfg(feature = "cf-worker")]
fn into_worker_response(response: ApiResponse) -> worker::Result<worker::Response> {
    let mut out = worker::Response::from_json(&response.body)?.with_status(response.status);
    if let Some(seconds) = response.retry_after_secs {
        out.headers_mut().set("Retry-After", &seconds.to_string())?;
    }
    Ok(out)
}

/// Route a Workers request through `api`, with ledgers kept in the KV
/// namespace named by [`CfConfig::ledger_kv_binding`].
///
/// `api` should live for the isolate's lifetime (e.g. in a `thread_local!`)
/// so the rate limiter sees consecutive requests.
///
/// # Errors
///
/// Returns a `worker::Error` if KV access fails or the response cannot be
/// constructed.  Contract failures (400/403/429) are responses, not errors.
#[cfg(feature = "cf-worker")]
pub async fn handle_request(
    mut req: worker::Request,
    env: worker::Env,
    api: &TrialApi,
) -> worker::Result<worker::Response> {
    let kv = env.kv(&api.config().ledger_kv_binding)?;
    let source_ip = req
        .headers()
        .get("CF-Connecting-IP")?
        .and_then(|value| value.parse::<IpAddr>().ok());
    let path = req.path();

    let response = match (req.method(), path.as_str()) {
        (worker::Method::Post, "/api/trials/consume") => {
            let raw = req.text().await?;
            match TrialApi::<InMemoryStorage>::parse_consume(&raw) {
                Ok(body) => {
                    let fingerprint = body.fingerprint.clone();
                    hydrate_from_kv(&kv, api, &fingerprint).await?;
                    let response = api.consume(body, source_ip);
                    if response.status == 200 {
                        persist_to_kv(&kv, api, &fingerprint).await?;
                    }
                    response
                }
                Err(response) => response,
            }
        }
        (worker::Method::Get, "/api/trials/status") => {
            let url = req.url()?;
            let fingerprint = url
                .query_pairs()
                .find(|(key, _)| key == "fingerprint")
                .map(|(_, value)| value.into_owned());
            if let Some(fingerprint) = &fingerprint {
                hydrate_from_kv(&kv, api, fingerprint).await?;
            }
            let response = api.status(fingerprint.as_deref());
            if let Some(fingerprint) = &fingerprint {
                persist_to_kv(&kv, api, fingerprint).await?;
            }
            response
        }
        (worker::Method::Post, "/api/trials/reset") => {
            let raw = req.text().await?;
            match serde_json::from_str::<ResetBody>(&raw) {
                Ok(body) => {
                    let fingerprint = body.fingerprint.clone();
                    hydrate_from_kv(&kv, api, &fingerprint).await?;
                    let response = api.reset(body);
                    if response.status == 200 {
                        persist_to_kv(&kv, api, &fingerprint).await?;
                    }
                    response
                }
                Err(error) => ApiResponse::error(400, format!("invalid request body: {error}")),
            }
        }
        _ => ApiResponse::error(404, format!("no route for {path}")),
    };

    into_worker_response(response)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use trialgate_core::clock::ManualClock;

    fn consume(api: &TrialApi, action: &str) -> ApiResponse {
        api.consume_json(
            &format!(r#"{{"actionKind":"{action}","fingerprint":"f1"}}"#),
            None,
        )
    }

    #[test]
    fn test_default_config() {
        let config = CfConfig::default();
        assert_eq!(config.ledger_kv_binding, "TRIAL_KV");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.default_trial_count, 5);
    }

    #[test]
    fn test_config_deserialises_from_json() {
        let json = r#"{
            "ledger_kv_binding": "MY_KV",
            "environment": "development",
            "default_trial_count": 3
        }"#;
        let config: CfConfig = serde_json::from_str(json).expect("should parse");
        assert_eq!(config.ledger_kv_binding, "MY_KV");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.to_engine_config().default_trial_count, 3);
        assert_eq!(config.rate_limit_max_requests, RateLimitConfig::default().max_requests);
    }

    #[test]
    fn test_consume_success() {
        let api = TrialApi::new(CfConfig::default());
        let response = consume(&api, "channel_analysis");
        assert_eq!(response.status, 200);
        assert_eq!(response.body["success"], true);
        assert_eq!(response.body["remaining"], 3);
        assert_eq!(response.body["blocked"], false);
    }

    #[test]
    fn test_missing_and_invalid_parameters_are_400() {
        let api = TrialApi::new(CfConfig::default());

        let response = api.consume_json(r#"{"fingerprint":"f1"}"#, None);
        assert_eq!(response.status, 400);
        assert!(response.body["error"].as_str().unwrap().contains("missing required parameter"));

        let response = consume(&api, "teleport");
        assert_eq!(response.status, 400);
        assert!(response.body["error"].as_str().unwrap().contains("invalid action type"));

        let response = api.consume_json("{ nope", None);
        assert_eq!(response.status, 400);
    }

    #[test]
    fn test_exhausted_is_403_and_distinct_from_blocked() {
        let api = TrialApi::new(CfConfig::default());
        assert_eq!(consume(&api, "bulk_analysis").status, 200);
        let exhausted = consume(&api, "bulk_analysis");
        assert_eq!(exhausted.status, 403);
        assert_eq!(exhausted.body["blocked"], true);
        assert_eq!(exhausted.body["reason"], "exhausted");
        assert_eq!(exhausted.body["remaining"], 2);

        api.manager().block("f1", "velocity").unwrap();
        let blocked = consume(&api, "video_analysis");
        assert_eq!(blocked.status, 403);
        assert_eq!(blocked.body["reason"], "blocked");
        assert_ne!(blocked.body["message"], exhausted.body["message"]);
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let api = TrialApi::new(CfConfig {
            rate_limit_max_requests: 2,
            ..CfConfig::default()
        });
        assert_eq!(consume(&api, "video_analysis").status, 200);
        assert_eq!(consume(&api, "video_analysis").status, 200);
        let limited = consume(&api, "video_analysis");
        assert_eq!(limited.status, 429);
        assert!(limited.retry_after_secs.unwrap() >= 1);
    }

    #[test]
    fn test_rate_limit_window_uses_injected_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let api = TrialApi::new(CfConfig {
            rate_limit_max_requests: 1,
            rate_limit_window_ms: 10_000,
            ..CfConfig::default()
        })
        .with_clock(clock.clone());

        assert_eq!(consume(&api, "video_analysis").status, 200);
        let limited = consume(&api, "video_analysis");
        assert_eq!(limited.status, 429);
        assert_eq!(limited.retry_after_secs, Some(10));

        clock.advance(7_500);
        assert_eq!(consume(&api, "video_analysis").retry_after_secs, Some(3));

        clock.advance(2_501);
        let response = consume(&api, "video_analysis");
        assert_eq!(response.status, 200);
        assert_eq!(response.body["remaining"], 3);
    }

    #[test]
    fn test_default_clock_reads_wall_time_natively() {
        assert!(default_clock().now_ms() > 1_600_000_000_000);
    }

    #[test]
    fn test_status_shape() {
        let api = TrialApi::new(CfConfig::default());
        assert_eq!(api.status(None).status, 400);
        assert_eq!(api.status(Some("  ")).status, 400);

        consume(&api, "video_analysis");
        let response = api.status(Some("f1"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body["remaining"], 4);
        assert_eq!(response.body["isBlocked"], false);
        assert_eq!(response.body["recentActions"].as_array().unwrap().len(), 1);
        assert!(response.body.get("nextResetAt").is_some());
    }

    #[test]
    fn test_reset_is_development_only() {
        let api = TrialApi::new(CfConfig::default());
        consume(&api, "video_analysis");
        let body = ResetBody {
            fingerprint: "f1".into(),
            preserve_actions: false,
        };
        assert_eq!(api.reset(body.clone()).status, 403);

        let api = TrialApi::new(CfConfig {
            environment: Environment::Development,
            ..CfConfig::default()
        });
        consume(&api, "video_analysis");
        let response = api.reset(body);
        assert_eq!(response.status, 200);
        assert_eq!(response.body["remaining"], 5);
        assert_eq!(response.body["recentActions"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_hydrate_only_accepts_newer_ledgers() {
        let api = TrialApi::new(CfConfig::default());
        let mut remote = TrialLedger::new("f1", 5, 0, None);
        remote.remaining = 2;
        remote.version = 3;
        assert!(api.hydrate(&remote).unwrap());
        assert_eq!(api.status(Some("f1")).body["remaining"], 2);

        let mut stale = remote.clone();
        stale.remaining = 5;
        stale.version = 1;
        assert!(!api.hydrate(&stale).unwrap());
        assert_eq!(api.snapshot("f1").unwrap().unwrap().remaining, 2);
    }
}
