//! Interception Coordinator
//!
//! Owns the suspended-exchange map, holds browser-side requests and responses
//! until an operator decision arrives, and dispatches forward/drop/edit.
//! Every suspended entry is the sole owner of a oneshot resume token; the
//! browser driver awaits the matching receiver.

use crate::exchange::{
    now_millis, ExchangeEdit, Headers, PreparedRequest, PreparedResponse,
};
use crate::exclusion::{is_excluded, ExclusionRule};
use crate::rewrite::{split_request_line, split_status_line, RewriteRule, RewriteScope, RuleSet};
use crate::sequence::ExchangeIds;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which side of the exchange is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptPhase {
    Request,
    Response,
}

/// Operator decision delivered through a resume token.
#[derive(Debug)]
pub enum Decision {
    /// Release the exchange, optionally merging an edit.
    Forward(Option<ExchangeEdit>),
    /// Abort the exchange.
    Drop,
}

/// A request event as reported to the operator channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCapture {
    pub id: String,
    pub seq: u64,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "resourceType", default)]
    pub resource_type: String,
    pub timestamp: i64,
    pub pending: bool,
}

/// A response event as reported to the operator channel. `req_id` correlates
/// the event with the originating request capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCapture {
    pub req_id: String,
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub pending: bool,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events published by the coordinator to the operator channel and the
/// capture history. Per exchange, the request capture precedes the request
/// prompt (`pending: true`), which precedes the response capture, which
/// precedes the response prompt.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Request(RequestCapture),
    Response(ResponseCapture),
    /// Dropped by an operator decision or a browser stop.
    Dropped { id: String },
    /// The browser aborted upstream while the exchange was suspended.
    Aborted { id: String },
    /// Degraded mode released suspended exchanges without an operator.
    Degraded { forwarded: usize },
}

impl EngineEvent {
    /// Prompts are the events that must never be shed by a slow consumer.
    pub fn is_prompt(&self) -> bool {
        match self {
            EngineEvent::Request(c) => c.pending,
            EngineEvent::Response(c) => c.pending,
            _ => false,
        }
    }

    /// The exchange id a prompt refers to, if this event is a prompt.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            EngineEvent::Request(c) if c.pending => Some(&c.id),
            EngineEvent::Response(c) if c.pending => Some(&c.req_id),
            _ => None,
        }
    }
}

/// Pre-flight request event handed in by the browser driver.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub resource_type: String,
}

/// Response event handed in by the browser driver.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Option<String>,
}

/// Outcome of the request-phase pipeline.
#[derive(Debug)]
pub enum RequestVerdict {
    /// The exchange is excluded: release untouched, no capture record.
    Excluded,
    /// Release upstream immediately.
    Release(PreparedRequest),
    /// Hold until the receiver yields an operator decision.
    Suspend(PreparedRequest, oneshot::Receiver<Decision>),
}

/// Outcome of the response-phase pipeline.
#[derive(Debug)]
pub enum ResponseVerdict {
    Release(PreparedResponse),
    Suspend(PreparedResponse, oneshot::Receiver<Decision>),
}

struct SuspendedEntry {
    tx: oneshot::Sender<Decision>,
    phase: InterceptPhase,
    suspended_at: Instant,
}

struct LiveExchange {
    intercept_response: bool,
    created_at: Instant,
}

/// Policy knobs for degraded mode and the janitor sweep.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a disconnected operator may reconnect before every suspended
    /// exchange is auto-forwarded. Any positive value is acceptable.
    pub grace_period: Duration,
    /// Janitor upper bound: suspended entries older than this are released.
    pub max_suspension_age: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let grace_period = Duration::from_secs(5);
        Self {
            grace_period,
            max_suspension_age: grace_period * 4,
        }
    }
}

// Live-exchange bookkeeping for exchanges whose response never arrives is
// reaped on this bound.
const FLAG_MAX_AGE: Duration = Duration::from_secs(300);

/// The interception coordinator. One instance per process; shared between
/// the browser driver, the operator channel router, and the janitor task.
pub struct Coordinator {
    ids: ExchangeIds,
    suspended: DashMap<String, SuspendedEntry>,
    live: DashMap<String, LiveExchange>,
    intercept_requests: AtomicBool,
    operator_attached: AtomicBool,
    detach_epoch: AtomicU64,
    rules: RwLock<Arc<RuleSet>>,
    exclusions: RwLock<Arc<Vec<ExclusionRule>>>,
    events: broadcast::Sender<EngineEvent>,
    // Serialises seq allocation with event emission so captures are observed
    // in seq order.
    emit_order: Mutex<()>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            ids: ExchangeIds::new(),
            suspended: DashMap::new(),
            live: DashMap::new(),
            intercept_requests: AtomicBool::new(false),
            operator_attached: AtomicBool::new(false),
            detach_epoch: AtomicU64::new(0),
            rules: RwLock::new(Arc::new(RuleSet::default())),
            exclusions: RwLock::new(Arc::new(Vec::new())),
            events,
            emit_order: Mutex::new(()),
            config,
        }
    }

    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn set_intercept_requests(&self, enabled: bool) {
        self.intercept_requests.store(enabled, Ordering::SeqCst);
        info!("Request interception: {}", if enabled { "ON" } else { "OFF" });
    }

    pub fn intercept_requests(&self) -> bool {
        self.intercept_requests.load(Ordering::SeqCst)
    }

    /// Swap in a new rewrite rule list. Traffic in progress keeps the
    /// snapshot it already took.
    pub fn set_rules(&self, rules: Vec<RewriteRule>) {
        *self.rules.write().unwrap() = Arc::new(RuleSet::new(rules));
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().unwrap().clone()
    }

    /// Swap in a new exclusion rule list.
    pub fn set_exclusions(&self, rules: Vec<ExclusionRule>) {
        *self.exclusions.write().unwrap() = Arc::new(rules);
    }

    pub fn exclusions(&self) -> Arc<Vec<ExclusionRule>> {
        self.exclusions.read().unwrap().clone()
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    /// Run the request-phase pipeline on a pre-flight browser event:
    /// assign id+seq, consult the exclusion filter, apply request-phase
    /// rewrites, emit capture (and prompt when suspending).
    pub fn on_request(&self, raw: RawRequest) -> RequestVerdict {
        let id = self.ids.new_id();

        if is_excluded(&raw.url, &self.exclusions()) {
            debug!("Excluded exchange, releasing untouched: {}", raw.url);
            return RequestVerdict::Excluded;
        }

        let rules = self.rules();
        let line = format!("{} {} HTTP/1.1", raw.method, raw.url);
        let line = rules.apply_first_line(RewriteScope::RequestFirstLine, &line);
        let (method, url) =
            split_request_line(&line).unwrap_or((raw.method.clone(), raw.url.clone()));
        let headers = rules.apply_headers(RewriteScope::RequestHeader, &raw.headers);
        let body = raw
            .body
            .map(|b| rules.apply_body(RewriteScope::RequestBody, &b));

        self.live.insert(
            id.clone(),
            LiveExchange {
                intercept_response: false,
                created_at: Instant::now(),
            },
        );

        // Captures while the operator channel is absent skip the suspension
        // step regardless of the armed flag.
        let suspend = self.intercept_requests() && self.is_operator_attached();

        let _order = self.emit_order.lock().unwrap();
        let prepared = PreparedRequest {
            id: id.clone(),
            seq: self.ids.next_seq(),
            method,
            url,
            headers,
            body,
            resource_type: raw.resource_type,
            timestamp: now_millis(),
        };
        self.emit(EngineEvent::Request(request_capture(&prepared, false)));
        if suspend {
            let rx = self.suspend(&id, InterceptPhase::Request);
            self.emit(EngineEvent::Request(request_capture(&prepared, true)));
            RequestVerdict::Suspend(prepared, rx)
        } else {
            RequestVerdict::Release(prepared)
        }
    }

    /// Run the response-phase pipeline. `exchange_id` is the id assigned by
    /// [`on_request`](Self::on_request); the emitted event carries it as
    /// `req_id` so the history correlates without URL matching.
    pub fn on_response(&self, exchange_id: &str, raw: RawResponse) -> ResponseVerdict {
        let rules = self.rules();
        let line = format!("HTTP/1.1 {}", raw.status);
        let line = rules.apply_first_line(RewriteScope::ResponseFirstLine, &line);
        let status = split_status_line(&line).unwrap_or(raw.status);
        let headers = rules.apply_headers(RewriteScope::ResponseHeader, &raw.headers);
        let body = raw
            .body
            .map(|b| rules.apply_body(RewriteScope::ResponseBody, &b));

        let intercept = self
            .live
            .remove(exchange_id)
            .map(|(_, live)| live.intercept_response)
            .unwrap_or(false);
        let suspend = intercept && self.is_operator_attached();

        let _order = self.emit_order.lock().unwrap();
        let prepared = PreparedResponse {
            req_id: exchange_id.to_string(),
            url: raw.url,
            status,
            headers,
            body,
            timestamp: now_millis(),
        };
        self.emit(EngineEvent::Response(response_capture(&prepared, false, None)));
        if suspend {
            let rx = self.suspend(exchange_id, InterceptPhase::Response);
            self.emit(EngineEvent::Response(response_capture(&prepared, true, None)));
            ResponseVerdict::Suspend(prepared, rx)
        } else {
            ResponseVerdict::Release(prepared)
        }
    }

    /// Surface a transient upstream failure as a synthetic response event.
    pub fn on_request_failed(&self, exchange_id: &str, url: &str, error: impl Into<String>) {
        self.live.remove(exchange_id);
        let _order = self.emit_order.lock().unwrap();
        self.emit(EngineEvent::Response(ResponseCapture {
            req_id: exchange_id.to_string(),
            url: url.to_string(),
            status: 0,
            headers: Headers::new(),
            body: None,
            pending: false,
            timestamp: now_millis(),
            error: Some(error.into()),
        }));
    }

    /// Operator decision: release a suspended exchange, optionally edited.
    /// Records the per-exchange intercept-response flag when supplied.
    /// Unknown ids are idempotent no-ops.
    pub fn forward(
        &self,
        id: &str,
        edit: Option<ExchangeEdit>,
        intercept_response: Option<bool>,
    ) -> bool {
        if let Some(flag) = intercept_response {
            self.set_intercept_response(id, flag);
        }
        self.resume(id, Decision::Forward(edit))
    }

    /// Operator decision: abort a suspended exchange. Unknown ids are
    /// idempotent no-ops.
    pub fn drop_exchange(&self, id: &str) -> bool {
        self.live.remove(id);
        if self.resume(id, Decision::Drop) {
            self.emit(EngineEvent::Dropped { id: id.to_string() });
            true
        } else {
            false
        }
    }

    /// Mark an in-flight exchange so its response side also suspends.
    pub fn set_intercept_response(&self, id: &str, enabled: bool) -> bool {
        match self.live.get_mut(id) {
            Some(mut live) => {
                live.intercept_response = enabled;
                true
            }
            None => false,
        }
    }

    /// Abort every suspended exchange (operator `stop` command).
    pub fn drop_all(&self) -> usize {
        let ids: Vec<String> = self.suspended.iter().map(|e| e.key().clone()).collect();
        let mut dropped = 0;
        for id in ids {
            if self.drop_exchange(&id) {
                dropped += 1;
            }
        }
        self.live.clear();
        if dropped > 0 {
            info!("Dropped {} suspended exchanges", dropped);
        }
        dropped
    }

    /// Release every suspended exchange unedited (degraded mode, prompt
    /// shedding, janitor expiry).
    pub fn auto_forward_all(&self) -> usize {
        let ids: Vec<String> = self.suspended.iter().map(|e| e.key().clone()).collect();
        let mut forwarded = 0;
        for id in ids {
            if self.resume(&id, Decision::Forward(None)) {
                forwarded += 1;
            }
        }
        forwarded
    }

    /// A prompt could not be delivered to any operator connection: release
    /// the exchange unedited and raise the degraded notification.
    pub fn prompt_undeliverable(&self, id: &str) {
        warn!("Prompt for exchange {} undeliverable, auto-forwarding", id);
        if self.resume(id, Decision::Forward(None)) {
            self.emit(EngineEvent::Degraded { forwarded: 1 });
        }
    }

    pub fn is_operator_attached(&self) -> bool {
        self.operator_attached.load(Ordering::SeqCst)
    }

    /// An operator connection is available again.
    pub fn operator_attached(&self) {
        self.operator_attached.store(true, Ordering::SeqCst);
        // Invalidate any grace timer from an earlier detach.
        self.detach_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// The last operator connection went away. After the grace period every
    /// suspended exchange is auto-forwarded unedited and the armed flag is
    /// cleared, unless an operator reconnects first.
    pub fn operator_detached(self: &Arc<Self>) {
        self.operator_attached.store(false, Ordering::SeqCst);
        let epoch = self.detach_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.config.grace_period).await;
            if coordinator.is_operator_attached()
                || coordinator.detach_epoch.load(Ordering::SeqCst) != epoch
            {
                return;
            }
            let forwarded = coordinator.auto_forward_all();
            coordinator.set_intercept_requests(false);
            if forwarded > 0 {
                warn!(
                    "Operator channel lost, auto-forwarded {} suspended exchanges",
                    forwarded
                );
            }
            coordinator.emit(EngineEvent::Degraded { forwarded });
        });
    }

    /// Periodic sweep that releases suspension entries older than the upper
    /// bound and reaps stale live-exchange bookkeeping.
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(coordinator.config.grace_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                coordinator.sweep();
            }
        })
    }

    fn sweep(&self) {
        let max_age = self.config.max_suspension_age;
        let overaged: Vec<String> = self
            .suspended
            .iter()
            .filter(|e| e.value().suspended_at.elapsed() > max_age)
            .map(|e| e.key().clone())
            .collect();
        for id in overaged {
            warn!("Janitor releasing overaged suspended exchange {}", id);
            self.resume(&id, Decision::Forward(None));
        }
        self.live
            .retain(|_, live| live.created_at.elapsed() < FLAG_MAX_AGE);
    }

    /// Park an exchange and hand back the receiver half of its resume token.
    fn suspend(&self, id: &str, phase: InterceptPhase) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        let displaced = self.suspended.insert(
            id.to_string(),
            SuspendedEntry {
                tx,
                phase,
                suspended_at: Instant::now(),
            },
        );
        // An id suspends at most once per phase; a displaced entry means the
        // map went inconsistent. Fatal in debug builds, in release the old
        // entry is discarded and the exchange continues alone.
        debug_assert!(displaced.is_none(), "exchange {} suspended twice", id);
        rx
    }

    /// Deliver a decision to a suspended exchange. Returns false when the id
    /// is unknown. When the driver side has vanished (browser aborted
    /// upstream while suspended) the entry is discarded, the exchange is
    /// marked aborted and a notification is emitted.
    fn resume(&self, id: &str, decision: Decision) -> bool {
        let Some((_, entry)) = self.suspended.remove(id) else {
            return false;
        };
        debug!("Resuming {:?}-phase exchange {}", entry.phase, id);
        if entry.tx.send(decision).is_err() {
            self.live.remove(id);
            self.emit(EngineEvent::Aborted { id: id.to_string() });
            return false;
        }
        true
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; events are best-effort until the router
        // attaches.
        let _ = self.events.send(event);
    }
}

fn request_capture(prepared: &PreparedRequest, pending: bool) -> RequestCapture {
    RequestCapture {
        id: prepared.id.clone(),
        seq: prepared.seq,
        method: prepared.method.clone(),
        url: prepared.url.clone(),
        headers: prepared.headers.clone(),
        body: prepared.body.clone(),
        resource_type: prepared.resource_type.clone(),
        timestamp: prepared.timestamp,
        pending,
    }
}

fn response_capture(
    prepared: &PreparedResponse,
    pending: bool,
    error: Option<String>,
) -> ResponseCapture {
    ResponseCapture {
        req_id: prepared.req_id.clone(),
        url: prepared.url.clone(),
        status: prepared.status,
        headers: prepared.headers.clone(),
        body: prepared.body.clone(),
        pending,
        timestamp: prepared.timestamp,
        error,
    }
}
