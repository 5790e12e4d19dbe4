//! Operator Channel & Event Router
//!
//! One full-duplex WebSocket per operator connection. Outbound messages are
//! serialised per connection through a bounded queue; when the queue is full
//! the oldest non-prompt event is shed. Prompts are never shed: a prompt
//! that cannot be delivered anywhere auto-forwards its exchange. Inbound
//! commands dispatch concurrently, one task per command.

use crate::protocol::{outbound_for_event, Command, Outbound};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use intercept_core::{Coordinator, EngineEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on the per-connection outbound queue.
const OUTBOUND_QUEUE_CAP: usize = 256;

/// Result of offering a message to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, but an older non-prompt event was shed to make room — or the
    /// offered non-prompt event itself was shed.
    Shed,
    /// The queue is full of prompts; the offered prompt was not queued.
    PromptRejected,
}

/// One operator connection's send side.
pub struct Connection {
    pub id: String,
    queue: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    closed: AtomicBool,
    shed_total: AtomicU64,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            shed_total: AtomicU64::new(0),
        }
    }

    /// Offer a message. Never blocks; capture events may be lost under
    /// back-pressure, prompts never silently so.
    pub fn push(&self, msg: Outbound) -> PushOutcome {
        let mut queue = self.queue.lock().unwrap();
        let mut outcome = PushOutcome::Queued;
        if queue.len() >= OUTBOUND_QUEUE_CAP {
            match queue.iter().position(|m| !m.is_prompt()) {
                Some(oldest) => {
                    queue.remove(oldest);
                    self.shed_total.fetch_add(1, Ordering::Relaxed);
                    outcome = PushOutcome::Shed;
                }
                None if msg.is_prompt() => return PushOutcome::PromptRejected,
                None => {
                    self.shed_total.fetch_add(1, Ordering::Relaxed);
                    return PushOutcome::Shed;
                }
            }
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
        outcome
    }

    /// Next message to write, or `None` once the connection is closed and
    /// drained.
    pub async fn next(&self) -> Option<Outbound> {
        loop {
            if let Some(msg) = self.queue.lock().unwrap().pop_front() {
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn shed_total(&self) -> u64 {
        self.shed_total.load(Ordering::Relaxed)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live operator connections. Attach/detach transitions drive
/// the coordinator's degraded mode.
pub struct ChannelRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    coordinator: Arc<Coordinator>,
}

impl ChannelRegistry {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            coordinator,
        }
    }

    pub async fn add(&self, connection: Arc<Connection>) {
        let mut conns = self.connections.write().await;
        conns.insert(connection.id.clone(), connection);
        if conns.len() == 1 {
            self.coordinator.operator_attached();
        }
    }

    pub async fn remove(&self, connection_id: &str) {
        let mut conns = self.connections.write().await;
        if let Some(conn) = conns.remove(connection_id) {
            conn.close();
        }
        if conns.is_empty() {
            self.coordinator.operator_detached();
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Fan a message out to every connection. An undeliverable prompt
    /// auto-forwards its exchange.
    pub async fn broadcast(&self, msg: Outbound) {
        let undeliverable_prompt = {
            let conns = self.connections.read().await;
            if msg.is_prompt() {
                let delivered = conns
                    .values()
                    .filter(|conn| conn.push(msg.clone()) != PushOutcome::PromptRejected)
                    .count();
                if delivered == 0 {
                    msg.prompt_id().map(str::to_string)
                } else {
                    None
                }
            } else {
                for conn in conns.values() {
                    conn.push(msg.clone());
                }
                None
            }
        };
        if let Some(id) = undeliverable_prompt {
            self.coordinator.prompt_undeliverable(&id);
        }
    }
}

/// `GET /ws` upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let connection = Arc::new(Connection::new());
    state.channels.add(connection.clone()).await;
    info!("Operator connected: {}", connection.id);

    connection.push(Outbound::InterceptStatus {
        intercept_requests: state.coordinator.intercept_requests(),
    });

    let writer_conn = connection.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = writer_conn.next().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Command>(&text) {
                    Ok(command) => {
                        // Commands targeting independent exchanges proceed
                        // concurrently.
                        let state = state.clone();
                        let connection = connection.clone();
                        tokio::spawn(async move {
                            dispatch(state, connection, command).await;
                        });
                    }
                    Err(e) => {
                        connection.push(Outbound::ack_error(
                            "unknown",
                            None,
                            format!("malformed command: {}", e),
                        ));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket read error: {}", e);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    state.channels.remove(&connection.id).await;
    writer.abort();
    info!("Operator disconnected: {}", connection.id);
}

async fn dispatch(state: AppState, connection: Arc<Connection>, command: Command) {
    let name = command.name();
    match command {
        Command::Start { url } => match state.driver.start(&url).await {
            Ok(()) => {
                connection.push(Outbound::ack(name, None, true));
            }
            Err(e) => {
                connection.push(Outbound::ack_error(name, None, e.to_string()));
            }
        },
        Command::Stop => match state.driver.stop().await {
            Ok(()) => {
                connection.push(Outbound::ack(name, None, true));
            }
            Err(e) => {
                connection.push(Outbound::ack_error(name, None, e.to_string()));
            }
        },
        Command::InterceptRequests { enabled } => {
            state.coordinator.set_intercept_requests(enabled);
            connection.push(Outbound::InterceptStatus {
                intercept_requests: enabled,
            });
        }
        Command::Forward {
            id,
            modified,
            intercept_response,
        } => {
            let success = state.coordinator.forward(&id, modified, intercept_response);
            connection.push(Outbound::ack(name, Some(id), success));
        }
        Command::Drop { id } => {
            let success = state.coordinator.drop_exchange(&id);
            connection.push(Outbound::ack(name, Some(id), success));
        }
        Command::Replay { tab_id, raw } => {
            let outcome = state.replay.execute(&tab_id, &raw).await;
            {
                let mut project = state.project.write().await;
                if let Some(tab) = project.repeater_tabs.iter_mut().find(|t| t.id == tab_id) {
                    tab.request = raw;
                    tab.response = outcome.body.clone().unwrap_or_default();
                    state.mark_dirty();
                }
            }
            connection.push(Outbound::ReplayResponse {
                tab_id,
                response: outcome.into(),
            });
        }
        Command::CancelReplay { tab_id } => {
            let success = state.replay.cancel(&tab_id);
            connection.push(Outbound::ack(name, Some(tab_id), success));
        }
        Command::InterceptResponse { id, enabled } => {
            let success = state.coordinator.set_intercept_response(&id, enabled);
            connection.push(Outbound::ack(name, Some(id), success));
        }
    }
}

/// Pump engine events into the capture history and out to every connection.
pub fn spawn_event_pump(state: AppState) -> JoinHandle<()> {
    let mut events = state.coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    record_event(&state, &event).await;
                    if let Some(msg) = outbound_for_event(&event) {
                        state.channels.broadcast(msg).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event pump lagged, {} events lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Mirror a visible event into the project capture log.
async fn record_event(state: &AppState, event: &EngineEvent) {
    match event {
        EngineEvent::Request(capture) if !capture.pending => {
            state.project.write().await.push_request(capture);
            state.mark_dirty();
        }
        EngineEvent::Response(capture) if !capture.pending => {
            state.project.write().await.attach_response(capture);
            state.mark_dirty();
        }
        EngineEvent::Dropped { id } | EngineEvent::Aborted { id } => {
            state.project.write().await.mark_dropped(id);
            state.mark_dirty();
        }
        _ => {}
    }
}
