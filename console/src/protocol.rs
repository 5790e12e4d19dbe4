//! Operator Wire Protocol
//!
//! The bidirectional JSON message stream carried over `/ws`. Outbound
//! messages are tagged with `type`, inbound commands with `command`.

use browser_engine::ReplayOutcome;
use intercept_core::{EngineEvent, ExchangeEdit, RequestCapture, ResponseCapture};
use serde::{Deserialize, Serialize};

/// Payload of a `capture` message. Prompts use the same shape with
/// `pending: true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CaptureData {
    Request(RequestCapture),
    Response(ResponseCapture),
}

/// Response half of a `replay_response` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ReplayOutcome> for ReplayPayload {
    fn from(outcome: ReplayOutcome) -> Self {
        Self {
            status: outcome.status,
            headers: outcome.headers,
            body: outcome.body,
            error: outcome.error,
        }
    }
}

/// Messages sent to the operator client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Capture {
        data: CaptureData,
    },
    ReplayResponse {
        tab_id: String,
        response: ReplayPayload,
    },
    Ack {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    InterceptStatus {
        intercept_requests: bool,
    },
    Notice {
        message: String,
    },
}

impl Outbound {
    pub fn ack(command: &str, id: Option<String>, success: bool) -> Self {
        Outbound::Ack {
            command: command.to_string(),
            id,
            success,
            error: None,
        }
    }

    pub fn ack_error(command: &str, id: Option<String>, error: impl Into<String>) -> Self {
        Outbound::Ack {
            command: command.to_string(),
            id,
            success: false,
            error: Some(error.into()),
        }
    }

    /// Prompts must never be shed by the outbound queue.
    pub fn is_prompt(&self) -> bool {
        match self {
            Outbound::Capture {
                data: CaptureData::Request(c),
            } => c.pending,
            Outbound::Capture {
                data: CaptureData::Response(c),
            } => c.pending,
            _ => false,
        }
    }

    /// The exchange id a prompt refers to.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Outbound::Capture {
                data: CaptureData::Request(c),
            } if c.pending => Some(&c.id),
            Outbound::Capture {
                data: CaptureData::Response(c),
            } if c.pending => Some(&c.req_id),
            _ => None,
        }
    }
}

/// Convert an engine event into its wire form, when it has one.
pub fn outbound_for_event(event: &EngineEvent) -> Option<Outbound> {
    match event {
        EngineEvent::Request(capture) => Some(Outbound::Capture {
            data: CaptureData::Request(capture.clone()),
        }),
        EngineEvent::Response(capture) => Some(Outbound::Capture {
            data: CaptureData::Response(capture.clone()),
        }),
        EngineEvent::Dropped { id } => Some(Outbound::Notice {
            message: format!("exchange {} dropped", id),
        }),
        EngineEvent::Aborted { id } => Some(Outbound::Notice {
            message: format!("exchange {} aborted upstream while suspended", id),
        }),
        EngineEvent::Degraded { forwarded } => Some(Outbound::Notice {
            message: format!(
                "operator channel degraded: {} suspended exchange(s) auto-forwarded",
                forwarded
            ),
        }),
    }
}

/// Commands received from the operator client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Launch the instrumented browser at a URL.
    Start { url: String },
    /// Stop the browser; every suspended exchange is dropped.
    Stop,
    /// Arm or disarm request interception.
    InterceptRequests { enabled: bool },
    /// Release a suspended exchange, optionally edited.
    Forward {
        id: String,
        #[serde(default)]
        modified: Option<ExchangeEdit>,
        #[serde(rename = "interceptResponse", default)]
        intercept_response: Option<bool>,
    },
    /// Abort a suspended exchange.
    Drop { id: String },
    /// Execute raw request text on behalf of a repeater tab.
    Replay {
        #[serde(rename = "tabId")]
        tab_id: String,
        raw: String,
    },
    /// Cancel the in-flight replay of a repeater tab.
    CancelReplay {
        #[serde(rename = "tabId")]
        tab_id: String,
    },
    /// Mark an in-flight exchange so its response also suspends.
    InterceptResponse { id: String, enabled: bool },
}

impl Command {
    /// Wire name, echoed in acks.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Stop => "stop",
            Command::InterceptRequests { .. } => "intercept_requests",
            Command::Forward { .. } => "forward",
            Command::Drop { .. } => "drop",
            Command::Replay { .. } => "replay",
            Command::CancelReplay { .. } => "cancel_replay",
            Command::InterceptResponse { .. } => "intercept_response",
        }
    }
}
