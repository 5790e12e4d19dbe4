//! Replay Executor
//!
//! Issues operator-crafted requests with a plain HTTP client. Replays bypass
//! interception entirely: they never enter the suspended map and cannot be
//! forwarded or dropped, only cancelled.

use crate::error::{BrowserEngineError, EngineResult};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// A raw HTTP request text parsed into its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Parse operator-typed raw request text.
///
/// The request line may be absolute-form (`GET https://a.test/x HTTP/1.1`) or
/// origin-form, in which case the target resolves against the `Host` header;
/// `https` is assumed unless the host carries an explicit `:80`.
pub fn parse_raw_request(raw: &str) -> EngineResult<ParsedRequest> {
    let text = raw.replace("\r\n", "\n");
    let mut lines = text.split('\n');

    let request_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| BrowserEngineError::MalformedRequest("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| BrowserEngineError::MalformedRequest("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| BrowserEngineError::MalformedRequest("missing request target".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
            None => {
                return Err(BrowserEngineError::MalformedRequest(format!(
                    "header line without colon: '{}'",
                    line
                )))
            }
        }
    }

    let body_text = lines.collect::<Vec<&str>>().join("\n");
    let body = if body_text.is_empty() {
        None
    } else {
        Some(body_text)
    };

    let url = if target.starts_with("http://") || target.starts_with("https://") {
        target
    } else {
        let host = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| {
                BrowserEngineError::MalformedRequest("origin-form target without Host header".into())
            })?;
        let scheme = if host.ends_with(":80") { "http" } else { "https" };
        format!("{}://{}{}", scheme, host, target)
    };

    Ok(ParsedRequest {
        method,
        url,
        headers,
        body,
    })
}

/// Outcome of one replay execution, ready for the `replay_response` message.
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub error: Option<String>,
}

impl ReplayOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// The replay executor. One shared client; in-flight replays are tracked per
/// repeater tab so the operator can cancel them.
pub struct ReplayExecutor {
    client: reqwest::Client,
    in_flight: DashMap<String, oneshot::Sender<()>>,
}

impl ReplayExecutor {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            // A lab tool pointed at arbitrary hosts: certificate validity is
            // the operator's concern, and redirects stay visible.
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            client,
            in_flight: DashMap::new(),
        }
    }

    /// Execute raw request text on behalf of a repeater tab. Errors are
    /// folded into the outcome; this never fails the caller.
    pub async fn execute(&self, tab_id: &str, raw: &str) -> ReplayOutcome {
        let parsed = match parse_raw_request(raw) {
            Ok(parsed) => parsed,
            Err(e) => return ReplayOutcome::failed(e.to_string()),
        };
        info!("Replaying {} {} for tab {}", parsed.method, parsed.url, tab_id);

        let method = match reqwest::Method::from_bytes(parsed.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => return ReplayOutcome::failed(format!("invalid method '{}'", parsed.method)),
        };

        let mut request = self.client.request(method, &parsed.url);
        for (name, value) in &parsed.headers {
            // The client derives these from the final request itself.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(body) = parsed.body {
            request = request.body(body);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.in_flight.insert(tab_id.to_string(), cancel_tx);

        let outcome = tokio::select! {
            result = request.send() => match result {
                Ok(response) => Self::into_outcome(response).await,
                Err(e) => {
                    warn!("Replay failed for tab {}: {}", tab_id, e);
                    ReplayOutcome::failed(e.to_string())
                }
            },
            _ = cancel_rx => ReplayOutcome::failed("cancelled"),
        };

        self.in_flight.remove(tab_id);
        outcome
    }

    /// Cancel the in-flight replay for a tab, if any. The pending `execute`
    /// resolves with `error = "cancelled"`.
    pub fn cancel(&self, tab_id: &str) -> bool {
        match self.in_flight.remove(tab_id) {
            Some((_, cancel)) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    async fn into_outcome(response: reqwest::Response) -> ReplayOutcome {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = match response.text().await {
            Ok(text) => Some(text),
            Err(e) => return ReplayOutcome::failed(format!("failed to read body: {}", e)),
        };
        ReplayOutcome {
            status: Some(status),
            headers,
            body,
            error: None,
        }
    }
}

impl Default for ReplayExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origin_form() {
        let raw = "GET /search?q=x HTTP/1.1\r\nHost: a.test\r\nAccept: */*\r\n\r\n";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.url, "https://a.test/search?q=x");
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(parsed.body, None);
    }

    #[test]
    fn test_parse_absolute_form_with_body() {
        let raw = "POST http://a.test/login HTTP/1.1\nContent-Type: application/x-www-form-urlencoded\n\nu=a&p=b";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.url, "http://a.test/login");
        assert_eq!(parsed.body.as_deref(), Some("u=a&p=b"));
    }

    #[test]
    fn test_parse_port_80_means_http() {
        let raw = "GET / HTTP/1.1\nHost: a.test:80\n\n";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.url, "http://a.test:80/");
    }

    #[test]
    fn test_parse_missing_host_is_error() {
        let raw = "GET /x HTTP/1.1\nAccept: */*\n\n";
        assert!(matches!(
            parse_raw_request(raw),
            Err(BrowserEngineError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(parse_raw_request("").is_err());
    }

    #[test]
    fn test_cancel_without_replay_is_noop() {
        let executor = ReplayExecutor::new();
        assert!(!executor.cancel("tab-1"));
    }

    #[tokio::test]
    async fn test_execute_malformed_raw_reports_error() {
        let executor = ReplayExecutor::new();
        let outcome = executor.execute("tab-1", "").await;
        assert!(outcome.error.is_some());
        assert_eq!(outcome.status, None);
    }
}
