//! Exchange Data Model
//!
//! A single HTTP request together with its (eventual) response, plus the
//! operator-edit form used when a suspended exchange is forwarded.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Ordered, case-preserving header list. Duplicate names are permitted.
///
/// Serialized as a JSON object so the wire protocol and project documents
/// keep the shape the operator client expects; insertion order and duplicate
/// keys survive the round-trip because entries are streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of `name` with a single entry, preserving the
    /// position of the first occurrence; appends when absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut slot = None;
        self.0.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if slot.is_none() {
                    *v = value.clone();
                    slot = Some(());
                    true
                } else {
                    false
                }
            } else {
                true
            }
        });
        if slot.is_none() {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.0
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    pairs.push((name, value));
                }
                Ok(Headers(pairs))
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// Lifecycle state of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    #[default]
    Captured,
    ReqRewritten,
    ReqSuspended,
    InFlight,
    ResRewritten,
    ResSuspended,
    Completed,
    Dropped,
}

/// Response sub-record of an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A captured exchange as it lives in the project history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: String,
    #[serde(default)]
    pub seq: u64,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "resourceType", default)]
    pub resource_type: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
    #[serde(default)]
    pub state: ExchangeState,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dropped: bool,
    #[serde(rename = "interceptResponse", default, skip_serializing_if = "is_false")]
    pub intercept_response: bool,
}

/// Operator edit merged into a suspended exchange on `forward`.
///
/// Request-phase forwards honor `method`, `headers` and `body`;
/// response-phase forwards honor `status`, `headers` and `body`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEdit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A rewritten request ready to be released upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub id: String,
    pub seq: u64,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub resource_type: String,
    pub timestamp: i64,
}

/// A rewritten response ready to be delivered to the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedResponse {
    pub req_id: String,
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Option<String>,
    pub timestamp: i64,
}

impl ExchangeEdit {
    /// Merge this edit into an outgoing request. Content-Length is recomputed
    /// from the final body length, regardless of what the edit carried.
    pub fn apply_to_request(&self, req: &mut PreparedRequest) {
        if let Some(method) = &self.method {
            req.method = method.clone();
        }
        if let Some(url) = &self.url {
            req.url = url.clone();
        }
        if let Some(headers) = &self.headers {
            req.headers = headers.clone();
        }
        if let Some(body) = &self.body {
            req.body = Some(body.clone());
        }
        if let Some(body) = &req.body {
            if req.headers.get("content-length").is_some() || self.body.is_some() {
                req.headers.set("Content-Length", body.len().to_string());
            }
        }
    }

    /// Merge this edit into an outgoing response, recomputing Content-Length
    /// the same way as [`apply_to_request`](Self::apply_to_request).
    pub fn apply_to_response(&self, res: &mut PreparedResponse) {
        if let Some(status) = self.status {
            res.status = status;
        }
        if let Some(headers) = &self.headers {
            res.headers = headers.clone();
        }
        if let Some(body) = &self.body {
            res.body = Some(body.clone());
        }
        if let Some(body) = &res.body {
            if res.headers.get("content-length").is_some() || self.body.is_some() {
                res.headers.set("Content-Length", body.len().to_string());
            }
        }
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_preserve_order_and_duplicates() {
        let mut headers = Headers::new();
        headers.push("Set-Cookie", "a=1");
        headers.push("Content-Type", "text/html");
        headers.push("Set-Cookie", "b=2");

        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(
            json,
            r#"{"Set-Cookie":"a=1","Content-Type":"text/html","Set-Cookie":"b=2"}"#
        );

        let back: Headers = serde_json::from_str(&json).unwrap();
        assert_eq!(back, headers);
    }

    #[test]
    fn test_headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.push("User-Agent", "mirage");
        assert_eq!(headers.get("user-agent"), Some("mirage"));
        assert_eq!(headers.get("USER-AGENT"), Some("mirage"));
        assert_eq!(headers.get("host"), None);
    }

    #[test]
    fn test_headers_set_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.push("X-Token", "one");
        headers.push("Accept", "*/*");
        headers.push("x-token", "two");
        headers.set("X-Token", "three");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("x-token"), Some("three"));
    }

    #[test]
    fn test_edit_recomputes_content_length() {
        let mut req = PreparedRequest {
            id: "x".into(),
            seq: 1,
            method: "POST".into(),
            url: "https://a.test/login".into(),
            headers: Headers::from_pairs(vec![("Content-Length".into(), "7".into())]),
            body: Some("u=a&p=b".into()),
            resource_type: "xhr".into(),
            timestamp: 0,
        };
        let edit = ExchangeEdit {
            body: Some("u=a&p=longer".into()),
            ..Default::default()
        };
        edit.apply_to_request(&mut req);
        assert_eq!(req.body.as_deref(), Some("u=a&p=longer"));
        assert_eq!(req.headers.get("content-length"), Some("12"));
    }

    #[test]
    fn test_edit_status_only() {
        let mut res = PreparedResponse {
            req_id: "x".into(),
            url: "https://a.test/".into(),
            status: 200,
            headers: Headers::new(),
            body: Some("ok".into()),
            timestamp: 0,
        };
        let edit = ExchangeEdit {
            status: Some(500),
            ..Default::default()
        };
        edit.apply_to_response(&mut res);
        assert_eq!(res.status, 500);
        assert_eq!(res.body.as_deref(), Some("ok"));
        // No body edit and no pre-existing Content-Length: nothing synthesised.
        assert_eq!(res.headers.get("content-length"), None);
    }

    #[test]
    fn test_exchange_roundtrip() {
        let exchange = Exchange {
            id: "0001-abcd".into(),
            seq: 3,
            method: "GET".into(),
            url: "https://a.test/x".into(),
            headers: Headers::from_pairs(vec![("Accept".into(), "*/*".into())]),
            body: None,
            resource_type: "document".into(),
            timestamp: 1_700_000_000_000,
            response: Some(ResponseRecord {
                status: 200,
                headers: Headers::new(),
                body: Some("<html>".into()),
                error: None,
            }),
            state: ExchangeState::Completed,
            dropped: false,
            intercept_response: false,
        };
        let json = serde_json::to_string(&exchange).unwrap();
        let back: Exchange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, exchange);
    }
}
