//! Rewrite Rule Engine
//!
//! Applies a user-ordered list of match-and-replace rules to request or
//! response material at six hook points. The engine is pure: no I/O, no
//! global state beyond the compiled-regex cache.

use crate::exchange::Headers;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Hook point a rule applies to. The serialized spelling matches the project
/// document format ("Request header", "Response body", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RewriteScope {
    #[serde(rename = "Request header")]
    RequestHeader,
    #[serde(rename = "Response header")]
    ResponseHeader,
    #[serde(rename = "Request body")]
    RequestBody,
    #[serde(rename = "Response body")]
    ResponseBody,
    #[serde(rename = "Request first line")]
    RequestFirstLine,
    #[serde(rename = "Response first line")]
    ResponseFirstLine,
}

fn default_true() -> bool {
    true
}

/// A single ordered match-and-replace rule.
///
/// Literal rules replace every occurrence of `match_pattern`. Regex rules
/// replace every match; backreferences in `replacement` follow the `regex`
/// crate convention (`$1`, `${name}`) on every scope. An invalid pattern
/// disables the rule; it never fails traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "item")]
    pub scope: RewriteScope,
    #[serde(rename = "match")]
    pub match_pattern: String,
    #[serde(rename = "replace")]
    pub replacement: String,
    #[serde(rename = "isRegex", default)]
    pub is_regex: bool,
    #[serde(default)]
    pub comment: String,
}

/// An immutable, ordered rule list with a compiled-pattern cache.
///
/// Writers build a fresh `RuleSet` and swap it in; traffic processing holds a
/// reference-counted snapshot for the duration of one rewrite pass.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RewriteRule>,
    // Pattern text -> compiled regex; None marks a pattern that failed to
    // compile, so the warning fires once per rule set.
    cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl RuleSet {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self {
            rules,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        let mut cache = self.cache.lock().unwrap();
        cache
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Disabling rewrite rule, invalid regex '{}': {}", pattern, e);
                    None
                }
            })
            .clone()
    }

    fn enabled_rules(&self, scope: RewriteScope) -> impl Iterator<Item = &RewriteRule> {
        self.rules
            .iter()
            .filter(move |r| r.enabled && r.scope == scope)
    }

    fn apply_rule(&self, rule: &RewriteRule, input: &str) -> String {
        if rule.is_regex {
            match self.compiled(&rule.match_pattern) {
                Some(re) => re
                    .replace_all(input, rule.replacement.as_str())
                    .into_owned(),
                None => input.to_string(),
            }
        } else {
            input.replace(&rule.match_pattern, &rule.replacement)
        }
    }

    /// Rewrite a first line, e.g. `GET /foo HTTP/1.1` or `HTTP/1.1 200`.
    pub fn apply_first_line(&self, scope: RewriteScope, line: &str) -> String {
        let mut line = line.to_string();
        for rule in self.enabled_rules(scope) {
            line = self.apply_rule(rule, &line);
        }
        line
    }

    /// Rewrite a body payload.
    pub fn apply_body(&self, scope: RewriteScope, body: &str) -> String {
        let mut body = body.to_string();
        for rule in self.enabled_rules(scope) {
            body = self.apply_rule(rule, &body);
        }
        body
    }

    /// Rewrite a header list. Each header is synthesised as `Name: Value`,
    /// every enabled rule runs over the lines in index order, and the result
    /// is reparsed: an empty line deletes the header, a line without a colon
    /// keeps the header unchanged and is logged as malformed.
    pub fn apply_headers(&self, scope: RewriteScope, headers: &Headers) -> Headers {
        let mut current: Vec<(String, String)> = headers.iter().cloned().collect();
        for rule in self.enabled_rules(scope) {
            current = current
                .into_iter()
                .filter_map(|(name, value)| {
                    let line = format!("{}: {}", name, value);
                    let rewritten = self.apply_rule(rule, &line);
                    if rewritten == line {
                        return Some((name, value));
                    }
                    if rewritten.is_empty() {
                        return None;
                    }
                    match split_header_line(&rewritten) {
                        Some(pair) => Some(pair),
                        None => {
                            warn!(
                                "Rewrite rule '{}' produced a malformed header line '{}', keeping original",
                                rule.match_pattern, rewritten
                            );
                            Some((name, value))
                        }
                    }
                })
                .collect();
        }
        Headers::from_pairs(current)
    }
}

fn split_header_line(line: &str) -> Option<(String, String)> {
    if let Some((name, value)) = line.split_once(": ") {
        Some((name.to_string(), value.to_string()))
    } else {
        line.split_once(':')
            .map(|(name, value)| (name.to_string(), value.to_string()))
    }
}

/// Reparse a rewritten request line into `(method, url)`.
pub fn split_request_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let url = parts.next()?;
    Some((method.to_string(), url.to_string()))
}

/// Reparse a rewritten status line into the status code.
pub fn split_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(scope: RewriteScope, pattern: &str, replace: &str, is_regex: bool) -> RewriteRule {
        RewriteRule {
            enabled: true,
            scope,
            match_pattern: pattern.into(),
            replacement: replace.into(),
            is_regex,
            comment: String::new(),
        }
    }

    #[test]
    fn test_literal_replaces_all_occurrences() {
        let rules = RuleSet::new(vec![rule(RewriteScope::ResponseBody, "foo", "bar", false)]);
        assert_eq!(
            rules.apply_body(RewriteScope::ResponseBody, "foo foo foo"),
            "bar bar bar"
        );
    }

    #[test]
    fn test_rules_compose_in_index_order() {
        let rules = RuleSet::new(vec![
            rule(RewriteScope::ResponseBody, "foo", "bar", false),
            rule(RewriteScope::ResponseBody, "bar", "baz", false),
        ]);
        assert_eq!(rules.apply_body(RewriteScope::ResponseBody, "foo"), "baz");
    }

    #[test]
    fn test_regex_backreference() {
        let rules = RuleSet::new(vec![rule(
            RewriteScope::RequestFirstLine,
            r"GET /v1/(\w+)",
            "GET /v2/$1",
            true,
        )]);
        let line = rules.apply_first_line(RewriteScope::RequestFirstLine, "GET /v1/users HTTP/1.1");
        assert_eq!(line, "GET /v2/users HTTP/1.1");
    }

    #[test]
    fn test_header_rewrite_preserves_count() {
        let rules = RuleSet::new(vec![rule(
            RewriteScope::RequestHeader,
            r"User-Agent: .*",
            "User-Agent: X",
            true,
        )]);
        let headers = Headers::from_pairs(vec![
            ("Host".into(), "a.test".into()),
            ("User-Agent".into(), "Mozilla/5.0".into()),
            ("Accept".into(), "*/*".into()),
        ]);
        let out = rules.apply_headers(RewriteScope::RequestHeader, &headers);
        assert_eq!(out.len(), 3);
        assert_eq!(out.get("user-agent"), Some("X"));
        assert_eq!(out.get("host"), Some("a.test"));
    }

    #[test]
    fn test_empty_replacement_deletes_header() {
        let rules = RuleSet::new(vec![rule(
            RewriteScope::RequestHeader,
            r"Cookie: .*",
            "",
            true,
        )]);
        let headers = Headers::from_pairs(vec![
            ("Cookie".into(), "session=1".into()),
            ("Accept".into(), "*/*".into()),
        ]);
        let out = rules.apply_headers(RewriteScope::RequestHeader, &headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("cookie"), None);
    }

    #[test]
    fn test_colonless_result_keeps_header() {
        let rules = RuleSet::new(vec![rule(
            RewriteScope::RequestHeader,
            r"X-Flag: .*",
            "garbage",
            true,
        )]);
        let headers = Headers::from_pairs(vec![("X-Flag".into(), "on".into())]);
        let out = rules.apply_headers(RewriteScope::RequestHeader, &headers);
        assert_eq!(out.get("x-flag"), Some("on"));
    }

    #[test]
    fn test_invalid_regex_disables_rule() {
        let rules = RuleSet::new(vec![
            rule(RewriteScope::RequestBody, "(broken", "x", true),
            rule(RewriteScope::RequestBody, "a", "b", false),
        ]);
        // The broken rule is a no-op; the following rule still runs.
        assert_eq!(rules.apply_body(RewriteScope::RequestBody, "a (broken"), "b (broken");
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let mut disabled = rule(RewriteScope::RequestBody, "a", "b", false);
        disabled.enabled = false;
        let rules = RuleSet::new(vec![disabled]);
        assert_eq!(rules.apply_body(RewriteScope::RequestBody, "aaa"), "aaa");
    }

    #[test]
    fn test_scope_isolation() {
        let rules = RuleSet::new(vec![rule(RewriteScope::RequestBody, "a", "b", false)]);
        assert_eq!(rules.apply_body(RewriteScope::ResponseBody, "aaa"), "aaa");
    }

    #[test]
    fn test_first_line_parsers() {
        assert_eq!(
            split_request_line("POST https://a.test/x HTTP/1.1"),
            Some(("POST".into(), "https://a.test/x".into()))
        );
        assert_eq!(split_request_line(""), None);
        assert_eq!(split_status_line("HTTP/1.1 404"), Some(404));
        assert_eq!(split_status_line("HTTP/1.1 not-a-code"), None);
    }

    #[test]
    fn test_rule_wire_shape() {
        let json = r#"{"enabled":true,"item":"Request header","match":"A","replace":"B","isRegex":false,"comment":""}"#;
        let rule: RewriteRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.scope, RewriteScope::RequestHeader);
        assert!(!rule.is_regex);
    }
}
