//! Exclusion Filter
//!
//! Decides whether a captured exchange is reported to the operator.
//! Retroactive purging of already-captured history is a store operation and
//! lives with the project store, not here.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single exclusion rule. First match wins; a malformed URL or pattern
/// makes the rule non-matching, never matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ExclusionRule {
    /// Substring match on the URL host.
    Domain(String),
    /// Substring match on the full URL.
    Url(String),
    /// Regex match over the full URL.
    Regex(String),
}

impl ExclusionRule {
    /// Check whether this rule matches the given URL.
    pub fn matches(&self, url: &str) -> bool {
        match self {
            ExclusionRule::Domain(needle) => match url::Url::parse(url) {
                Ok(parsed) => parsed
                    .host_str()
                    .map(|host| host.contains(needle.as_str()))
                    .unwrap_or(false),
                Err(_) => false,
            },
            ExclusionRule::Url(needle) => url.contains(needle.as_str()),
            ExclusionRule::Regex(pattern) => match Regex::new(pattern) {
                Ok(re) => re.is_match(url),
                Err(e) => {
                    warn!("Invalid exclusion regex '{}': {}", pattern, e);
                    false
                }
            },
        }
    }
}

/// Evaluate `rules` against `url`; the first matching rule excludes.
pub fn is_excluded(url: &str, rules: &[ExclusionRule]) -> bool {
    rules.iter().any(|rule| rule.matches(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_substring() {
        let rules = vec![ExclusionRule::Domain("google".into())];
        assert!(is_excluded("https://fonts.google.com/icons", &rules));
        assert!(is_excluded("https://www.googleapis.com/x", &rules));
        assert!(!is_excluded("https://example.com/google", &rules));
    }

    #[test]
    fn test_url_substring() {
        let rules = vec![ExclusionRule::Url("/analytics".into())];
        assert!(is_excluded("https://a.test/analytics/collect", &rules));
        assert!(!is_excluded("https://a.test/api", &rules));
    }

    #[test]
    fn test_regex_match() {
        let rules = vec![ExclusionRule::Regex(r"\.(png|woff2?)($|\?)".into())];
        assert!(is_excluded("https://a.test/logo.png", &rules));
        assert!(is_excluded("https://a.test/font.woff2?v=3", &rules));
        assert!(!is_excluded("https://a.test/page", &rules));
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        let rules = vec![ExclusionRule::Regex("(unclosed".into())];
        assert!(!is_excluded("https://a.test/(unclosed", &rules));
    }

    #[test]
    fn test_malformed_url_never_matches_domain() {
        let rules = vec![ExclusionRule::Domain("test".into())];
        assert!(!is_excluded("not a url", &rules));
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            ExclusionRule::Url("never-matches".into()),
            ExclusionRule::Domain("a.test".into()),
        ];
        assert!(is_excluded("https://a.test/", &rules));
    }

    #[test]
    fn test_rule_wire_shape() {
        let rule: ExclusionRule =
            serde_json::from_str(r#"{"type":"domain","value":"cdn"}"#).unwrap();
        assert_eq!(rule, ExclusionRule::Domain("cdn".into()));
        let json = serde_json::to_string(&ExclusionRule::Regex("^https".into())).unwrap();
        assert_eq!(json, r#"{"type":"regex","value":"^https"}"#);
    }
}
