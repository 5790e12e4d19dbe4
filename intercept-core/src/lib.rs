//! Mirage Traffic-Mediation Engine
//!
//! This library provides the core mediation logic for the Mirage intercepting
//! proxy: exchange identity allocation, match-and-replace rewriting,
//! exclusion filtering, and the interception coordinator that parks in-flight
//! exchanges until an operator decision arrives.

pub mod coordinator;
pub mod exchange;
pub mod exclusion;
/// Match-and-replace rewrite rules
pub mod rewrite;
/// Exchange id and display-sequence allocation
pub mod sequence;

pub use coordinator::{
    Coordinator, CoordinatorConfig, Decision, EngineEvent, InterceptPhase, RawRequest, RawResponse,
    RequestCapture, RequestVerdict, ResponseCapture, ResponseVerdict,
};
pub use exchange::{Exchange, ExchangeEdit, ExchangeState, Headers, ResponseRecord};
pub use exclusion::{is_excluded, ExclusionRule};
pub use rewrite::{RewriteRule, RewriteScope, RuleSet};
pub use sequence::ExchangeIds;
