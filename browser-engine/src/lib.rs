//! Mirage Browser Engine
//!
//! Drives an instrumented Chromium session through the traffic-mediation
//! engine: every exchange the browser makes is paused at the CDP Fetch layer,
//! routed through the interception coordinator, and released with whatever
//! rewrites or operator edits apply. Also hosts the replay executor, a plain
//! HTTP client for operator-crafted requests that bypasses interception
//! entirely.

pub mod browser;
pub mod intercept;
pub mod replay;

/// Error types for browser engine operations
pub mod error;

pub use browser::{BrowserDriver, BrowserOptions};
pub use error::{BrowserEngineError, EngineResult};
pub use replay::{parse_raw_request, ParsedRequest, ReplayExecutor, ReplayOutcome};
