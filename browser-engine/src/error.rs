//! Browser Engine Error Types

use thiserror::Error;

/// Main error type for the browser engine
#[derive(Debug, Error)]
pub enum BrowserEngineError {
    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Browser is not active")]
    NotActive,

    #[error("Page navigation failed: {0}")]
    Navigation(String),

    #[error("CDP command failed: {0}")]
    Cdp(String),

    #[error("Malformed raw request: {0}")]
    MalformedRequest(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for browser engine operations
pub type EngineResult<T> = Result<T, BrowserEngineError>;
