//! Console Error Types

use thiserror::Error;

/// Main error type for console operations
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Browser engine error: {0}")]
    Engine(#[from] browser_engine::BrowserEngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for console operations
pub type ConsoleResult<T> = Result<T, ConsoleError>;
