//! # PageRoute Common
//!
//! Common utilities, error types, and configuration shared by the PageRoute
//! worker and page controller crates.
//!
//! ## Features
//!
//! - Shared error type for configuration, I/O and timeouts
//! - Logging configuration and setup
//! - Retry and timeout utilities
//! - Site configuration (base path, cache version, timings)

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod logging;
pub mod retry;

pub use config::SiteConfig;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for PageRoute.
#[derive(Error, Debug)]
pub enum PageRouteError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PageRouteError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for PageRoute operations.
pub type Result<T> = std::result::Result<T, PageRouteError>;
