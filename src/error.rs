//! Error types for the thumbnail pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::PageIndex;

/// A low-resolution render did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The renderer reported a failure.
    #[error("renderer failed on page {page_index}: {message}")]
    Backend { page_index: PageIndex, message: String },
    /// The renderer did not return within the configured timeout.
    #[error("render of page {page_index} timed out after {timeout:?}")]
    TimedOut {
        page_index: PageIndex,
        timeout: Duration,
    },
    /// The renderer panicked while rendering.
    #[error("renderer panicked on page {page_index}")]
    Panicked { page_index: PageIndex },
}

impl RenderError {
    /// Convenience constructor for renderer-reported failures.
    pub fn backend(page_index: PageIndex, message: impl Into<String>) -> Self {
        Self::Backend {
            page_index,
            message: message.into(),
        }
    }

    /// Page the failed render was for.
    pub fn page_index(&self) -> PageIndex {
        match self {
            Self::Backend { page_index, .. }
            | Self::TimedOut { page_index, .. }
            | Self::Panicked { page_index } => *page_index,
        }
    }
}

/// Releasing a decoded image failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to dispose image resource: {0}")]
pub struct DisposeError(pub String);

/// The scheduler could not start or refused a request.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The document session was closed; no further requests are accepted.
    #[error("render scheduler is closed")]
    Closed,
    #[error("failed to spawn render worker")]
    Spawn(#[source] std::io::Error),
}

/// Invalid configuration input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}
