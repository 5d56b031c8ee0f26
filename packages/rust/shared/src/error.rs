//! Error types for epgsync.
//!
//! Library crates use [`EpgSyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{RegionCode, Stage};

/// Top-level error type for all epgsync operations.
#[derive(Debug, thiserror::Error)]
pub enum EpgSyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Input validation error (bad region code, unknown filter, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A subprocess could not be spawned or awaited.
    #[error("failed to run `{program}`: {message}")]
    Command { program: String, message: String },

    /// Network/HTTP error while downloading a guide source.
    #[error("network error: {0}")]
    Network(String),

    /// A git invocation exited unsuccessfully.
    #[error("git error: {0}")]
    Git(String),

    /// A pipeline or launcher stage failed.
    #[error("{stage} failed{}: {message}", region_suffix(.region))]
    Stage {
        stage: Stage,
        region: Option<RegionCode>,
        message: String,
    },
}

fn region_suffix(region: &Option<RegionCode>) -> String {
    match region {
        Some(code) => format!(" for region {code}"),
        None => String::new(),
    }
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EpgSyncError>;

impl EpgSyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// A stage failure not tied to any region.
    pub fn stage(stage: Stage, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            region: None,
            message: msg.into(),
        }
    }

    /// A stage failure attributed to one region.
    pub fn region_stage(stage: Stage, region: RegionCode, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            region: Some(region),
            message: msg.into(),
        }
    }

    /// The stage this error was raised in, if it is a stage failure.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
