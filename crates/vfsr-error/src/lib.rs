#![forbid(unsafe_code)]
//! Error types for the VFS recovery engine.
//!
//! Defines `VfsrError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all recovery-engine operations.
#[derive(Debug, Error)]
pub enum VfsrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log framing violation at position {position}: {detail}")]
    Framing { position: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("iterator poisoned by invalid record at position {position}")]
    Poisoned { position: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
}

impl VfsrError {
    /// Whether retrying the same call can ever succeed.
    ///
    /// Framing and format violations are permanent properties of the bytes on
    /// disk; everything else depends on external state.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Framing { .. } | Self::Format(_) | Self::Poisoned { .. }
        )
    }
}

/// Result alias using `VfsrError`.
pub type Result<T> = std::result::Result<T, VfsrError>;
