use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during Utsuri operations.
#[derive(Debug, Error)]
pub enum UtsuriError {
    /// The configuration is invalid (unknown optimizer, malformed paths, bad ranges).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No checkpoint exists at the given location.
    #[error("checkpoint not found: {}", path.display())]
    CheckpointNotFound {
        /// File or model directory that was looked up.
        path: PathBuf,
    },

    /// A checkpoint exists but its header or payload cannot be read.
    #[error("corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint {
        /// Offending checkpoint file.
        path: PathBuf,
        /// What went wrong while reading it.
        reason: String,
    },

    /// A dataset file contains a malformed line.
    #[error("dataset error in {}:{line}: {reason}", path.display())]
    Dataset {
        /// Dataset file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Description of the problem.
        reason: String,
    },

    /// A token is missing from a vocabulary that does not allow unknowns.
    #[error("unknown {vocab} token: {token:?}")]
    UnknownToken {
        /// Vocabulary name ("words", "tags").
        vocab: &'static str,
        /// The token that could not be mapped.
        token: String,
    },

    /// A parameter with this name is already registered in the context.
    #[error("duplicate parameter name: {0}")]
    DuplicateParameter(String),

    /// A parameter with this name does not exist in the context.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// The computation context was closed and cannot run further steps.
    #[error("computation context is closed")]
    ContextClosed,

    /// A regex pattern failed to compile (should not happen with static patterns).
    #[error("regex compilation error: {0}")]
    RegexError(#[from] regex::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Candle ML framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl UtsuriError {
    /// Whether this error belongs to the configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(self, UtsuriError::Configuration(_))
    }

    /// Whether this error belongs to the I/O class (missing or unreadable files).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            UtsuriError::Io(_)
                | UtsuriError::CheckpointNotFound { .. }
                | UtsuriError::CorruptCheckpoint { .. }
        )
    }
}

/// Result type alias for Utsuri operations.
pub type Result<T> = std::result::Result<T, UtsuriError>;
