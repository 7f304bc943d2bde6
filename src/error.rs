use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    /// Server configuration cannot satisfy the request (e.g. no default model).
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid model path '{}': {reason}", .path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("failed to load '{}': {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    #[error("prompt must contain at least one token")]
    EmptyPrompt,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("chat template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("inference error: {0}")]
    Inference(#[from] candle_core::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable code used in `-ERR` responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIG",
            Self::InvalidPath { .. } => "INVALID_PATH",
            Self::Load { .. } => "LOAD_FAILED",
            Self::EmptyPrompt => "EMPTY_PROMPT",
            Self::Tokenizer(_) => "TOKENIZER",
            Self::Template(_) => "TEMPLATE",
            Self::Inference(_) => "INFERENCE",
            Self::Protocol(_) => "PROTOCOL",
            Self::Io(_) => "IO",
        }
    }
}
