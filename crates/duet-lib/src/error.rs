//! Error taxonomy for the pipeline.
//!
//! Every variant folds into one of four kinds. Validation failures happen
//! before any network call. Transport failures degrade a single stage.
//! Permission failures abort before a stage starts. Persistence failures are
//! logged and never abort the turn.
//!
//! Only [`PipelineError::client_message`] is ever put on the wire; the
//! `Display` text may contain vendor bodies and stays in the logs.

use std::time::Duration;

use thiserror::Error;

use duet_core::types::InvalidTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transport,
    Permission,
    Persistence,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider not registered: {0}")]
    ProviderNotFound(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no vendor event within {0:?}")]
    Timeout(Duration),

    #[error("vendor error {code}: {message}")]
    Vendor { code: i64, message: String },

    #[error("malformed vendor payload: {0}")]
    Decode(String),

    #[error("not authorized: {0}")]
    Permission(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_)
            | PipelineError::Config(_)
            | PipelineError::ProviderNotFound(_)
            | PipelineError::ProviderUnavailable(_)
            | PipelineError::InvalidState(_) => ErrorKind::Validation,
            PipelineError::Transport(_)
            | PipelineError::Timeout(_)
            | PipelineError::Vendor { .. }
            | PipelineError::Decode(_) => ErrorKind::Transport,
            PipelineError::Permission(_) => ErrorKind::Permission,
            PipelineError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Text safe to show a client. Never includes vendor payloads.
    pub fn client_message(&self) -> String {
        match self {
            PipelineError::Validation(msg) => format!("invalid request: {msg}"),
            PipelineError::Config(_)
            | PipelineError::ProviderNotFound(_)
            | PipelineError::ProviderUnavailable(_) => "service is not configured".into(),
            PipelineError::Timeout(_) => "upstream service timed out".into(),
            PipelineError::Transport(_)
            | PipelineError::Vendor { .. }
            | PipelineError::Decode(_) => "upstream service unavailable".into(),
            PipelineError::Permission(_) => "not authorized for this conversation".into(),
            PipelineError::Persistence(_) => "failed to save message".into(),
            PipelineError::InvalidState(_) => "internal error".into(),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PipelineError::Transport(format!("request timed out: {e}"))
        } else if e.is_decode() {
            PipelineError::Decode(e.to_string())
        } else {
            PipelineError::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        PipelineError::Transport(format!("socket: {e}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Transport(format!("io: {e}"))
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(e: toml::de::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}
