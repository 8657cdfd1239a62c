use thiserror::Error;

use crate::{logql::LogqlError, transport::TransportError};

#[derive(Debug, Error)]
pub enum DatasourceError {
    /// Caller misuse detected before any network call.
    #[error("{0}")]
    InvalidInput(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Logql(#[from] LogqlError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Live tailing was stopped due to following error: {0}")]
    LiveTail(String),
    #[error("{0}")]
    Config(String),
    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DatasourceError {
    pub fn invalid_metadata_url(url: &str) -> Self {
        Self::InvalidInput(format!("invalid metadata request url: {url}"))
    }

    /// Short classification used in tracking logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) | Self::InvalidRequest(_) | Self::Logql(_) => "bad_data",
            Self::InvalidResponse(_) | Self::Serialization(_) => "internal",
            Self::Transport(_) => "transport",
            Self::LiveTail(_) => "live_tail",
            Self::Config(_) => "config",
        }
    }
}
