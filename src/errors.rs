use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", content = "message")]
pub enum EngineError {
    #[serde(rename = "TRANSPORT_FAILURE")]
    #[error("TRANSPORT_FAILURE: {0}")]
    Transport(String),
    #[serde(rename = "QUERY_REJECTED")]
    #[error("QUERY_REJECTED: {0}")]
    Query(String),
    #[serde(rename = "SESSION_EXPIRED")]
    #[error("SESSION_EXPIRED: {0}")]
    SessionExpired(String),
    #[serde(rename = "MALFORMED_ROW")]
    #[error("MALFORMED_ROW: {0}")]
    MalformedRow(String),
    #[serde(rename = "CONFIG_INVALID")]
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[serde(rename = "NOT_FOUND")]
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[serde(rename = "INTERNAL")]
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl EngineError {
    /// Transport failures are the only errors the change feed retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// A lost session stops the whole engine instance until re-activation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Query(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
