use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Classified failures for the room channel and the reaction pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("not connected to a room")]
    NotConnected,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("checkout failed: {0}")]
    Checkout(String),
    #[error("build failed: {0}")]
    Build(String),
    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SyncError::Connection(_) => "connection",
            SyncError::Auth(_) => "auth",
            SyncError::NotConnected => "not_connected",
            SyncError::MalformedMessage(_) => "malformed_message",
            SyncError::InvalidPayload(_) => "invalid_payload",
            SyncError::UnknownMessageType(_) => "unknown_message_type",
            SyncError::Fetch(_) => "fetch",
            SyncError::Checkout(_) => "checkout",
            SyncError::Build(_) => "build",
            SyncError::Config(_) => "config",
        }
    }

    /// True for failures that happen before a channel is established.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Auth(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        SyncError::MalformedMessage(value.to_string())
    }
}
