use crate::model::FeedQueryKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized")]
    Unauthorized,
}

impl GatewayError {
    /// Only transport failures are worth retrying; the core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, GatewayError::Conflict(_))
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => GatewayError::Unauthorized,
            404 | 409 | 410 => GatewayError::Conflict(message),
            _ => GatewayError::Server { status, message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    FetchFailed(GatewayError),
    #[error("mutation failed: {0}")]
    MutationFailed(GatewayError),
    #[error("invalid page request for {key}: page {requested} with {loaded} loaded ({reason})")]
    InvalidPageRequest {
        key: FeedQueryKey,
        requested: usize,
        loaded: usize,
        reason: &'static str,
    },
    #[error("no cache entry for {0}")]
    UnknownEntry(FeedQueryKey),
    #[error("sync engine closed")]
    EngineClosed,
}

impl SyncError {
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            SyncError::FetchFailed(err) | SyncError::MutationFailed(err) => Some(err),
            _ => None,
        }
    }
}
