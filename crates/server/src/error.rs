use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of the underlying device connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Rejected(String),

    #[error("invalid bridge url: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Document store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InvalidValue(#[from] shared::ParseEnumError),

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Start was refused by the quota guard
    #[error("{0}")]
    Denied(String),

    #[error("no saved credentials for {0}")]
    NoCredentials(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Rejected by the quota guard with a user-facing reason
    #[error("{0}")]
    QuotaDenied(String),

    #[error("client unavailable")]
    ClientUnavailable,

    #[error("job queue is closed")]
    QueueClosed,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Whether the queue should try the job again
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::ClientUnavailable)
    }
}

/// Errors returned from HTTP handlers
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let AppError::Internal(message) = &self {
            tracing::error!("Internal error: {}", message);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Denied(reason) => AppError::Forbidden(reason),
            SessionError::NoCredentials(key) => {
                AppError::NotFound(format!("no saved credentials for {}", key))
            }
            SessionError::Transport(e) => AppError::Unavailable(e.to_string()),
            SessionError::Store(e) => e.into(),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidJob(msg) => AppError::BadRequest(msg),
            DispatchError::QuotaDenied(reason) => AppError::Forbidden(reason),
            DispatchError::ClientUnavailable | DispatchError::QueueClosed => {
                AppError::Unavailable(err.to_string())
            }
            DispatchError::Internal(msg) => AppError::Internal(msg),
            DispatchError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_client_unavailable_is_retryable() {
        assert!(DispatchError::ClientUnavailable.is_retryable());
        assert!(!DispatchError::InvalidJob("x".into()).is_retryable());
        assert!(!DispatchError::QuotaDenied("Plan expired".into()).is_retryable());
        assert!(!DispatchError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn test_quota_denial_maps_to_forbidden() {
        let err: AppError = DispatchError::QuotaDenied("Message quota exceeded".into()).into();
        assert!(matches!(err, AppError::Forbidden(ref m) if m == "Message quota exceeded"));
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }
}
