use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Validation failures surface to the caller with a 400 and a specific
/// message; everything else is logged and collapsed to a generic 500.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request already sent")]
    DuplicateRequest,
    #[error("invalid request")]
    InvalidRequest,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("users are not friends")]
    NotFriends,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sled::Error> for ApiError {
    fn from(err: sled::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(err) => {
                error!("internal error: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
            err => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        }
    }
}
