use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use spotmail_proto::{ErrorBody, ErrorCode};
use thiserror::Error;
use time::OffsetDateTime;

use super::clock::rfc3339;
use super::mailer::DispatchError;

/// Everything an HTTP handler can fail with.
///
/// `Internal` deliberately carries no detail; the cause is logged where it
/// happens and the client only sees a generic message plus a timestamp.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("too many requests, please try again later")]
    RateLimited,
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Dispatch(err) => err.status(),
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Dispatch(err) => err.code(),
            Self::Internal => ErrorCode::InternalError,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let timestamp = matches!(self, Self::Internal)
            .then(|| rfc3339(OffsetDateTime::now_utc()));
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code(),
            timestamp,
        };
        (self.status(), Json(body)).into_response()
    }
}
