use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::session::SessionError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    pub const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

impl ErrorBody {
    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            error: "validation_error",
            details: Some(details),
        }
    }

    pub fn simple(error: &'static str) -> Self {
        Self {
            error,
            details: None,
        }
    }

    pub fn server_error() -> Self {
        Self::simple("server_error")
    }
}

pub fn validation_response(details: Vec<FieldError>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::validation(details))).into_response()
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            SessionError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            SessionError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            SessionError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            SessionError::Storage(err) => {
                error!(?err, "session operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
        };
        (status, Json(ErrorBody::simple(code))).into_response()
    }
}
