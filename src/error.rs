use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::order::ServiceOrder;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Precondition failed on a conditional order update. Carries the
    /// authoritative order snapshot so the caller can render the resolved
    /// outcome without a follow-up fetch.
    #[error("conflict: {reason}")]
    Conflict {
        reason: String,
        current: Box<ServiceOrder>,
    },

    #[error("downstream failure: {0}")]
    Downstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn conflict(reason: impl Into<String>, current: &ServiceOrder) -> Self {
        AppError::Conflict {
            reason: reason.into(),
            current: Box::new(current.clone()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
            }
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            AppError::Conflict { reason, current } => (
                StatusCode::CONFLICT,
                Json(json!({ "error": reason, "order": current })),
            )
                .into_response(),
            AppError::Downstream(msg) => {
                (StatusCode::BAD_GATEWAY, Json(json!({ "error": msg }))).into_response()
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg }))).into_response()
            }
        }
    }
}
