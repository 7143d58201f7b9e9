use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("delivery request {0} is already assigned")]
    AlreadyAssigned(String),

    #[error("courier {0} is at its concurrent delivery limit")]
    CapacityExceeded(String),

    #[error("courier {0} is outside its service radius for this delivery")]
    OutOfRange(String),

    #[error("no available riders")]
    NoCandidates,

    #[error("assignment retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "not_found",
            DispatchError::InvalidState(_) => "invalid_state",
            DispatchError::AlreadyAssigned(_) => "already_assigned",
            DispatchError::CapacityExceeded(_) => "capacity_exceeded",
            DispatchError::OutOfRange(_) => "out_of_range",
            DispatchError::NoCandidates => "no_available_riders",
            DispatchError::RetriesExhausted(_) => "exhausted_retries",
            DispatchError::BadRequest(_) => "bad_request",
            DispatchError::Config(_) => "config_error",
            DispatchError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::InvalidState(_) | DispatchError::AlreadyAssigned(_) => {
                StatusCode::CONFLICT
            }
            DispatchError::CapacityExceeded(_) | DispatchError::OutOfRange(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            DispatchError::NoCandidates | DispatchError::RetriesExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Config(_) | DispatchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
