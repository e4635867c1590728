use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use relay_orchestrator::{ApprovalError, IngestError};
use relay_store::StoreError;
use relay_wire::ErrorBody;

/// API error with the taxonomy kind surfaced in the envelope. No stack
/// traces leak; the message is the whole story.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            kind: "validation_failure",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "business_invariant_violation",
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "authentication_failure",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "runtime_error",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.kind.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::not_found(what),
            StoreError::Invariant(what) => ApiError::business(what),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StoreError>() {
            Ok(store_err) => store_err.into(),
            Err(err) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Duplicate => ApiError {
                status: StatusCode::CONFLICT,
                kind: "duplicate_event",
                message: "event already received within the dedup window".to_string(),
            },
            IngestError::Invalid(message) => ApiError::validation(message),
            IngestError::Internal(err) => err.into(),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(id) => ApiError::not_found(format!("audit log {id}")),
            ApprovalError::NotPending(id, status) => {
                ApiError::business(format!("audit log {id} is {status}, not pending"))
            }
            ApprovalError::NoAutomation(kind) => {
                ApiError::internal(format!("no automation registered for `{kind}`"))
            }
            ApprovalError::Internal(err) => err.into(),
        }
    }
}
