use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcmanError>;

/// Failure kind as it travels on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    SpawnFailure,
    DeputyUnreachable,
    Internal,
}

/// Error payload returned by every failing command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The bare payload `message` was formatted from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcmanError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("process '{0}' not found")]
    NotFound(String),

    #[error("failed to spawn process '{name}': {reason}")]
    SpawnFailure { name: String, reason: String },

    #[error("deputy {address} is unreachable: {reason}")]
    DeputyUnreachable { address: String, reason: String },

    #[error("{0}")]
    Internal(String),
}

impl ProcmanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcmanError::Validation(_) => ErrorKind::Validation,
            ProcmanError::NotFound(_) => ErrorKind::NotFound,
            ProcmanError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            ProcmanError::DeputyUnreachable { .. } => ErrorKind::DeputyUnreachable,
            ProcmanError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn unreachable(address: &str, reason: impl Into<String>) -> Self {
        ProcmanError::DeputyUnreachable {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let (name, detail) = match self {
            ProcmanError::Validation(message) | ProcmanError::Internal(message) => {
                (None, Some(message.clone()))
            }
            ProcmanError::NotFound(name) => (Some(name.clone()), None),
            ProcmanError::SpawnFailure { name, reason } => (Some(name.clone()), Some(reason.clone())),
            ProcmanError::DeputyUnreachable { reason, .. } => (None, Some(reason.clone())),
        };
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            name,
            detail,
        }
    }

    /// Rebuild a typed error from a body received from `address`
    pub fn from_body(body: ErrorBody, address: &str) -> Self {
        let name = body.name.unwrap_or_default();
        let detail = body.detail.unwrap_or(body.message);
        match body.kind {
            ErrorKind::Validation => ProcmanError::Validation(detail),
            ErrorKind::NotFound => ProcmanError::NotFound(name),
            ErrorKind::SpawnFailure => ProcmanError::SpawnFailure { name, reason: detail },
            ErrorKind::DeputyUnreachable => ProcmanError::unreachable(address, detail),
            ErrorKind::Internal => ProcmanError::Internal(detail),
        }
    }
}

impl ResponseError for ProcmanError {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::SpawnFailure => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::DeputyUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_body())
    }
}
