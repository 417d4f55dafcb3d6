use axum::{response::{IntoResponse, Response}, Json, http::StatusCode};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use std::fmt::{Display, Formatter};

/// Domain failures raised by the ledger, the patch pipeline and the site facade.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Patch already exists for {bench} by the filename {} and name {existing}", .filename.as_deref().unwrap_or("<none>"))]
    DuplicatePatch { bench: String, existing: String, filename: Option<String> },
    #[error("failed to fetch patch from {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("execution agent rejected {target}: {reason}")]
    UpstreamAgent { target: String, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self { Self::NotFound { entity, id: id.into() } }
    pub fn invalid(msg: impl Into<String>) -> Self { Self::InvalidArgument(msg.into()) }

    /// Stable machine-readable code, shared by the HTTP body and distribution reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::DuplicatePatch { .. } => "duplicate_patch",
            Self::Fetch { .. } => "fetch_error",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::UpstreamAgent { .. } => "upstream_agent_error",
            Self::Storage(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::DuplicatePatch { .. } => StatusCode::CONFLICT,
            Self::Fetch { .. } | Self::UpstreamAgent { .. } => StatusCode::BAD_GATEWAY,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self { Self::Storage(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody { pub code: &'static str, pub message: String }

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub code: &'static str, pub message: String }

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        if let Error::Storage(ref msg) = e { tracing::error!(error=%msg, "storage.failure"); }
        Self::new(e.status(), e.code(), e.to_string())
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.code, self.message) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { code: self.code, message: self.message };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_patch_message_names_existing_entity() {
        let e = Error::DuplicatePatch { bench: "b1".into(), existing: "b1-p".into(), filename: Some("fix.patch".into()) };
        assert_eq!(e.to_string(), "Patch already exists for b1 by the filename fix.patch and name b1-p");
        let api: ApiError = e.into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.code, "duplicate_patch");
    }

    #[test]
    fn fetch_failure_maps_to_bad_gateway() {
        let e = Error::Fetch { url: "http://x".into(), reason: "timeout".into() };
        assert_eq!(e.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(e.code(), "fetch_error");
    }
}
