use crate::domain::DigestError;
use crate::service::DOCKER_UPLOAD_UUID;
use axum::Json;
use axum::body::Body;
use axum::http::header::{LOCATION, RANGE, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use oci_spec::distribution::ErrorCode;
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// One entry of the OCI error body.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorInfo {
    code: ErrorCode,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    errors: Vec<ErrorInfo>,
}

#[derive(Error, Debug)]
pub enum AppError {
    // OCI Specific Errors (with context)
    #[error("Blob unknown: {0}")]
    BlobUnknown(String), // Contains the digest

    #[error("Blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    #[error("Blob upload unknown: {0}")]
    BlobUploadUnknown(String), // Contains the session ID

    #[error("Upload session {0} is closed")]
    SessionClosed(String),

    #[error("Upload session {0} already has an active writer")]
    SessionBusy(String),

    #[error("Digest invalid: {0}")]
    DigestInvalid(String),

    #[error("Digest mismatch: claimed {claimed}, computed {computed}")]
    DigestMismatch { claimed: String, computed: String },

    #[error("Manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("Manifest unknown: {0}")]
    ManifestUnknown(String), // Contains the reference (tag or digest)

    #[error("Invalid repository name: {0}")]
    NameInvalid(String),

    #[error("Repository not known to registry: {0}")]
    NameUnknown(String),

    #[error("Reference points at unknown content: {0}")]
    InvalidReference(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("Invalid content size: {0}")]
    SizeInvalid(String),

    #[error("Invalid pagination parameter: {0}")]
    PaginationInvalid(String),

    #[error("Content-Range header is invalid: {0}")]
    ContentRangeInvalid(String),

    #[error("Range not satisfiable for upload {session_id}")]
    RangeNotSatisfiable {
        session_id: String,
        name: String,
        current_size: u64,
    },

    // --- Auth Errors ---
    #[error("no credentials provided")]
    NoLogin { realm: String },

    #[error("invalid credentials")]
    InvalidLogin { realm: String },

    // Internal Errors
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Axum error: {0}")]
    Axum(#[from] axum::Error),

    #[error("{0}")]
    Others(String),
}

impl AppError {
    /// A stored row that no longer parses; never expected outside of manual
    /// database edits.
    pub fn corrupt_row(err: impl Display) -> Self {
        AppError::Others(format!("corrupt database row: {err}"))
    }

    /// Translates storage-engine failures, turning unique-constraint
    /// violations into [`AppError::Duplicate`].
    pub fn from_db(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Duplicate(what.into()),
            _ => AppError::Sqlx(err),
        }
    }

    fn status_and_info(&self) -> (StatusCode, ErrorInfo) {
        match self {
            Self::BlobUnknown(digest) => (
                StatusCode::NOT_FOUND,
                oci_error(ErrorCode::BlobUnknown, "blob unknown to registry", json!({ "digest": digest })),
            ),
            Self::BlobUploadInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::BlobUploadInvalid, msg, NO_DETAILS),
            ),
            Self::BlobUploadUnknown(session_id) => (
                StatusCode::NOT_FOUND,
                oci_error(ErrorCode::BlobUploadUnknown, "blob upload unknown to registry", json!({ "session_id": session_id })),
            ),
            Self::SessionClosed(session_id) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::BlobUploadInvalid, "blob upload is already closed", json!({ "session_id": session_id })),
            ),
            Self::SessionBusy(session_id) => (
                StatusCode::CONFLICT,
                oci_error(ErrorCode::BlobUploadInvalid, "blob upload is being written by another request", json!({ "session_id": session_id })),
            ),
            Self::DigestInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::DigestInvalid, "provided digest is invalid", json!({ "reason": msg })),
            ),
            Self::DigestMismatch { claimed, computed } => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::DigestInvalid, "provided digest did not match uploaded content", json!({ "claimed": claimed, "computed": computed })),
            ),
            Self::ManifestInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::ManifestInvalid, "manifest invalid", json!({ "reason": msg })),
            ),
            Self::ManifestUnknown(reference) => (
                StatusCode::NOT_FOUND,
                oci_error(ErrorCode::ManifestUnknown, "manifest unknown", json!({ "reference": reference })),
            ),
            Self::NameInvalid(name) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::NameInvalid, "invalid repository name", json!({ "name": name })),
            ),
            Self::NameUnknown(name) => (
                StatusCode::NOT_FOUND,
                oci_error(ErrorCode::NameUnknown, format!("repository named {name} cannot be found"), json!({ "name": name })),
            ),
            Self::InvalidReference(digest) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::ManifestInvalid, "tag points at unknown content", json!({ "digest": digest })),
            ),
            Self::Duplicate(what) => (
                StatusCode::CONFLICT,
                oci_error(ErrorCode::Denied, "resource already exists", json!({ "resource": what })),
            ),
            Self::SizeInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::SizeInvalid, msg, NO_DETAILS),
            ),
            Self::PaginationInvalid(value) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::Unsupported, "invalid pagination parameter", json!({ "n": value })),
            ),
            Self::ContentRangeInvalid(reason) => (
                StatusCode::BAD_REQUEST,
                oci_error(ErrorCode::BlobUploadInvalid, "Content-Range header is invalid", json!({ "reason": reason })),
            ),
            Self::NoLogin { .. } => (
                StatusCode::UNAUTHORIZED,
                oci_error(ErrorCode::Denied, "Please provide username and password", NO_DETAILS),
            ),
            Self::InvalidLogin { .. } => (
                StatusCode::UNAUTHORIZED,
                oci_error(ErrorCode::Denied, "Username or password is incorrect", NO_DETAILS),
            ),
            Self::RangeNotSatisfiable { .. }
            | Self::Sqlx(_)
            | Self::Migration(_)
            | Self::Io(_)
            | Self::Axum(_)
            | Self::Others(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                oci_error(ErrorCode::Unsupported, "an internal server error occurred", NO_DETAILS),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Self::RangeNotSatisfiable {
            session_id,
            name,
            current_size,
        } = self
        {
            tracing::debug!(%session_id, current_size, "rejecting out-of-order chunk");
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [
                    (LOCATION, format!("/v2/{name}/blobs/uploads/{session_id}")),
                    (RANGE, format!("0-{}", current_size.saturating_sub(1))),
                    (DOCKER_UPLOAD_UUID, session_id),
                ],
                Body::empty(),
            )
                .into_response();
        }

        let (status_code, error_info) = self.status_and_info();
        if status_code.is_server_error() {
            tracing::error!("Generating response for AppError: {:?}", self);
        } else {
            tracing::debug!("Generating response for AppError: {}", self);
        }

        let body = Json(ErrorResponse {
            errors: vec![error_info],
        });

        match self {
            Self::NoLogin { realm } | Self::InvalidLogin { realm } => {
                let challenge = format!(r#"Basic realm="{realm}", charset="UTF-8""#);
                match HeaderValue::from_str(&challenge) {
                    Ok(challenge) => (status_code, [(WWW_AUTHENTICATE, challenge)], body).into_response(),
                    Err(_) => (status_code, body).into_response(),
                }
            }
            _ => (status_code, body).into_response(),
        }
    }
}

impl From<DigestError> for AppError {
    fn from(err: DigestError) -> Self {
        AppError::DigestInvalid(err.to_string())
    }
}

const NO_DETAILS: Option<serde_json::Value> = None;

fn oci_error(
    code: ErrorCode,
    message: impl Into<String>,
    details: impl Into<Option<serde_json::Value>>,
) -> ErrorInfo {
    ErrorInfo {
        code,
        message: message.into(),
        details: details.into(),
    }
}
