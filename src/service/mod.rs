use crate::domain::Digest;
use axum::http::HeaderName;

pub mod auth;
pub mod blob;
pub mod manifest;
pub mod upload;

pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
pub const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
pub const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

fn etag(digest: &Digest) -> String {
    format!("\"{digest}\"")
}

fn upload_location(name: &str, session_id: &str) -> String {
    format!("/v2/{name}/blobs/uploads/{session_id}")
}

fn blob_location(name: &str, digest: &Digest) -> String {
    format!("/v2/{name}/blobs/{digest}")
}

/// `Range` value for `received` bytes; an empty upload reports `0-0`.
fn received_range(received: u64) -> String {
    format!("0-{}", received.saturating_sub(1))
}
