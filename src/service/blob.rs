use crate::domain::Digest;
use crate::error::AppError;
use crate::service::{
    DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, blob_location, etag, received_range,
    upload_location,
};
use crate::utils::repo_identifier::RepoIdentifier;
use crate::utils::state::AppState;
use crate::utils::validation::is_valid_range;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderMap, LOCATION, RANGE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

const OCTET_STREAM: &str = "application/octet-stream";

fn parse_digest(digest: &str) -> Result<Digest, AppError> {
    Ok(digest.parse()?)
}

fn digest_param(params: &HashMap<String, String>) -> Result<Option<Digest>, AppError> {
    params.get("digest").map(|d| parse_digest(d)).transpose()
}

/// GET /v2/<name>/blobs/<digest>
pub async fn get_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest_str)): Path<(String, String)>,
) -> Result<Response, AppError> {
    RepoIdentifier::parse(&name)?;
    let digest = parse_digest(&digest_str)?;

    let (file, info) = state.content.open(&digest).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, OCTET_STREAM.to_string()),
            (header::CONTENT_LENGTH, info.size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::ETAG, etag(&digest)),
        ],
        body,
    )
        .into_response())
}

/// HEAD /v2/<name>/blobs/<digest>
pub async fn head_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest_str)): Path<(String, String)>,
) -> Result<Response, AppError> {
    RepoIdentifier::parse(&name)?;
    let digest = parse_digest(&digest_str)?;

    let info = state
        .content
        .stat(&digest)
        .await?
        .ok_or_else(|| AppError::BlobUnknown(digest_str.clone()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, OCTET_STREAM.to_string()),
            (header::CONTENT_LENGTH, info.size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::ETAG, etag(&digest)),
        ],
        Body::empty(),
    )
        .into_response())
}

/// DELETE /v2/<name>/blobs/<digest>
pub async fn delete_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest_str)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    RepoIdentifier::parse(&name)?;
    let digest = parse_digest(&digest_str)?;
    state.content.delete(&digest).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /v2/<name>/blobs/uploads/
///
/// Opens an upload session. With `?digest=` the request body is the whole blob
/// and the session is committed in the same request.
pub async fn post_blob_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    let claimed = digest_param(&params)?;
    let session = state.uploads.initiate(&repo).await;

    if let Some(claimed) = claimed {
        let body = request.into_body().into_data_stream();
        let digest = state
            .uploads
            .commit(&session.id, &repo, &claimed, Some(body))
            .await?;
        return Ok((
            StatusCode::CREATED,
            [
                (LOCATION, blob_location(&name, &digest)),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
            ],
            Body::empty(),
        )
            .into_response());
    }

    Ok((
        StatusCode::ACCEPTED,
        [
            (LOCATION, upload_location(&name, &session.id)),
            (RANGE, received_range(0)),
            (DOCKER_UPLOAD_UUID, session.id),
        ],
        Body::empty(),
    )
        .into_response())
}

/// PATCH /v2/<name>/blobs/uploads/<session_id>
pub async fn patch_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, session_id)): Path<(String, String)>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    let offset = parse_content_range(&headers)?.map(|(start, _)| start);

    let body = request.into_body().into_data_stream();
    let status = state
        .uploads
        .append(&session_id, &repo, body, offset)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        [
            (LOCATION, upload_location(&name, &session_id)),
            (RANGE, received_range(status.bytes_received)),
            (DOCKER_UPLOAD_UUID, session_id),
        ],
        Body::empty(),
    )
        .into_response())
}

/// PUT /v2/<name>/blobs/uploads/<session_id>?digest=<digest>
pub async fn put_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, session_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    let claimed = digest_param(&params)?.ok_or_else(|| {
        AppError::DigestInvalid("digest query parameter is required to finalize upload".to_string())
    })?;

    let body = request.into_body().into_data_stream();
    let digest = state
        .uploads
        .commit(&session_id, &repo, &claimed, Some(body))
        .await?;

    Ok((
        StatusCode::CREATED,
        [
            (LOCATION, blob_location(&name, &digest)),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        Body::empty(),
    )
        .into_response())
}

/// GET /v2/<name>/blobs/uploads/<session_id>
pub async fn get_blob_status_handler(
    State(state): State<Arc<AppState>>,
    Path((name, session_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    let status = state.uploads.status(&session_id, &repo).await?;
    if status.status.is_terminal() {
        return Err(AppError::SessionClosed(session_id));
    }

    Ok((
        StatusCode::NO_CONTENT,
        [
            (LOCATION, upload_location(&name, &session_id)),
            (RANGE, received_range(status.bytes_received)),
            (DOCKER_UPLOAD_UUID, session_id),
        ],
        Body::empty(),
    )
        .into_response())
}

/// DELETE /v2/<name>/blobs/uploads/<session_id>
pub async fn delete_upload_handler(
    State(state): State<Arc<AppState>>,
    Path((name, session_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    state.uploads.cancel(&session_id, &repo).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reads an optional `Content-Range: <start>-<end>` header.
fn parse_content_range(headers: &HeaderMap) -> Result<Option<(u64, u64)>, AppError> {
    let Some(range_header) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let range = range_header
        .to_str()
        .map_err(|_| AppError::ContentRangeInvalid("Not valid ASCII".to_string()))?;
    if !is_valid_range(range) {
        return Err(AppError::ContentRangeInvalid(format!("Invalid format: {range}")));
    }

    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| AppError::ContentRangeInvalid("Invalid format".to_string()))?;
    let start: u64 = start
        .parse()
        .map_err(|_| AppError::ContentRangeInvalid("Failed to parse start offset".to_string()))?;
    let end: u64 = end
        .parse()
        .map_err(|_| AppError::ContentRangeInvalid("Failed to parse end offset".to_string()))?;
    if start > end {
        return Err(AppError::ContentRangeInvalid(
            "Start offset cannot be greater than end offset".to_string(),
        ));
    }

    if let Some(content_length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if content_length != end - start + 1 {
            return Err(AppError::SizeInvalid(
                "Content-Length does not match Content-Range".to_string(),
            ));
        }
    }

    Ok(Some((start, end)))
}
