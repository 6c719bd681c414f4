use crate::domain::{Digest, Resolved};
use crate::error::AppError;
use crate::service::{DOCKER_CONTENT_DIGEST, etag};
use crate::utils::repo_identifier::RepoIdentifier;
use crate::utils::state::AppState;
use crate::utils::validation::is_valid_tag;
use axum::Json;
use axum::body::{self, Body};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use oci_spec::distribution::TagListBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// Largest manifest body accepted on push.
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

fn check_reference(reference: &str) -> Result<(), AppError> {
    if Digest::is_digest_syntax(reference) || is_valid_tag(reference) {
        Ok(())
    } else {
        Err(AppError::ManifestInvalid(format!(
            "Invalid reference format: {reference}"
        )))
    }
}

fn found_headers(resolved: &Resolved) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, resolved.content_type.clone()),
        (DOCKER_CONTENT_DIGEST, resolved.digest.to_string()),
        (header::ETAG, etag(&resolved.digest)),
    ]
}

/// Handles `GET /v2/<name>/manifests/<reference>`.
///
/// **Digest references** are served directly: `200 OK` with the stored bytes,
/// `Content-Type` set to the media type recorded at push time, plus
/// `Docker-Content-Digest` and a quoted-digest `ETag`. Digest lookups do not
/// check which repository the content was pushed to.
///
/// **Tag references** are never served inline. The tag is resolved and the
/// client is sent a `308 Permanent Redirect` to the absolute digest URL, so the
/// bytes a client ends up with are always tied to the digest it was told.
///
/// Unknown tags and digests yield `404` with `MANIFEST_UNKNOWN`.
pub async fn get_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    check_reference(&reference)?;

    let resolved = state.tags.resolve(&repo, &reference).await?;
    if Digest::is_digest_syntax(&reference) {
        // Any stored digest resolves here, including layers, so stream it.
        let (file, info) = state.content.open(&resolved.digest).await.map_err(|e| match e {
            AppError::BlobUnknown(_) => AppError::ManifestUnknown(reference.clone()),
            other => other,
        })?;
        return Ok((
            StatusCode::OK,
            found_headers(&resolved),
            [(header::CONTENT_LENGTH, info.size.to_string())],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response());
    }

    let location = state.config.manifest_url(&name, &resolved.digest.to_string());
    Ok((
        StatusCode::PERMANENT_REDIRECT,
        [
            (header::LOCATION, location),
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (DOCKER_CONTENT_DIGEST, resolved.digest.to_string()),
            (header::ETAG, etag(&resolved.digest)),
        ],
        "Redirected",
    )
        .into_response())
}

/// Handles `HEAD /v2/<name>/manifests/<reference>`.
///
/// Same lookup as `GET`, but tags are not redirected: a found reference is
/// answered with `200 OK`, the stored `Content-Length`, `Content-Type`,
/// `Docker-Content-Digest` and `ETag`, and no body.
pub async fn head_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    check_reference(&reference)?;

    let resolved = state.tags.resolve(&repo, &reference).await?;
    Ok((
        StatusCode::OK,
        found_headers(&resolved),
        [(header::CONTENT_LENGTH, resolved.size.to_string())],
        Body::empty(),
    )
        .into_response())
}

/// Handles `PUT /v2/<name>/manifests/<reference>`.
///
/// **Purpose:** Stores a manifest and, for tag references, points the tag at it.
///
/// **Behavior:**
/// - The body must be a JSON object no larger than [`MAX_MANIFEST_SIZE`].
/// - The media type comes from the `Content-Type` header, falling back to the
///   document's `mediaType` field and then to the OCI image manifest type.
/// - A digest reference must match the body's digest.
/// - Blobs referenced from the manifest are not checked here; a missing layer
///   is a pull-time problem.
/// - Returns `201 Created` with `Location` set to the canonical digest URL.
pub async fn put_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    check_reference(&reference)?;

    let body_bytes = body::to_bytes(request.into_body(), MAX_MANIFEST_SIZE)
        .await
        .map_err(|_| AppError::SizeInvalid(format!("manifest exceeds {MAX_MANIFEST_SIZE} bytes")))?;

    let document: serde_json::Value = serde_json::from_slice(&body_bytes)
        .map_err(|e| AppError::ManifestInvalid(e.to_string()))?;
    if !document.is_object() {
        return Err(AppError::ManifestInvalid(
            "manifest must be a JSON object".to_string(),
        ));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .or_else(|| document.get("mediaType").and_then(|v| v.as_str()))
        .unwrap_or(DEFAULT_MANIFEST_TYPE)
        .to_string();

    let digest = if Digest::is_digest_syntax(&reference) {
        let claimed: Digest = reference.parse()?;
        state
            .content
            .verify_and_put(&claimed, body_bytes, Some(&content_type))
            .await?
    } else {
        let digest = state.content.put(body_bytes, Some(&content_type)).await?;
        state
            .tags
            .upsert(&repo, &reference, &digest, &content_type)
            .await?;
        digest
    };

    tracing::info!(repository = %repo, reference = %reference, %digest, "manifest pushed");
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/manifests/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        Body::empty(),
    )
        .into_response())
}

/// Handles `GET /v2/<name>/tags/list`.
///
/// **Purpose:** Lists the tags of a repository, `{"name": ..., "tags": [...]}`.
///
/// **Pagination:** `n` caps the page size (absent or `0` means the server
/// maximum) and `last` is an exclusive cursor. Tags come back in case-folded
/// order. When more tags follow, a `Link: <...>; rel="next"` header carries the
/// URL of the next page.
///
/// A repository without any tag yields `404` with `NAME_UNKNOWN`; a cursor past
/// the end yields an empty list.
pub async fn get_tag_list_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let repo = RepoIdentifier::parse(&name)?;

    let limit = match params.get("n").map(String::as_str) {
        None | Some("") => 0,
        Some(n) => n
            .parse::<usize>()
            .map_err(|_| AppError::PaginationInvalid(n.to_string()))?,
    };
    let after = params.get("last").map(String::as_str).filter(|s| !s.is_empty());

    let page = state.tags.list_tags(&repo, limit, after).await?;

    let next_link = match page.tags.last() {
        Some(last) if page.has_more => {
            let n = if limit == 0 { page.tags.len() } else { limit };
            Some(format!(
                "<{}>; rel=\"next\"",
                state.config.tag_list_url(&name, n, last)
            ))
        }
        _ => None,
    };

    let tag_list = TagListBuilder::default()
        .name(repo.full_name())
        .tags(page.tags)
        .build()
        .map_err(|e| AppError::Others(e.to_string()))?;

    let mut response = Json(tag_list).into_response();
    if let Some(link) = next_link {
        let value = link
            .parse()
            .map_err(|_| AppError::Others(format!("unrepresentable Link header {link}")))?;
        response.headers_mut().insert(header::LINK, value);
    }
    Ok(response)
}

/// Handles `DELETE /v2/<name>/manifests/<reference>`.
///
/// - A tag reference removes only the tag; the manifest stays addressable by
///   digest.
/// - A digest reference removes the manifest content together with every tag
///   that points at it, so no tag is left dangling.
///
/// Returns `202 Accepted`, or `404 MANIFEST_UNKNOWN` if nothing matched.
pub async fn delete_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let repo = RepoIdentifier::parse(&name)?;
    check_reference(&reference)?;

    if Digest::is_digest_syntax(&reference) {
        let digest: Digest = reference.parse()?;
        state.content.delete(&digest).await.map_err(|e| match e {
            AppError::BlobUnknown(_) => AppError::ManifestUnknown(reference.clone()),
            other => other,
        })?;
    } else {
        state.tags.delete_tag(&repo, &reference).await?;
    }

    Ok(StatusCode::ACCEPTED)
}
