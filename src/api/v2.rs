use crate::api::middleware::authenticate;
use crate::error::AppError;
use crate::service::DOCKER_DISTRIBUTION_API_VERSION;
use crate::service::blob::{
    delete_blob_handler, delete_upload_handler, get_blob_handler, get_blob_status_handler,
    head_blob_handler, patch_blob_handler, post_blob_handler, put_blob_handler,
};
use crate::service::manifest::{
    delete_manifest_handler, get_manifest_handler, get_tag_list_handler, head_manifest_handler,
    put_manifest_handler,
};
use crate::utils::state::AppState;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Router, middleware};
use std::collections::HashMap;
use std::sync::Arc;

pub fn create_v2_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // Determine support
        .route("/v2", get(version_check))
        .route("/v2/", get(version_check))
        .route("/v2/{*tail}", any(dispatch_handler))
        .route_layer(middleware::from_fn_with_state(state, authenticate))
}

async fn version_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(DOCKER_DISTRIBUTION_API_VERSION, "registry/2.0")],
        "OK",
    )
}

fn method_not_allowed() -> Result<Response, AppError> {
    Ok((StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response())
}

async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Path(tail): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    let method = request.method().clone();
    let segments: Vec<&str> = tail.split('/').collect();

    match segments.as_slice() {
        // tail: /{name}/manifests/{reference}
        [name @ .., "manifests", reference] if !name.is_empty() => {
            let path = Path((name.join("/"), reference.to_string()));
            match method {
                // Pull manifests
                Method::GET => get_manifest_handler(State(state), path).await,
                // Check if manifest exists in the registry
                Method::HEAD => head_manifest_handler(State(state), path).await,
                // Push Manifests
                Method::PUT => put_manifest_handler(State(state), path, headers, request).await,
                // Delete manifests or tags
                Method::DELETE => delete_manifest_handler(State(state), path)
                    .await
                    .map(IntoResponse::into_response),
                _ => method_not_allowed(),
            }
        }
        // tail: /{name}/blobs/{digest}
        [name @ .., "blobs", digest] if !name.is_empty() && *digest != "uploads" => {
            let path = Path((name.join("/"), digest.to_string()));
            match method {
                // Pull blobs
                Method::GET => get_blob_handler(State(state), path).await,
                // Check if blob exists in the registry
                Method::HEAD => head_blob_handler(State(state), path).await,
                // Delete blobs
                Method::DELETE => delete_blob_handler(State(state), path)
                    .await
                    .map(IntoResponse::into_response),
                _ => method_not_allowed(),
            }
        }
        // tail: /{name}/blobs/uploads/
        [name @ .., "blobs", "uploads", session_id]
            if !name.is_empty() && session_id.is_empty() =>
        {
            if method == Method::POST {
                // Open a blob upload session
                post_blob_handler(State(state), Path(name.join("/")), Query(params), request).await
            } else {
                method_not_allowed()
            }
        }
        // tail: /{name}/blobs/uploads/{session_id}
        [name @ .., "blobs", "uploads", session_id] if !name.is_empty() => {
            let path = Path((name.join("/"), session_id.to_string()));
            match method {
                // Push a blob in chunks
                Method::PATCH => patch_blob_handler(State(state), path, headers, request).await,
                // Close a blob upload session
                Method::PUT => put_blob_handler(State(state), path, Query(params), request).await,
                // Get the status of a blob upload session
                Method::GET => get_blob_status_handler(State(state), path).await,
                // Cancel a blob upload session
                Method::DELETE => delete_upload_handler(State(state), path)
                    .await
                    .map(IntoResponse::into_response),
                _ => method_not_allowed(),
            }
        }
        // tail: /{name}/tags/list
        [name @ .., "tags", "list"] if !name.is_empty() => {
            if method == Method::GET {
                // List tags
                get_tag_list_handler(State(state), Path(name.join("/")), Query(params)).await
            } else {
                method_not_allowed()
            }
        }
        _ => Ok((StatusCode::NOT_FOUND, "not found").into_response()),
    }
}
