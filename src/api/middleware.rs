use crate::error::AppError;
use crate::utils::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use std::sync::Arc;

/// The user a request was authenticated as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal(pub String);

/// Requires HTTP Basic credentials whenever a credential store is configured.
/// Without one every request passes through anonymously.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(authenticator) = state.authenticator.clone() else {
        return Ok(next.run(req).await);
    };
    let realm = state.config.realm.clone();

    let credentials = req
        .headers()
        .typed_get::<Authorization<Basic>>()
        .ok_or_else(|| AppError::NoLogin {
            realm: realm.clone(),
        })?;
    let username = credentials.username().to_string();
    let password = credentials.password().to_string();

    // bcrypt verification is deliberately slow; keep it off the async workers.
    let user = username.clone();
    let matched = tokio::task::spawn_blocking(move || authenticator.matches(&user, &password))
        .await
        .map_err(|e| AppError::Others(format!("credential check failed: {e}")))?;
    if !matched {
        tracing::warn!(%username, "rejected credentials");
        return Err(AppError::InvalidLogin { realm });
    }

    tracing::debug!(%username, "authenticated");
    req.extensions_mut().insert(Principal(username));
    Ok(next.run(req).await)
}
