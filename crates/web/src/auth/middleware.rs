//! Bearer-token middleware for Axum.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use linkbook_common::User;

use crate::server::AppState;

/// Extension that holds the authenticated user
#[derive(Clone)]
pub struct CurrentUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(unauthorized)
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "Invalid or expired token"})),
    )
        .into_response()
}

/// Resolve the bearer token on a request to a User. All failures collapse to
/// 401 without revealing which check failed.
fn resolve_bearer(state: &AppState, auth_header: Option<&str>) -> Option<User> {
    let token = auth_header?.strip_prefix("Bearer ")?;
    let user_id = state.tokens.validate(token).ok()?;
    state.store.get_user(user_id).ok().flatten()
}

/// Middleware that requires a valid bearer token
pub async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let auth_header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match resolve_bearer(&state, auth_header) {
        Some(user) => {
            request.extensions_mut().insert(CurrentUser(user));
            next.run(request).await
        }
        None => unauthorized(),
    }
}
