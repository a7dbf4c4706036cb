//! Linkbook API routes
//!
//! All HTTP endpoints in one place:
//! - Password and OAuth authentication
//! - Account recovery
//! - Profile, channel and group management
//! - Contact graph and public profiles

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{info, warn};

use linkbook_common::{
    Channel, ChannelType, Error, Group, OAuthProvider, PublicUser, UserView,
};

use crate::auth::{require_auth, CurrentUser, RegisterRequest};
use crate::server::AppState;
use crate::store::{ChannelUpdate, GroupUpdate, ProfileUpdate};

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
}

impl TokenResponse {
    fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecoverRequest {
    email: String,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    email: String,
    method: String,
    code: Option<String>,
    oauth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    access_token: String,
    token_type: &'static str,
    message: &'static str,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: String,
}

#[derive(Debug, Deserialize)]
struct CreateChannelRequest {
    #[serde(rename = "type")]
    channel_type: String,
    value: String,
    label: Option<String>,
    #[serde(default)]
    is_public: Option<bool>,
    #[serde(default)]
    is_primary: Option<bool>,
    #[serde(default)]
    sort_order: Option<i64>,
    #[serde(default)]
    group_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    description: Option<String>,
    #[serde(default)]
    sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct PublicProfileResponse {
    user: PublicUser,
    channels: Vec<Channel>,
    groups: Vec<Group>,
}

// ============================================================================
// Error mapping
// ============================================================================

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::AuthFailed | Error::InvalidToken | Error::TokenExpired => StatusCode::UNAUTHORIZED,
        Error::UserNotFound
        | Error::ChannelNotFound
        | Error::GroupNotFound
        | Error::TargetNotFound => StatusCode::NOT_FOUND,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let status = status_for(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("request failed: {}", e);
        // Internal details stay in the log.
        return (
            status,
            Json(serde_json::json!({ "error": "Internal server error" })),
        )
            .into_response();
    }
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

/// Recovery endpoints report every client-side failure as 400, including an
/// unknown email, so the response shape stays uniform for the frontend.
fn recovery_error_response(e: Error) -> Response {
    if e.is_client_error() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }
    error_response(e)
}

// ============================================================================
// Router
// ============================================================================

pub fn api_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/me", get(me_handler))
        .route("/auth/profile", put(update_profile_handler))
        .route("/auth/security", get(security_handler))
        .route(
            "/channels",
            get(list_channels_handler).post(create_channel_handler),
        )
        .route(
            "/channels/:id",
            get(get_channel_handler)
                .put(update_channel_handler)
                .delete(delete_channel_handler),
        )
        .route(
            "/groups",
            get(list_groups_handler).post(create_group_handler),
        )
        .route(
            "/groups/:id",
            get(get_group_handler)
                .put(update_group_handler)
                .delete(delete_group_handler),
        )
        .route("/contacts", get(list_contacts_handler))
        .route("/contacts/search", get(search_users_handler))
        .route("/contacts/add/:id", post(add_contact_handler))
        .route("/contacts/remove/:id", delete(remove_contact_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/recover", post(recover_handler))
        .route("/auth/verify", post(verify_handler))
        .route("/oauth/:provider", get(oauth_authorize_handler))
        .route("/oauth/:provider/callback", get(oauth_callback_handler))
        .route("/public/:username", get(public_profile_handler))
        .merge(protected)
        .with_state(state)
}

// ============================================================================
// Health
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": linkbook_common::VERSION,
    }))
}

// ============================================================================
// Password auth handlers
// ============================================================================

async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let user = match state.resolver.register(&req) {
        Ok(u) => u,
        Err(e) => return error_response(e),
    };
    info!(user_id = user.id, username = %user.username, "registered new account");
    match state.tokens.issue(user.id) {
        Ok(token) => {
            (StatusCode::CREATED, Json(TokenResponse::bearer(token))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Response {
    let user = match state.resolver.authenticate(&req.email, &req.password) {
        Ok(u) => u,
        Err(e) => return error_response(e),
    };
    match state.tokens.issue(user.id) {
        Ok(token) => Json(TokenResponse::bearer(token)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn me_handler(CurrentUser(user): CurrentUser) -> Response {
    Json(UserView::from(&user)).into_response()
}

async fn update_profile_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(update): Json<ProfileUpdate>,
) -> Response {
    match state.store.update_profile(user.id, &update) {
        Ok(updated) => Json(UserView::from(&updated)).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Recovery handlers
// ============================================================================

async fn recover_handler(
    State(state): State<AppState>,
    Json(req): Json<RecoverRequest>,
) -> Response {
    match state.recovery.start_recovery(&req.email) {
        Ok(start) => Json(start).into_response(),
        Err(e) => recovery_error_response(e),
    }
}

async fn verify_handler(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Response {
    let user = match state
        .recovery
        .verify_recovery(
            &req.email,
            &req.method,
            req.code.as_deref(),
            req.oauth_token.as_deref(),
        )
        .await
    {
        Ok(u) => u,
        Err(e) => return recovery_error_response(e),
    };
    info!(user_id = user.id, method = %req.method, "account recovery verified");
    match state.tokens.issue(user.id) {
        Ok(token) => Json(VerifyResponse {
            access_token: token,
            token_type: "bearer",
            message: "Recovery successful",
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn security_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Response {
    Json(state.recovery.security_info(&user)).into_response()
}

// ============================================================================
// OAuth handlers
// ============================================================================

fn parse_provider(raw: &str) -> Result<OAuthProvider, Response> {
    OAuthProvider::from_str(raw).map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Unknown provider '{}'", raw) })),
        )
            .into_response()
    })
}

async fn oauth_authorize_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let redirect_uri = state.oauth_redirect_uri(provider);
    match state.oauth.authorize_url(provider, &redirect_uri) {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => error_response(e),
    }
}

async fn oauth_callback_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let redirect_uri = state.oauth_redirect_uri(provider);
    let result = async {
        let access_token = state
            .oauth
            .exchange_code(provider, &query.code, &redirect_uri)
            .await?;
        let info = state.oauth.fetch_user_info(provider, &access_token).await?;
        let user = state.resolver.resolve_oauth_user(&info)?;
        state.resolver.provision_oauth_channels(&user, &info);
        state.tokens.issue(user.id)
    }
    .await;

    match result {
        Ok(token) => {
            let url = format!(
                "{}/auth/callback/{}?token={}",
                state.frontend_url,
                provider,
                urlencoding::encode(&token)
            );
            Redirect::temporary(&url).into_response()
        }
        Err(e) => {
            warn!(provider = %provider, "oauth callback failed: {}", e);
            let url = format!(
                "{}/auth/callback/{}?error={}",
                state.frontend_url,
                provider,
                urlencoding::encode(&e.to_string())
            );
            Redirect::temporary(&url).into_response()
        }
    }
}

// ============================================================================
// Channel handlers
// ============================================================================

async fn list_channels_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Response {
    match state.store.list_channels(user.id) {
        Ok(channels) => Json(channels).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_channel_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateChannelRequest>,
) -> Response {
    let channel_type = match ChannelType::from_str(&req.channel_type) {
        Ok(t) => t,
        Err(_) => {
            return error_response(Error::InvalidInput(format!(
                "Unknown channel type '{}'",
                req.channel_type
            )))
        }
    };
    if req.value.trim().is_empty() {
        return error_response(Error::InvalidInput(
            "Channel value must not be empty".to_string(),
        ));
    }
    match state.store.create_channel(
        user.id,
        channel_type,
        &req.value,
        req.label.as_deref(),
        req.is_public.unwrap_or(true),
        req.is_primary.unwrap_or(false),
        req.sort_order.unwrap_or(0),
        &req.group_ids,
    ) {
        Ok(channel) => (StatusCode::CREATED, Json(channel)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Look up a channel by id, collapsing "not yours" into "not found".
fn owned_channel(state: &AppState, user_id: i64, id: i64) -> Result<Channel, Error> {
    match state.store.get_channel(id)? {
        Some(c) if c.user_id == user_id => Ok(c),
        _ => Err(Error::ChannelNotFound),
    }
}

async fn get_channel_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Response {
    match owned_channel(&state, user.id, id) {
        Ok(channel) => Json(channel).into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_channel_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(update): Json<ChannelUpdate>,
) -> Response {
    let channel = match owned_channel(&state, user.id, id) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    match state.store.update_channel(&channel, &update) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_channel_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Response {
    if let Err(e) = owned_channel(&state, user.id, id) {
        return error_response(e);
    }
    match state.store.delete_channel(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Group handlers
// ============================================================================

async fn list_groups_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Response {
    match state.store.list_groups(user.id) {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_group_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateGroupRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return error_response(Error::InvalidInput(
            "Group name must not be empty".to_string(),
        ));
    }
    match state.store.create_group(
        user.id,
        &req.name,
        req.description.as_deref(),
        req.sort_order.unwrap_or(0),
    ) {
        Ok(group) => (StatusCode::CREATED, Json(group)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_group_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Response {
    match state.store.get_group(id, user.id) {
        Ok(Some(group)) => Json(group).into_response(),
        Ok(None) => error_response(Error::GroupNotFound),
        Err(e) => error_response(e),
    }
}

async fn update_group_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(update): Json<GroupUpdate>,
) -> Response {
    let group = match state.store.get_group(id, user.id) {
        Ok(Some(g)) => g,
        Ok(None) => return error_response(Error::GroupNotFound),
        Err(e) => return error_response(e),
    };
    match state.store.update_group(&group, &update) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_group_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Response {
    match state.store.get_group(id, user.id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(Error::GroupNotFound),
        Err(e) => return error_response(e),
    }
    match state.store.delete_group(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Contact handlers
// ============================================================================

const DEFAULT_SEARCH_LIMIT: i64 = 20;
const MAX_SEARCH_LIMIT: i64 = 100;

async fn list_contacts_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Response {
    match state.store.list_contacts(user.id) {
        Ok(contacts) => Json(contacts).into_response(),
        Err(e) => error_response(e),
    }
}

async fn search_users_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<SearchQuery>,
) -> Response {
    let q = query.q.trim();
    if q.is_empty() {
        return Json(Vec::<crate::store::SearchHit>::new()).into_response();
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);
    match state.store.search_users(user.id, q, limit) {
        Ok(hits) => Json(hits).into_response(),
        Err(e) => error_response(e),
    }
}

async fn add_contact_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Response {
    match state.store.add_contact(user.id, id) {
        Ok(contact) => (StatusCode::CREATED, Json(contact)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_contact_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Response {
    match state.store.remove_contact(user.id, id) {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Public profile
// ============================================================================

async fn public_profile_handler(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Response {
    let user = match state.store.get_user_by_username(&username) {
        Ok(Some(u)) => u,
        Ok(None) => return error_response(Error::UserNotFound),
        Err(e) => return error_response(e),
    };
    let channels = match state.store.list_public_channels(user.id) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    let groups = match state.store.list_groups(user.id) {
        Ok(g) => g,
        Err(e) => return error_response(e),
    };
    Json(PublicProfileResponse {
        user: PublicUser::from(&user),
        channels,
        groups,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::AuthFailed), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&Error::TokenExpired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&Error::UserNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::ChannelNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::DuplicateEmail), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::DuplicateGroupName),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&Error::InvalidOtp), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
