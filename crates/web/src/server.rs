//! Web server assembly and configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use linkbook_common::{Database, OAuthProvider};

use crate::auth::{
    IdentityResolver, ProviderRegistry, ProviderVerifier, TokenService, UserinfoVerifier,
};
use crate::recovery::RecoveryEngine;
use crate::routes::api_router;
use crate::store::DirectoryDb;

const DEFAULT_TOKEN_TTL_SECS: i64 = 60 * 60 * 24 * 7; // 7 days

/// Server configuration, read from the environment in `from_env`.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub db_path: String,
    pub secret_key: String,
    pub token_ttl_secs: i64,
    pub frontend_url: String,
    pub public_url: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let db_path = std::env::var("LINKBOOK_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| {
                linkbook_common::default_db_path()
                    .to_string_lossy()
                    .to_string()
            });

        let secret_key = match std::env::var("LINKBOOK_SECRET_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                // Tokens from previous runs become invalid on restart.
                let key = crate::auth::oauth::random_url_token();
                warn!("LINKBOOK_SECRET_KEY not set, using a random signing key for this run");
                key
            }
        };

        let token_ttl_secs = std::env::var("LINKBOOK_TOKEN_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        let frontend_url = std::env::var("LINKBOOK_FRONTEND_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());
        let public_url = std::env::var("LINKBOOK_PUBLIC_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());

        Self {
            db_path,
            secret_key,
            token_ttl_secs,
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Shared application state, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub store: DirectoryDb,
    pub resolver: IdentityResolver,
    pub recovery: RecoveryEngine,
    pub oauth: ProviderRegistry,
    pub tokens: TokenService,
    pub frontend_url: String,
    pub public_url: String,
}

impl AppState {
    pub fn new(db: Database, cfg: &ServerConfig) -> linkbook_common::Result<Self> {
        let store = DirectoryDb::new(db);
        store.init_schema()?;

        let oauth = ProviderRegistry::from_env();
        let verifier: Arc<dyn ProviderVerifier> =
            Arc::new(UserinfoVerifier::new(oauth.clone()));

        Ok(Self {
            resolver: IdentityResolver::new(store.clone()),
            recovery: RecoveryEngine::new(store.clone(), verifier),
            tokens: TokenService::new(&cfg.secret_key, cfg.token_ttl_secs),
            oauth,
            store,
            frontend_url: cfg.frontend_url.clone(),
            public_url: cfg.public_url.clone(),
        })
    }

    /// The redirect URI registered with each provider.
    pub fn oauth_redirect_uri(&self, provider: OAuthProvider) -> String {
        format!("{}/oauth/{}/callback", self.public_url, provider)
    }
}

/// Start the web server
pub async fn serve(addr: SocketAddr, cfg: ServerConfig) -> anyhow::Result<()> {
    if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::open(&cfg.db_path)?;
    let state = AppState::new(db, &cfg)?;

    let app = api_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    info!("Linkbook API starting on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
