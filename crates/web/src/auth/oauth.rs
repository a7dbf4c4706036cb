//! OAuth provider clients for Google, GitHub, and Discord.
//!
//! Provider credentials are read from the environment once at startup into a
//! `ProviderRegistry` and injected where needed; providers with missing
//! credentials are disabled rather than fatal.

use async_trait::async_trait;
use data_encoding::BASE64URL_NOPAD;
use linkbook_common::{Error, OAuthProvider, Result};
use serde::Deserialize;
use tracing::debug;

/// Client credentials for one provider
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// All configured OAuth providers
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    google: Option<ClientConfig>,
    github: Option<ClientConfig>,
    discord: Option<ClientConfig>,
    http: reqwest::Client,
}

/// Normalized identity claims fetched from a provider.
#[derive(Debug, Clone)]
pub struct OAuthUserInfo {
    pub provider: OAuthProvider,
    pub provider_id: String,
    pub email: Option<String>,
    /// Whether the provider itself asserts ownership of the email. Linking
    /// onto an existing account by email match requires this.
    pub email_verified: bool,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    /// Provider-native handle (github login, discord username), used for
    /// channel auto-provisioning.
    pub handle: Option<String>,
}

// ============================================================================
// Provider wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    id: String,
    email: Option<String>,
    #[serde(default)]
    verified_email: bool,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    global_name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    verified: bool,
    avatar: Option<String>,
}

// ============================================================================
// Registry
// ============================================================================

impl ProviderRegistry {
    /// Build from `LINKBOOK_{GOOGLE,GITHUB,DISCORD}_CLIENT_ID/_CLIENT_SECRET`.
    pub fn from_env() -> Self {
        fn load(prefix: &str) -> Option<ClientConfig> {
            let id = std::env::var(format!("LINKBOOK_{}_CLIENT_ID", prefix)).ok()?;
            let secret = std::env::var(format!("LINKBOOK_{}_CLIENT_SECRET", prefix)).ok()?;
            if id.trim().is_empty() || secret.trim().is_empty() {
                return None;
            }
            Some(ClientConfig {
                client_id: id,
                client_secret: secret,
            })
        }

        Self {
            google: load("GOOGLE"),
            github: load("GITHUB"),
            discord: load("DISCORD"),
            http: reqwest::Client::new(),
        }
    }

    pub fn is_configured(&self, provider: OAuthProvider) -> bool {
        self.config(provider).is_some()
    }

    fn config(&self, provider: OAuthProvider) -> Option<&ClientConfig> {
        match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::GitHub => self.github.as_ref(),
            OAuthProvider::Discord => self.discord.as_ref(),
        }
    }

    fn require_config(&self, provider: OAuthProvider) -> Result<&ClientConfig> {
        self.config(provider)
            .ok_or_else(|| Error::OAuthProvider(format!("{} provider not configured", provider)))
    }

    /// Build the authorization redirect URL. The `state` value is returned
    /// to the frontend through the provider redirect and checked there.
    pub fn authorize_url(&self, provider: OAuthProvider, redirect_uri: &str) -> Result<String> {
        let cfg = self.require_config(provider)?;
        let state = random_url_token();

        let url = match provider {
            OAuthProvider::Google => format!(
                "https://accounts.google.com/o/oauth2/v2/auth?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
                urlencoding::encode(&cfg.client_id),
                urlencoding::encode(redirect_uri),
                urlencoding::encode("openid email profile"),
                urlencoding::encode(&state),
            ),
            OAuthProvider::GitHub => format!(
                "https://github.com/login/oauth/authorize?client_id={}&redirect_uri={}&scope={}&state={}",
                urlencoding::encode(&cfg.client_id),
                urlencoding::encode(redirect_uri),
                urlencoding::encode("user:email"),
                urlencoding::encode(&state),
            ),
            OAuthProvider::Discord => format!(
                "https://discord.com/api/oauth2/authorize?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
                urlencoding::encode(&cfg.client_id),
                urlencoding::encode(redirect_uri),
                urlencoding::encode("identify email"),
                urlencoding::encode(&state),
            ),
        };
        Ok(url)
    }

    /// Exchange an authorization code for a provider access token.
    pub async fn exchange_code(
        &self,
        provider: OAuthProvider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<String> {
        let cfg = self.require_config(provider)?;
        let token_url = match provider {
            OAuthProvider::Google => "https://oauth2.googleapis.com/token",
            OAuthProvider::GitHub => "https://github.com/login/oauth/access_token",
            OAuthProvider::Discord => "https://discord.com/api/oauth2/token",
        };

        let resp = self
            .http
            .post(token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", cfg.client_id.as_str()),
                ("client_secret", cfg.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| Error::OAuthProvider(format!("token exchange failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::OAuthProvider(format!(
                "token exchange failed: {}",
                resp.status()
            )));
        }

        let tokens: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::OAuthProvider(format!("token response parse failed: {}", e)))?;
        tokens
            .access_token
            .ok_or_else(|| Error::OAuthProvider("no access token received".to_string()))
    }

    /// Fetch user identity claims from the provider's userinfo endpoint.
    pub async fn fetch_user_info(
        &self,
        provider: OAuthProvider,
        access_token: &str,
    ) -> Result<OAuthUserInfo> {
        match provider {
            OAuthProvider::Google => self.fetch_google(access_token).await,
            OAuthProvider::GitHub => self.fetch_github(access_token).await,
            OAuthProvider::Discord => self.fetch_discord(access_token).await,
        }
    }

    async fn fetch_google(&self, access_token: &str) -> Result<OAuthUserInfo> {
        let info: GoogleUserInfo = self
            .get_json("https://www.googleapis.com/oauth2/v2/userinfo", access_token)
            .await?;

        Ok(OAuthUserInfo {
            provider: OAuthProvider::Google,
            provider_id: info.id,
            username: info
                .name
                .clone()
                .or_else(|| info.email.as_deref().map(email_local_part)),
            email_verified: info.verified_email,
            email: info.email,
            first_name: info.given_name,
            last_name: info.family_name,
            display_name: info.name,
            avatar_url: info.picture,
            handle: None,
        })
    }

    async fn fetch_github(&self, access_token: &str) -> Result<OAuthUserInfo> {
        let user: GitHubUser = self.get_json("https://api.github.com/user", access_token).await?;

        // Primary email may be private and only visible via the emails API.
        let mut email = user.email.clone();
        let mut email_verified = false;
        match self
            .get_json::<Vec<GitHubEmail>>("https://api.github.com/user/emails", access_token)
            .await
        {
            Ok(emails) => {
                if let Some(primary) = emails.iter().find(|e| e.primary) {
                    email = Some(primary.email.clone());
                    email_verified = primary.verified;
                }
            }
            Err(e) => debug!("github emails lookup failed: {}", e),
        }

        let (first_name, last_name) = split_name(user.name.as_deref());
        Ok(OAuthUserInfo {
            provider: OAuthProvider::GitHub,
            provider_id: user.id.to_string(),
            email,
            email_verified,
            username: Some(user.login.clone()),
            first_name,
            last_name,
            display_name: user.name,
            avatar_url: user.avatar_url,
            handle: Some(user.login),
        })
    }

    async fn fetch_discord(&self, access_token: &str) -> Result<OAuthUserInfo> {
        let user: DiscordUser = self
            .get_json("https://discord.com/api/users/@me", access_token)
            .await?;

        let avatar_url = user.avatar.as_ref().map(|hash| {
            format!("https://cdn.discordapp.com/avatars/{}/{}.png", user.id, hash)
        });
        let display = user.global_name.clone().unwrap_or_else(|| user.username.clone());

        Ok(OAuthUserInfo {
            provider: OAuthProvider::Discord,
            provider_id: user.id,
            email: user.email,
            email_verified: user.verified,
            username: Some(user.username.clone()),
            first_name: Some(display.clone()),
            last_name: None,
            display_name: Some(display),
            avatar_url,
            handle: Some(user.username),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, "linkbook")
            .send()
            .await
            .map_err(|e| Error::OAuthProvider(format!("userinfo request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::OAuthProvider(format!(
                "userinfo request failed: {}",
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::OAuthProvider(format!("userinfo parse failed: {}", e)))
    }
}

/// Random url-safe token (state parameters, recovery tokens).
pub fn random_url_token() -> String {
    let bytes: [u8; 32] = rand::random();
    BASE64URL_NOPAD.encode(&bytes)
}

pub fn email_local_part(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

fn split_name(full: Option<&str>) -> (Option<String>, Option<String>) {
    match full {
        Some(name) if !name.trim().is_empty() => {
            let mut parts = name.trim().splitn(2, ' ');
            let first = parts.next().map(String::from);
            let last = parts.next().map(String::from);
            (first, last)
        }
        _ => (None, None),
    }
}

// ============================================================================
// Recovery-time provider verification
// ============================================================================

/// Verifies that a client-presented OAuth token actually belongs to the
/// provider identity linked to the account under recovery.
#[async_trait]
pub trait ProviderVerifier: Send + Sync {
    async fn verify(
        &self,
        provider: OAuthProvider,
        oauth_token: &str,
        expected_provider_id: &str,
    ) -> Result<bool>;
}

/// Default verifier: introspects the token against the provider's userinfo
/// endpoint and compares the subject id to the stored link.
pub struct UserinfoVerifier {
    registry: ProviderRegistry,
}

impl UserinfoVerifier {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ProviderVerifier for UserinfoVerifier {
    async fn verify(
        &self,
        provider: OAuthProvider,
        oauth_token: &str,
        expected_provider_id: &str,
    ) -> Result<bool> {
        let info = self.registry.fetch_user_info(provider, oauth_token).await?;
        Ok(info.provider_id == expected_provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(
            split_name(Some("Ada Lovelace")),
            (Some("Ada".to_string()), Some("Lovelace".to_string()))
        );
        assert_eq!(split_name(Some("Ada")), (Some("Ada".to_string()), None));
        assert_eq!(split_name(Some("  ")), (None, None));
        assert_eq!(split_name(None), (None, None));
    }

    #[test]
    fn test_email_local_part() {
        assert_eq!(email_local_part("ada@example.com"), "ada");
        assert_eq!(email_local_part("no-at-sign"), "no-at-sign");
    }

    #[test]
    fn test_random_url_token_is_url_safe() {
        let tok = random_url_token();
        assert!(tok.len() >= 40);
        assert!(tok.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_authorize_url_requires_config() {
        let registry = ProviderRegistry::default();
        let err = registry
            .authorize_url(OAuthProvider::Google, "http://localhost:3000/cb")
            .unwrap_err();
        assert!(matches!(err, Error::OAuthProvider(_)));
    }
}
