//! Identity resolution: registration, password login, and federated login.
//!
//! OAuth resolution is idempotent by design: repeated callbacks with the
//! same (provider, provider_id) land on the same account without retries.

use linkbook_common::{ChannelType, Error, OAuthProvider, Result, User};
use serde::Deserialize;
use tracing::{debug, warn};

use super::oauth::{email_local_part, OAuthUserInfo};
use super::password::{burn_verification, hash_password, verify_password};
use crate::store::{DirectoryDb, NewUser};

const OAUTH_GROUP_NAME: &str = "OAuth";

/// Registration payload
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

#[derive(Clone)]
pub struct IdentityResolver {
    db: DirectoryDb,
}

impl IdentityResolver {
    pub fn new(db: DirectoryDb) -> Self {
        Self { db }
    }

    /// Create a password account. Duplicate email/username is pre-checked
    /// for the error message; the SQL constraint remains the final arbiter.
    pub fn register(&self, req: &RegisterRequest) -> Result<User> {
        validate_email(&req.email)?;
        validate_username(&req.username)?;
        validate_password(&req.password)?;

        if self.db.get_user_by_email(&req.email)?.is_some() {
            return Err(Error::DuplicateEmail);
        }
        if self.db.get_user_by_username(&req.username)?.is_some() {
            return Err(Error::DuplicateUsername);
        }

        self.db.create_user(&NewUser {
            email: req.email.clone(),
            username: req.username.clone(),
            password_hash: Some(hash_password(&req.password)?),
            display_name: req.display_name.clone(),
            first_name: req.first_name.clone(),
            last_name: req.last_name.clone(),
            avatar_url: req.avatar_url.clone(),
            bio: req.bio.clone(),
            ..Default::default()
        })
    }

    /// Password login. Unknown email and wrong password fail identically,
    /// and the hash verification runs either way so timing matches too.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        match self.db.get_user_by_email(email)? {
            Some(user) => {
                let hash = user.password_hash.as_deref().unwrap_or("");
                if verify_password(password, hash) {
                    Ok(user)
                } else {
                    Err(Error::AuthFailed)
                }
            }
            None => {
                burn_verification(password);
                Err(Error::AuthFailed)
            }
        }
    }

    /// Three-way OAuth resolution:
    /// 1. provider id already linked -> that account, unchanged;
    /// 2. email matches an existing account -> link the provider id onto it,
    ///    but only when the provider asserts a verified email;
    /// 3. otherwise -> create a fresh passwordless account.
    pub fn resolve_oauth_user(&self, info: &OAuthUserInfo) -> Result<User> {
        if let Some(user) = self.db.get_user_by_provider_id(info.provider, &info.provider_id)? {
            return Ok(user);
        }

        if let Some(email) = &info.email {
            if let Some(user) = self.db.get_user_by_email(email)? {
                if !info.email_verified {
                    return Err(Error::OAuthProvider(format!(
                        "{} did not assert a verified email; refusing to link to an existing account",
                        info.provider
                    )));
                }
                self.db.link_provider(user.id, info.provider, &info.provider_id)?;
                debug!(user_id = user.id, provider = %info.provider, "linked provider to existing account");
                return self.db.get_user(user.id)?.ok_or(Error::UserNotFound);
            }
        }

        let email = info
            .email
            .clone()
            .ok_or_else(|| Error::OAuthProvider(format!("{} returned no email", info.provider)))?;
        let username = self.pick_username(info, &email)?;

        let mut new = NewUser {
            email,
            username,
            display_name: info.display_name.clone(),
            first_name: info.first_name.clone(),
            last_name: info.last_name.clone(),
            avatar_url: info.avatar_url.clone(),
            ..Default::default()
        };
        match info.provider {
            OAuthProvider::Google => new.google_id = Some(info.provider_id.clone()),
            OAuthProvider::GitHub => new.github_id = Some(info.provider_id.clone()),
            OAuthProvider::Discord => new.discord_id = Some(info.provider_id.clone()),
        }
        let user = self.db.create_user(&new)?;
        debug!(user_id = user.id, provider = %info.provider, "created account from oauth login");
        Ok(user)
    }

    /// Auto-provision the "OAuth" group and a channel for the provider
    /// identity. Best-effort: failures are logged and never fail the login.
    pub fn provision_oauth_channels(&self, user: &User, info: &OAuthUserInfo) {
        if let Err(e) = self.try_provision_channels(user, info) {
            warn!(user_id = user.id, provider = %info.provider, "oauth channel provisioning failed: {}", e);
        }
    }

    fn try_provision_channels(&self, user: &User, info: &OAuthUserInfo) -> Result<()> {
        let (channel_type, value, label, is_primary) = match info.provider {
            OAuthProvider::GitHub => {
                let Some(login) = &info.handle else { return Ok(()) };
                (
                    ChannelType::Github,
                    format!("https://github.com/{}", login),
                    "GitHub Profile",
                    false,
                )
            }
            OAuthProvider::Google => {
                let Some(email) = &info.email else { return Ok(()) };
                (ChannelType::Email, email.clone(), "Google Email", true)
            }
            OAuthProvider::Discord => {
                let Some(name) = &info.handle else { return Ok(()) };
                (ChannelType::Custom, format!("@{}", name), "Discord", false)
            }
        };

        // Ambiguous types (a bare email, a custom handle) dedup on the label
        // too; distinctive ones on (type, value) alone.
        let dedup_on_label = matches!(channel_type, ChannelType::Email | ChannelType::Custom);
        let existing = self.db.list_channels(user.id)?;
        let already = existing.iter().any(|ch| {
            ch.channel_type == channel_type
                && ch.value == value
                && (!dedup_on_label || ch.label.as_deref() == Some(label))
        });
        if already {
            return Ok(());
        }

        let group = match self.db.get_group_by_name(user.id, OAUTH_GROUP_NAME)? {
            Some(g) => g,
            None => self.db.create_group(
                user.id,
                OAUTH_GROUP_NAME,
                Some("Channels added via OAuth login"),
                0,
            )?,
        };

        self.db.create_channel(
            user.id,
            channel_type,
            &value,
            Some(label),
            true,
            is_primary,
            0,
            &[group.id],
        )?;
        Ok(())
    }

    /// Derive a free username from the provider claims, suffixing a counter
    /// on collision.
    fn pick_username(&self, info: &OAuthUserInfo, email: &str) -> Result<String> {
        let preferred = info
            .username
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| email_local_part(email));
        let base = sanitize_username(&preferred);

        if self.db.get_user_by_username(&base)?.is_none() {
            return Ok(base);
        }
        for n in 2..100 {
            let candidate = format!("{}{}", base, n);
            if self.db.get_user_by_username(&candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        Err(Error::Internal("could not derive a free username".to_string()))
    }
}

fn sanitize_username(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.len() < 3 {
        format!("user-{}", &uuid::Uuid::new_v4().to_string()[..8])
    } else {
        cleaned.chars().take(50).collect()
    }
}

fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    if email.len() < 3 || email.len() > 255 || !email.contains('@') {
        return Err(Error::InvalidInput("invalid email address".to_string()));
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<()> {
    if username.len() < 3 || username.len() > 50 {
        return Err(Error::InvalidInput(
            "username must be 3-50 characters".to_string(),
        ));
    }
    if username.chars().any(|c| c.is_whitespace()) {
        return Err(Error::InvalidInput(
            "username must not contain whitespace".to_string(),
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 || password.len() > 128 {
        return Err(Error::InvalidInput(
            "password must be 8-128 characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkbook_common::Database;

    fn resolver() -> IdentityResolver {
        let db = Database::open_memory().unwrap();
        let ddb = DirectoryDb::new(db);
        ddb.init_schema().unwrap();
        IdentityResolver::new(ddb)
    }

    fn register_req(email: &str, username: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            username: username.to_string(),
            password: "hunter2hunter2".to_string(),
            display_name: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
            bio: None,
        }
    }

    fn github_info(provider_id: &str, email: &str) -> OAuthUserInfo {
        OAuthUserInfo {
            provider: OAuthProvider::GitHub,
            provider_id: provider_id.to_string(),
            email: Some(email.to_string()),
            email_verified: true,
            username: Some("octocat".to_string()),
            first_name: None,
            last_name: None,
            display_name: Some("Octo Cat".to_string()),
            avatar_url: None,
            handle: Some("octocat".to_string()),
        }
    }

    #[test]
    fn test_register_and_duplicates() {
        let r = resolver();
        let user = r.register(&register_req("a@example.com", "alice")).unwrap();
        assert_eq!(user.login_methods(), vec!["email"]);

        let err = r.register(&register_req("a@example.com", "alice2")).unwrap_err();
        assert!(matches!(err, Error::DuplicateEmail));
        let err = r.register(&register_req("a2@example.com", "alice")).unwrap_err();
        assert!(matches!(err, Error::DuplicateUsername));
    }

    #[test]
    fn test_register_validation() {
        let r = resolver();
        let mut req = register_req("bad-email", "alice");
        assert!(matches!(r.register(&req), Err(Error::InvalidInput(_))));

        req = register_req("a@example.com", "ab");
        assert!(matches!(r.register(&req), Err(Error::InvalidInput(_))));

        req = register_req("a@example.com", "alice");
        req.password = "short".to_string();
        assert!(matches!(r.register(&req), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_authenticate_uniform_failure() {
        let r = resolver();
        r.register(&register_req("a@example.com", "alice")).unwrap();

        let ok = r.authenticate("a@example.com", "hunter2hunter2").unwrap();
        assert_eq!(ok.username, "alice");

        let wrong_password = r.authenticate("a@example.com", "wrong-password").unwrap_err();
        let unknown_email = r.authenticate("nobody@example.com", "whatever").unwrap_err();
        assert!(matches!(wrong_password, Error::AuthFailed));
        assert!(matches!(unknown_email, Error::AuthFailed));
        assert_eq!(wrong_password.to_string(), unknown_email.to_string());
    }

    #[test]
    fn test_oauth_resolution_idempotent() {
        let r = resolver();
        let info = github_info("gh-1", "octo@example.com");

        let first = r.resolve_oauth_user(&info).unwrap();
        let second = r.resolve_oauth_user(&info).unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.password_hash.is_none());
        assert_eq!(first.login_methods(), vec!["github"]);
    }

    #[test]
    fn test_oauth_links_onto_existing_email() {
        let r = resolver();
        let existing = r.register(&register_req("octo@example.com", "octo")).unwrap();

        let resolved = r
            .resolve_oauth_user(&github_info("gh-7", "octo@example.com"))
            .unwrap();
        assert_eq!(resolved.id, existing.id);
        assert_eq!(resolved.github_id.as_deref(), Some("gh-7"));
        assert_eq!(resolved.login_methods(), vec!["email", "github"]);
    }

    #[test]
    fn test_oauth_unverified_email_refuses_link() {
        let r = resolver();
        r.register(&register_req("octo@example.com", "octo")).unwrap();

        let mut info = github_info("gh-7", "octo@example.com");
        info.email_verified = false;
        let err = r.resolve_oauth_user(&info).unwrap_err();
        assert!(matches!(err, Error::OAuthProvider(_)));

        // The existing account is untouched.
        let user = r.authenticate("octo@example.com", "hunter2hunter2").unwrap();
        assert!(user.github_id.is_none());
    }

    #[test]
    fn test_oauth_username_collision_suffixed() {
        let r = resolver();
        r.register(&register_req("other@example.com", "octocat")).unwrap();

        let created = r
            .resolve_oauth_user(&github_info("gh-9", "octo@example.com"))
            .unwrap();
        assert_eq!(created.username, "octocat2");
    }

    #[test]
    fn test_channel_provisioning_and_dedup() {
        let r = resolver();
        let info = github_info("gh-1", "octo@example.com");
        let user = r.resolve_oauth_user(&info).unwrap();

        r.provision_oauth_channels(&user, &info);
        r.provision_oauth_channels(&user, &info);

        let channels = r.db.list_channels(user.id).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].value, "https://github.com/octocat");

        let group = r.db.get_group_by_name(user.id, "OAuth").unwrap().unwrap();
        assert_eq!(channels[0].group_ids, vec![group.id]);
    }
}
