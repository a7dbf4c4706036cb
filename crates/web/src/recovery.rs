//! Account recovery engine.
//!
//! A recovery flow issues two independent secrets: a short-lived 6-digit OTP
//! for the email path, and a longer-lived opaque token that only correlates
//! the client's recovery session. Both are single-use; expiry is checked by
//! wall-clock comparison at verification time, never by active eviction.

use linkbook_common::{Error, OAuthProvider, Result, User};
use rand::Rng;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::auth::oauth::{random_url_token, ProviderVerifier};
use crate::store::{now_epoch_secs, DirectoryDb};

const OTP_TTL_SECS: i64 = 10 * 60;
const RECOVERY_TOKEN_TTL_SECS: i64 = 60 * 60;

/// Implemented login method slots: password plus three OAuth providers.
const TOTAL_METHODS: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStart {
    pub message: String,
    pub available_methods: Vec<&'static str>,
    pub recovery_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityInfo {
    pub connected: usize,
    pub total: usize,
    pub methods: Vec<&'static str>,
    pub level: &'static str,
    pub recommendation: String,
}

#[derive(Clone)]
pub struct RecoveryEngine {
    db: DirectoryDb,
    verifier: Arc<dyn ProviderVerifier>,
}

impl RecoveryEngine {
    pub fn new(db: DirectoryDb, verifier: Arc<dyn ProviderVerifier>) -> Self {
        Self { db, verifier }
    }

    /// Begin recovery: issue a fresh OTP + session token, superseding any
    /// previous in-flight recovery, and report the connected login methods.
    pub fn start_recovery(&self, email: &str) -> Result<RecoveryStart> {
        let user = self.db.get_user_by_email(email)?.ok_or(Error::UserNotFound)?;

        let methods = user.login_methods();
        if methods.is_empty() {
            return Err(Error::NoLoginMethods);
        }

        let now = now_epoch_secs();
        let otp_code = generate_otp_code();
        let recovery_token = random_url_token();
        self.db.set_recovery_state(
            user.id,
            &otp_code,
            now + OTP_TTL_SECS,
            &recovery_token,
            now + RECOVERY_TOKEN_TTL_SECS,
        )?;

        // Actual delivery is an external concern; surface the code for
        // development runs only.
        debug!(user_id = user.id, otp = %otp_code, "issued recovery otp");

        let warning = (methods.len() == 1).then(|| {
            "We recommend adding more login methods in security settings".to_string()
        });

        Ok(RecoveryStart {
            message: "Recovery process started".to_string(),
            available_methods: methods,
            recovery_token,
            warning,
        })
    }

    /// Verify one recovery method and consume the in-flight secrets.
    pub async fn verify_recovery(
        &self,
        email: &str,
        method: &str,
        code: Option<&str>,
        oauth_token: Option<&str>,
    ) -> Result<User> {
        let user = self.db.get_user_by_email(email)?.ok_or(Error::UserNotFound)?;

        if method == "email" {
            let code = code.ok_or(Error::OtpMissing)?;
            match user.otp_code.as_deref() {
                Some(stored) if stored == code => {}
                _ => return Err(Error::InvalidOtp),
            }
            match user.otp_expires_at {
                Some(expires) if expires >= now_epoch_secs() => {}
                _ => return Err(Error::OtpExpired),
            }
            self.db.clear_otp(user.id)?;
        } else if let Ok(provider) = OAuthProvider::from_str(method) {
            let oauth_token = oauth_token.ok_or(Error::OAuthTokenMissing)?;
            let linked_id = user
                .provider_id(provider)
                .ok_or_else(|| Error::ProviderNotLinked(provider_display(provider)))?;
            if !self.verifier.verify(provider, oauth_token, linked_id).await? {
                return Err(Error::OAuthProvider(format!(
                    "{} token does not match the linked account",
                    provider
                )));
            }
        } else {
            return Err(Error::InvalidRecoveryMethod(method.to_string()));
        }

        self.db.clear_recovery_token(user.id)?;
        self.db.get_user(user.id)?.ok_or(Error::UserNotFound)
    }

    pub fn security_info(&self, user: &User) -> SecurityInfo {
        let methods = user.login_methods();
        let connected = methods.len();
        let level = match connected {
            0 | 1 => "low",
            2 => "medium",
            _ => "high",
        };
        let recommendation = if connected < 3 {
            "We recommend connecting at least 3 login methods for account recovery".to_string()
        } else {
            "Your account security is strong".to_string()
        };
        SecurityInfo {
            connected,
            total: TOTAL_METHODS,
            methods,
            level,
            recommendation,
        }
    }
}

fn generate_otp_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

fn provider_display(provider: OAuthProvider) -> String {
    match provider {
        OAuthProvider::Google => "Google".to_string(),
        OAuthProvider::GitHub => "GitHub".to_string(),
        OAuthProvider::Discord => "Discord".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewUser;
    use async_trait::async_trait;
    use linkbook_common::Database;

    /// Verifier with a fixed answer, standing in for provider introspection.
    struct StaticVerifier(bool);

    #[async_trait]
    impl ProviderVerifier for StaticVerifier {
        async fn verify(&self, _: OAuthProvider, _: &str, _: &str) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn engine_with(answer: bool) -> RecoveryEngine {
        let db = Database::open_memory().unwrap();
        let ddb = DirectoryDb::new(db);
        ddb.init_schema().unwrap();
        RecoveryEngine::new(ddb, Arc::new(StaticVerifier(answer)))
    }

    fn seed_user(engine: &RecoveryEngine, email: &str, github: Option<&str>) -> User {
        engine
            .db
            .create_user(&NewUser {
                email: email.to_string(),
                username: email.split('@').next().unwrap().to_string(),
                password_hash: Some("$argon2id$stub".to_string()),
                github_id: github.map(String::from),
                ..Default::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_verify_email_otp() {
        let engine = engine_with(true);
        seed_user(&engine, "a@example.com", None);

        let start = engine.start_recovery("a@example.com").unwrap();
        assert_eq!(start.available_methods, vec!["email"]);
        assert!(start.warning.is_some());
        assert!(!start.recovery_token.is_empty());

        let stored = engine.db.get_user_by_email("a@example.com").unwrap().unwrap();
        let code = stored.otp_code.clone().unwrap();
        assert_eq!(code.len(), 6);

        let user = engine
            .verify_recovery("a@example.com", "email", Some(&code), None)
            .await
            .unwrap();
        // Both secrets are consumed.
        assert!(user.otp_code.is_none());
        assert!(user.recovery_token.is_none());

        // The code is single-use.
        let err = engine
            .verify_recovery("a@example.com", "email", Some(&code), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOtp));
    }

    #[tokio::test]
    async fn test_no_warning_with_multiple_methods() {
        let engine = engine_with(true);
        seed_user(&engine, "a@example.com", Some("gh-1"));
        let start = engine.start_recovery("a@example.com").unwrap();
        assert_eq!(start.available_methods, vec!["email", "github"]);
        assert!(start.warning.is_none());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let engine = engine_with(true);
        assert!(matches!(
            engine.start_recovery("nobody@example.com"),
            Err(Error::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_otp_missing_and_invalid() {
        let engine = engine_with(true);
        seed_user(&engine, "a@example.com", None);
        engine.start_recovery("a@example.com").unwrap();

        let err = engine
            .verify_recovery("a@example.com", "email", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OtpMissing));

        let err = engine
            .verify_recovery("a@example.com", "email", Some("000000x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOtp));
    }

    #[tokio::test]
    async fn test_otp_expired() {
        let engine = engine_with(true);
        let user = seed_user(&engine, "a@example.com", None);

        // Correct code, but the clock has passed its expiry.
        engine
            .db
            .set_recovery_state(user.id, "123456", now_epoch_secs() - 1, "tok", now_epoch_secs() + 3600)
            .unwrap();
        let err = engine
            .verify_recovery("a@example.com", "email", Some("123456"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OtpExpired));
    }

    #[tokio::test]
    async fn test_new_otp_supersedes_old() {
        let engine = engine_with(true);
        seed_user(&engine, "a@example.com", None);

        engine.start_recovery("a@example.com").unwrap();
        let old_code = engine
            .db
            .get_user_by_email("a@example.com")
            .unwrap()
            .unwrap()
            .otp_code
            .unwrap();

        engine.start_recovery("a@example.com").unwrap();
        let new_code = engine
            .db
            .get_user_by_email("a@example.com")
            .unwrap()
            .unwrap()
            .otp_code
            .unwrap();

        if old_code != new_code {
            let err = engine
                .verify_recovery("a@example.com", "email", Some(&old_code), None)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidOtp));
        }
        engine
            .verify_recovery("a@example.com", "email", Some(&new_code), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oauth_method_requires_link_and_token() {
        let engine = engine_with(true);
        seed_user(&engine, "a@example.com", None);
        engine.start_recovery("a@example.com").unwrap();

        let err = engine
            .verify_recovery("a@example.com", "github", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OAuthTokenMissing));

        let err = engine
            .verify_recovery("a@example.com", "github", None, Some("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderNotLinked(_)));
    }

    #[tokio::test]
    async fn test_oauth_method_verified_against_provider() {
        let engine = engine_with(true);
        seed_user(&engine, "a@example.com", Some("gh-1"));
        engine.start_recovery("a@example.com").unwrap();

        let user = engine
            .verify_recovery("a@example.com", "github", None, Some("tok"))
            .await
            .unwrap();
        assert!(user.recovery_token.is_none());
        // The email OTP path was not used, so its code survives.
        assert!(user.otp_code.is_some());
    }

    #[tokio::test]
    async fn test_oauth_method_rejected_on_mismatch() {
        let engine = engine_with(false);
        seed_user(&engine, "a@example.com", Some("gh-1"));
        engine.start_recovery("a@example.com").unwrap();

        let err = engine
            .verify_recovery("a@example.com", "github", None, Some("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OAuthProvider(_)));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let engine = engine_with(true);
        seed_user(&engine, "a@example.com", None);
        let err = engine
            .verify_recovery("a@example.com", "telegram", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecoveryMethod(_)));
    }

    #[test]
    fn test_security_levels_at_each_count() {
        let engine = engine_with(true);

        let mut user = seed_user(&engine, "a@example.com", None);

        // 0 connected methods (not reachable in practice, still defined).
        user.password_hash = None;
        assert_eq!(engine.security_info(&user).level, "low");
        assert_eq!(engine.security_info(&user).connected, 0);

        // 1 method.
        user.password_hash = Some("h".to_string());
        let info = engine.security_info(&user);
        assert_eq!((info.connected, info.level), (1, "low"));

        // 2 methods.
        user.google_id = Some("g".to_string());
        let info = engine.security_info(&user);
        assert_eq!((info.connected, info.level), (2, "medium"));

        // 3 methods.
        user.github_id = Some("gh".to_string());
        let info = engine.security_info(&user);
        assert_eq!((info.connected, info.level), (3, "high"));
        assert_eq!(info.recommendation, "Your account security is strong");

        // 4 methods, full house.
        user.discord_id = Some("d".to_string());
        let info = engine.security_info(&user);
        assert_eq!((info.connected, info.level), (4, "high"));
        assert_eq!(info.total, 4);
    }
}
