//! Core domain types for Linkbook

use serde::{Deserialize, Serialize};

/// A registered account.
///
/// Every user carries at least one login method after creation: either a
/// password hash or one or more linked OAuth provider ids. The recovery
/// fields are transient and single-use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    /// Absent for pure-OAuth accounts.
    pub password_hash: Option<String>,

    pub google_id: Option<String>,
    pub github_id: Option<String>,
    pub discord_id: Option<String>,

    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,

    /// 6-digit code for email recovery, cleared after verification.
    pub otp_code: Option<String>,
    pub otp_expires_at: Option<i64>,
    /// Opaque correlation token for an in-flight recovery session.
    pub recovery_token: Option<String>,
    pub recovery_expires_at: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    /// Login methods currently connected, in a stable order.
    pub fn login_methods(&self) -> Vec<&'static str> {
        let mut methods = Vec::new();
        if self.password_hash.is_some() {
            methods.push("email");
        }
        if self.google_id.is_some() {
            methods.push("google");
        }
        if self.github_id.is_some() {
            methods.push("github");
        }
        if self.discord_id.is_some() {
            methods.push("discord");
        }
        methods
    }

    pub fn provider_id(&self, provider: OAuthProvider) -> Option<&str> {
        match provider {
            OAuthProvider::Google => self.google_id.as_deref(),
            OAuthProvider::GitHub => self.github_id.as_deref(),
            OAuthProvider::Discord => self.discord_id.as_deref(),
        }
    }
}

/// Authenticated-user projection returned to the account owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&User> for UserView {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            username: u.username.clone(),
            display_name: u.display_name.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            avatar_url: u.avatar_url.clone(),
            bio: u.bio.clone(),
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

/// Public projection shown to anyone. Never carries the email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub created_at: i64,
}

impl From<&User> for PublicUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            display_name: u.display_name.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            avatar_url: u.avatar_url.clone(),
            bio: u.bio.clone(),
            created_at: u.created_at,
        }
    }
}

/// Federated login provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    GitHub,
    Discord,
}

impl OAuthProvider {
    pub const ALL: [OAuthProvider; 3] = [
        OAuthProvider::Google,
        OAuthProvider::GitHub,
        OAuthProvider::Discord,
    ];
}

impl std::fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Google => write!(f, "google"),
            Self::GitHub => write!(f, "github"),
            Self::Discord => write!(f, "discord"),
        }
    }
}

impl std::str::FromStr for OAuthProvider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::GitHub),
            "discord" => Ok(Self::Discord),
            _ => Err(format!("unknown oauth provider: {}", s)),
        }
    }
}

/// Kind of contact channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Phone,
    Email,
    Telegram,
    Whatsapp,
    Signal,
    Instagram,
    Twitter,
    Facebook,
    Linkedin,
    Website,
    Github,
    Custom,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Phone => "phone",
            Self::Email => "email",
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Signal => "signal",
            Self::Instagram => "instagram",
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
            Self::Linkedin => "linkedin",
            Self::Website => "website",
            Self::Github => "github",
            Self::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phone" => Ok(Self::Phone),
            "email" => Ok(Self::Email),
            "telegram" => Ok(Self::Telegram),
            "whatsapp" => Ok(Self::Whatsapp),
            "signal" => Ok(Self::Signal),
            "instagram" => Ok(Self::Instagram),
            "twitter" => Ok(Self::Twitter),
            "facebook" => Ok(Self::Facebook),
            "linkedin" => Ok(Self::Linkedin),
            "website" => Ok(Self::Website),
            "github" => Ok(Self::Github),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("unknown channel type: {}", s)),
        }
    }
}

/// A single contact channel (phone, email, handle, URL) owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub user_id: i64,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub value: String,
    pub label: Option<String>,
    pub is_public: bool,
    pub is_primary: bool,
    pub sort_order: i64,
    /// Ids of groups this channel is attached to.
    pub group_ids: Vec<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A named grouping of channels, scoped to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub sort_order: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Lifecycle state of a contact edge. Removal is a state change, not a row
/// delete, so history and re-add detection survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactState {
    Active,
    Removed,
}

impl std::fmt::Display for ContactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

impl std::str::FromStr for ContactState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "removed" => Ok(Self::Removed),
            _ => Err(format!("unknown contact state: {}", s)),
        }
    }
}

/// Directed "added as contact" edge between two users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub user_id: i64,
    pub contact_user_id: i64,
    pub state: ContactState,
    pub created_at: i64,
}
