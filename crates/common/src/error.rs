//! Error types for Linkbook

use thiserror::Error;

/// Result type alias using Linkbook Error
pub type Result<T> = std::result::Result<T, Error>;

/// Linkbook error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Email already registered")]
    DuplicateEmail,

    #[error("Username already taken")]
    DuplicateUsername,

    #[error("Incorrect email or password")]
    AuthFailed,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("User not found")]
    UserNotFound,

    #[error("Group with this name already exists")]
    DuplicateGroupName,

    #[error("Group not found")]
    GroupNotFound,

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Cannot add yourself as a contact")]
    SelfContact,

    #[error("Contact already exists")]
    ContactExists,

    #[error("Contact target not found")]
    TargetNotFound,

    #[error("OTP code required for email recovery")]
    OtpMissing,

    #[error("Invalid OTP code")]
    InvalidOtp,

    #[error("OTP code expired")]
    OtpExpired,

    #[error("OAuth token required")]
    OAuthTokenMissing,

    #[error("{0} login not connected")]
    ProviderNotLinked(String),

    #[error("No login methods available")]
    NoLoginMethods,

    #[error("Unknown recovery method: {0}")]
    InvalidRecoveryMethod(String),

    #[error("OAuth provider error: {0}")]
    OAuthProvider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures the client caused (4xx-class), as opposed to
    /// storage or internal faults.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_)
        )
    }
}
