//! Authentication: password hashing, access tokens, OAuth, identity resolution.

pub mod middleware;
pub mod oauth;
pub mod password;
pub mod resolver;
pub mod token;

pub use middleware::{require_auth, CurrentUser};
pub use oauth::{OAuthUserInfo, ProviderRegistry, ProviderVerifier, UserinfoVerifier};
pub use resolver::{IdentityResolver, RegisterRequest};
pub use token::TokenService;
