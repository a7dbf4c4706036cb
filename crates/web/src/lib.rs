//! Linkbook Web API
//!
//! REST service for the Linkbook contact directory: accounts, OAuth login,
//! recovery, contact channels, channel groups and the contact graph.

pub mod auth;
pub mod recovery;
pub mod routes;
pub mod server;
pub mod store;

pub use routes::api_router;
pub use server::{serve, AppState, ServerConfig};
pub use store::DirectoryDb;
