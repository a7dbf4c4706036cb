//! Linkbook Common Library
//!
//! Shared types, errors, and storage plumbing for the Linkbook service.

pub mod db;
pub mod error;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

/// Linkbook version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".linkbook")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("linkbook.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
