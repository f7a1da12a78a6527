//! # warden_core
//!
//! Identity and session authority for Warden: users, groups, single-use
//! tokens, password and federated login, and bearer token minting.

pub mod auth;
pub mod authority;
pub mod clock;
pub mod config;
pub mod federation;
pub mod migrate;
pub mod models;
pub mod store;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
