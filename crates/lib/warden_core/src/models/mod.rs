//! Domain models.
//!
//! These are internal domain models; transport layers map them onto their
//! own request/response shapes.

pub mod auth;
pub mod identity;
