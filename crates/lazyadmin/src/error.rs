//! Crate-level error type

use thiserror::Error;

/// Errors surfaced by the core subsystems.
///
/// Configuration, identity, audit-initialization and required-second-factor
/// errors abort startup; everything else is a per-action failure returned to
/// the front-end and reflected in the audit record.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] crate::catalog::ConfigError),

    #[error("identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),

    #[error("authentication error: {0}")]
    Auth(#[from] crate::token::AuthError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("audit error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    #[error("user store error: {0}")]
    Users(#[from] crate::users::StoreError),
}

/// Result type for lazyadmin operations
pub type Result<T> = std::result::Result<T, Error>;
