//! Error types.

use thiserror::Error;

use crate::syntax::SyntaxError;

/// Errors raised while configuring an [`Authorization`](crate::Authorization).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rules: {0}")]
    Rules(#[from] SyntaxError),

    #[error("invalid default policy `{0}`: expected \"DROP\" or \"ACCEPT\"")]
    InvalidPolicy(String),
}

/// Errors raised by a single validation call.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("invalid query: {0}")]
    Query(#[from] SyntaxError),

    #[error("validation parameters have no `userClaims` object")]
    MissingClaims,

    #[error("validation parameters have no `userClaims.roles`")]
    MissingRoles,

    #[error("`userClaims.roles` must be a string or an array of strings")]
    InvalidRoles,

    #[error("query variables must be a JSON object")]
    InvalidVariables,
}

/// A comment that looks like an annotation but cannot be decoded.
///
/// These never fail rule compilation; the builder logs them and moves on.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("malformed annotation: {0}")]
    Malformed(#[from] serde_json::Error),
}
