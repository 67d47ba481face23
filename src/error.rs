//! Error types for Turnstile.
//!
//! A rejected admission is not an error: it is reported through
//! [`Admission::Rejected`](crate::ratelimit::Admission) or a lease that was not
//! acquired. The variants here cover misconfiguration and API misuse.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration could not be parsed or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limiter options failed validation
    #[error("Invalid limiter options: {0}")]
    InvalidOptions(String),

    /// Two policies were registered under the same name
    #[error("Policy '{0}' is already registered")]
    DuplicatePolicy(String),

    /// A policy name did not resolve to a registered policy
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// More permits were requested than the limiter can ever grant
    #[error("Requested {requested} permits but the limit is {limit}")]
    PermitsExceedLimit {
        /// Permits requested by the caller
        requested: u32,
        /// Configured permit or token limit
        limit: u32,
    },

    /// A lease was released a second time
    #[error("Lease was already released")]
    LeaseAlreadyReleased,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
