//! Error types for the fleet controller
//!
//! Every runtime failure is caught at a unit-of-work boundary (instance,
//! account, reconciliation call). The variants here carry enough context to
//! name the instance/account/operation in the log line.

use thiserror::Error;

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the fleet controller
#[derive(Error, Debug)]
pub enum Error {
    /// A single reachability attempt failed (refused, timed out, bad response)
    #[error("Probe error: {0}")]
    Probe(String),

    /// A compute/network provider API call failed
    #[error("Compute provider error ({provider}/{operation}): {message}")]
    Compute {
        /// Provider name
        provider: String,
        /// Capability being invoked (e.g. "disassociate")
        operation: String,
        /// Error message
        message: String,
    },

    /// A DNS provider API call failed
    #[error("DNS provider error ({provider}): {message}")]
    Dns {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// An account's configuration or instance enumeration failed
    #[error("Inventory load failed for account {account}: {message}")]
    Inventory {
        /// Account name
        account: String,
        /// Error message
        message: String,
    },

    /// The target state is already satisfied (e.g. record already exists)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limiting errors
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend does not offer this capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a compute provider error
    pub fn compute(
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Compute {
            provider: provider.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a DNS provider error
    pub fn dns(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dns {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an inventory load error
    pub fn inventory(account: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inventory {
            account: account.into(),
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an "unsupported" error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether repeating the same call may succeed.
    ///
    /// Authentication, configuration and "already satisfied" outcomes will not
    /// change on retry, so the retry helper stops on them immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Authentication(_)
                | Self::Config(_)
                | Self::Conflict(_)
                | Self::NotFound(_)
                | Self::Unsupported(_)
                | Self::InvalidInput(_)
        )
    }

    /// Whether the failure invalidates the whole account's in-memory state.
    pub fn is_fatal_for_account(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Config(_) | Self::Inventory { .. }
        )
    }

    /// Whether a DNS mutation failed only because the target state already holds.
    pub fn is_already_satisfied(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NotFound(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
