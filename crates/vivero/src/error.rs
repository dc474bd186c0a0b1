//! Result and error types for the pool service.

use thiserror::Error;

/// Result type for pool service operations
pub type ViveroResult<T> = Result<T, ViveroError>;

/// Which per-user quota a request tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Appliances in a single pool
    PerPool,
    /// Concurrently owned pools
    TotalPools,
    /// Concurrently owned appliances
    TotalVms,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PerPool => "per-pool appliance quota",
            Self::TotalPools => "total pool quota",
            Self::TotalVms => "total appliance quota",
        };
        write!(f, "{name}")
    }
}

/// Errors surfaced by the pool service
#[derive(Debug, Error)]
pub enum ViveroError {
    /// A request would exceed one of the caller's quotas. Rejected before
    /// anything is written.
    #[error("{quota} exceeded: limit {limit}, requested {requested}")]
    QuotaExceeded {
        /// Which quota tripped
        quota: QuotaKind,
        /// The configured limit
        limit: u32,
        /// What the request would have brought usage to
        requested: u32,
    },

    /// A referenced object does not exist
    #[error("Unknown {kind}: {id}")]
    NotFound {
        /// Object kind (provider, group, template, appliance, pool)
        kind: &'static str,
        /// The identifier that failed to resolve
        id: String,
    },

    /// The object belongs to a different user
    #[error("This {kind} belongs to a different user")]
    NotOwner {
        /// Object kind
        kind: &'static str,
    },

    /// The method needs an authenticated caller
    #[error("Method {method} needs authentication")]
    AuthRequired {
        /// Method name
        method: String,
    },

    /// Authentication data did not check out
    #[error("Authentication failed: {message}")]
    AuthFailed {
        /// Failure detail
        message: String,
    },

    /// The caller lacks staff rights
    #[error("You don't have enough rights")]
    Forbidden,

    /// A request value failed validation
    #[error("Invalid value for {field}: {message}")]
    Invalid {
        /// The offending field
        field: String,
        /// What was wrong with it
        message: String,
    },

    /// A provider backend call failed
    #[error("Provider failure: {message}")]
    Provider {
        /// Error message
        message: String,
    },

    /// Service configuration problem
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ViveroError {
    /// Exception class name used in the RPC envelope
    #[must_use]
    pub const fn class(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::NotFound { .. } => "NotFound",
            Self::NotOwner { .. } => "NotOwner",
            Self::AuthRequired { .. } => "AuthRequired",
            Self::AuthFailed { .. } => "AuthFailed",
            Self::Forbidden => "Forbidden",
            Self::Invalid { .. } => "ValueError",
            Self::Provider { .. } => "ProviderError",
            Self::Config { .. } => "ConfigError",
            Self::Io(_) => "IOError",
            Self::Json(_) => "JSONError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_names_the_tripped_quota() {
        let err = ViveroError::QuotaExceeded {
            quota: QuotaKind::PerPool,
            limit: 3,
            requested: 4,
        };
        assert_eq!(err.class(), "QuotaExceeded");
        assert!(err.to_string().contains("per-pool"));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_class_names() {
        let err = ViveroError::Forbidden;
        assert_eq!(err.class(), "Forbidden");
    }
}
