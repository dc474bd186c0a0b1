//! Result and error types for Recorrer.

use thiserror::Error;

/// Result type for Recorrer operations
pub type RecorrerResult<T> = Result<T, RecorrerError>;

/// Errors that can occur in Recorrer
#[derive(Debug, Error)]
pub enum RecorrerError {
    /// No element matched the locator. Recoverable; visibility predicates
    /// treat it as a negative answer.
    #[error("No element found for {locator}")]
    ElementNotFound {
        /// Locator description
        locator: String,
    },

    /// The element detached from the document and retries were exhausted
    /// (or the locator was a raw handle that cannot be re-resolved).
    #[error("Element for {locator} went stale and could not be re-resolved")]
    StaleElement {
        /// Locator description
        locator: String,
    },

    /// Pointer move failed even after scrolling the element into view.
    #[error("Despite all the workarounds, scrolling to {locator} was unsuccessful")]
    MoveTargetOutOfBounds {
        /// Locator description
        locator: String,
    },

    /// No satisfiable path exists between the two views.
    #[error("No navigation path from {from} to {to}")]
    PathMissing {
        /// Source view name
        from: String,
        /// Target view name
        to: String,
    },

    /// The page-readiness poll budget was exhausted.
    #[error("Page did not become safe within {ms}ms")]
    PageNotSafe {
        /// Poll budget in milliseconds
        ms: u64,
    },

    /// A transition completed but no expected target view recognized the page.
    #[error("Landed on an unknown page after transition {transition}")]
    UnknownLandingView {
        /// Transition name
        transition: String,
    },

    /// A view name could not be resolved against the registry.
    #[error("Unknown view {name}")]
    UnknownView {
        /// The unresolved view name
        name: String,
    },

    /// Two views with the same name cannot share a registry.
    #[error("A view named {name} is already registered")]
    DuplicateView {
        /// The conflicting view name
        name: String,
    },

    /// A widget name is not declared on the view.
    #[error("View {view} does not have widget {widget}")]
    UnknownWidget {
        /// View name
        view: String,
        /// Widget name
        widget: String,
    },

    /// A multi-target transition names a candidate without a view predicate.
    #[error("Transition {transition} has multiple targets but {view} defines no on_view predicate")]
    MissingOnView {
        /// Candidate view name
        view: String,
        /// Transition name
        transition: String,
    },

    /// The entry view must define an on_load hook.
    #[error("Entry view {view} defines no on_load hook")]
    MissingOnLoad {
        /// Entry view name
        view: String,
    },

    /// A widget does not implement the requested operation.
    #[error("Widget {widget} does not implement {operation}")]
    NotImplemented {
        /// Widget description
        widget: String,
        /// Operation name (locator, read, fill)
        operation: String,
    },

    /// No alert was present when one was required.
    #[error("No alert present")]
    NoAlert,

    /// Script evaluation failed in the page.
    #[error("Script evaluation failed: {message}")]
    Script {
        /// Error message
        message: String,
    },

    /// The underlying browser backend reported an error.
    #[error("Browser backend error: {message}")]
    Driver {
        /// Error message
        message: String,
    },

    /// A wait condition was not met within its budget.
    #[error("Operation timed out after {ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        ms: u64,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RecorrerError {
    /// Whether the error is a recoverable element-level negative
    /// (used as `false` by visibility predicates).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ElementNotFound { .. } | Self::MoveTargetOutOfBounds { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let not_found = RecorrerError::ElementNotFound {
            locator: "#x".to_string(),
        };
        assert!(not_found.is_recoverable());

        let stale = RecorrerError::StaleElement {
            locator: "#x".to_string(),
        };
        assert!(!stale.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = RecorrerError::PathMissing {
            from: "Login".to_string(),
            to: "Dashboard".to_string(),
        };
        assert!(err.to_string().contains("Login"));
        assert!(err.to_string().contains("Dashboard"));
    }
}
