//! Locator abstraction for element selection.
//!
//! A locator is either a (strategy, expression) pair or an already-resolved
//! element handle. Bare strings are classified by a heuristic: expressions
//! starting with `/` or `./` are XPath, everything else is CSS (`#x`, `.x`
//! and plain tag names are all valid CSS).

use serde::{Deserialize, Serialize};

use crate::driver::ElementHandle;
use crate::result::RecorrerResult;

/// Element lookup strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Lookup by `id` attribute
    Id,
    /// CSS selector
    Css,
    /// XPath expression
    XPath,
    /// Lookup by class name
    Class,
    /// Anchor text, exact match
    LinkText,
    /// Anchor text, substring match
    PartialLinkText,
    /// Tag name
    Tag,
    /// Lookup by `name` attribute
    Name,
}

impl Strategy {
    /// Wire name of the strategy
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Css => "css",
            Self::XPath => "xpath",
            Self::Class => "class",
            Self::LinkText => "link-text",
            Self::PartialLinkText => "partial-link-text",
            Self::Tag => "tag",
            Self::Name => "name",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A value describing how to find one or more elements
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// A (strategy, expression) query
    Query {
        /// Lookup strategy
        strategy: Strategy,
        /// Strategy-specific expression
        expression: String,
    },
    /// An already-resolved element handle, returned as-is by queries
    Element(ElementHandle),
}

impl Locator {
    /// Create a locator with an explicit strategy
    #[must_use]
    pub fn by(strategy: Strategy, expression: impl Into<String>) -> Self {
        Self::Query {
            strategy,
            expression: expression.into(),
        }
    }

    /// Create a CSS locator
    #[must_use]
    pub fn css(expression: impl Into<String>) -> Self {
        Self::by(Strategy::Css, expression)
    }

    /// Create an XPath locator
    #[must_use]
    pub fn xpath(expression: impl Into<String>) -> Self {
        Self::by(Strategy::XPath, expression)
    }

    /// Create an id locator
    #[must_use]
    pub fn id(expression: impl Into<String>) -> Self {
        Self::by(Strategy::Id, expression)
    }

    /// Classify a bare string: `/...` and `./...` are XPath, the rest CSS.
    #[must_use]
    pub fn classify(expression: &str) -> Self {
        if expression.starts_with('/') || expression.starts_with("./") {
            Self::xpath(expression)
        } else {
            Self::css(expression)
        }
    }

    /// Human-readable description for error messages
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Query {
                strategy,
                expression,
            } => format!("{strategy}={expression:?}"),
            Self::Element(handle) => format!("element#{}", handle.0),
        }
    }

    /// Whether the locator is an already-resolved handle
    #[must_use]
    pub const fn is_element(&self) -> bool {
        matches!(self, Self::Element(_))
    }
}

impl From<&str> for Locator {
    fn from(expression: &str) -> Self {
        Self::classify(expression)
    }
}

impl From<String> for Locator {
    fn from(expression: String) -> Self {
        Self::classify(&expression)
    }
}

impl From<ElementHandle> for Locator {
    fn from(handle: ElementHandle) -> Self {
        Self::Element(handle)
    }
}

/// Anything that can produce a [`Locator`]. Widgets implement this so they
/// can be passed directly to browser queries.
pub trait Locate {
    /// Produce the locator for this object
    ///
    /// # Errors
    ///
    /// Returns an error when the object declares no locator.
    fn locator(&self) -> RecorrerResult<Locator>;
}

impl Locate for Locator {
    fn locator(&self) -> RecorrerResult<Locator> {
        Ok(self.clone())
    }
}

impl Locate for ElementHandle {
    fn locator(&self) -> RecorrerResult<Locator> {
        Ok(Locator::Element(*self))
    }
}

impl Locate for &str {
    fn locator(&self) -> RecorrerResult<Locator> {
        Ok(Locator::classify(self))
    }
}

/// Quote a string for embedding as an XML attribute value inside an XPath
/// expression. Prefers double quotes, falls back to single quotes, and
/// escapes embedded double quotes when both kinds are present.
#[must_use]
pub fn quote_attr(value: &str) -> String {
    if !value.contains('"') {
        format!("\"{value}\"")
    } else if !value.contains('\'') {
        format!("'{value}'")
    } else {
        format!("\"{}\"", value.replace('"', "&quot;"))
    }
}
