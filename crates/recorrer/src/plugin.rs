//! Page-readiness plugins.
//!
//! A plugin answers one question: is the application idle enough to touch?
//! Polling is always the caller's job; a plugin performs a single check,
//! using JavaScript only so the check itself cannot disturb the page.

use serde_json::Value;

use crate::browser::Browser;
use crate::result::RecorrerResult;

/// A pluggable page-readiness predicate
pub trait PagePlugin: Send + Sync {
    /// Run one readiness check against the current page.
    ///
    /// # Errors
    ///
    /// Returns an error when the check itself cannot run (script failure,
    /// dead session). `Ok(false)` means "not ready yet, keep polling".
    fn check_page_ready(&self, browser: &Browser) -> RecorrerResult<bool>;
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Baseline readiness check: no in-flight jQuery or Prototype requests and
/// a complete document. The script returns a map of named indicators; the
/// page is ready when all of them hold. A non-map result counts as ready,
/// so pages without the instrumented libraries never block.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPlugin;

impl DefaultPlugin {
    /// Indicator script run on every check
    pub const ENSURE_PAGE_SAFE: &'static str = r#"
        return {
            jquery: (typeof jQuery === "undefined") ? true : jQuery.active < 1,
            prototype: (typeof Ajax === "undefined") ? true : Ajax.activeRequestCount < 1,
            document: document.readyState == "complete"
        }
    "#;
}

impl PagePlugin for DefaultPlugin {
    fn check_page_ready(&self, browser: &Browser) -> RecorrerResult<bool> {
        let result = browser.execute_script(Self::ENSURE_PAGE_SAFE, &[])?;
        match result {
            Value::Object(indicators) => {
                let ready = indicators.values().all(truthy);
                if !ready {
                    tracing::trace!(?indicators, "page not ready");
                }
                Ok(ready)
            }
            _ => Ok(true),
        }
    }
}

/// Product readiness check for the management UI: on top of the baseline
/// indicators it requires the in-flight ajax timer count to be zero and the
/// busy spinner to be hidden.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuiescePlugin;

impl QuiescePlugin {
    /// Indicator script run on every check
    pub const ENSURE_PAGE_SAFE: &'static str = r#"
        function isHidden(el) { if (el === null) return true; return el.offsetParent === null; }
        return {
            jquery: (typeof jQuery === "undefined") ? true : jQuery.active < 1,
            prototype: (typeof Ajax === "undefined") ? true : Ajax.activeRequestCount < 1,
            ajax_timers: (typeof ManageIQ === "undefined") ? true : ManageIQ.qe.anythingInFlight() < 1,
            spinner: isHidden(document.getElementById("spinner_div")) || !isHidden(document.getElementById("lightbox_div")),
            document: document.readyState == "complete"
        }
    "#;
}

impl PagePlugin for QuiescePlugin {
    fn check_page_ready(&self, browser: &Browser) -> RecorrerResult<bool> {
        let result = browser.execute_script(Self::ENSURE_PAGE_SAFE, &[])?;
        match result {
            Value::Object(indicators) => Ok(indicators.values().all(truthy)),
            _ => Ok(true),
        }
    }
}
