//! Abstract DOM driver trait and the in-memory mock backend.
//!
//! `DomDriver` is the single low-level seam between the [`crate::Browser`]
//! facade and whatever actually renders the page. The default build ships
//! [`MockDom`], an in-memory document used by unit tests; the `browser`
//! feature adds a CDP-backed implementation.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::locator::Strategy;
use crate::result::RecorrerError;

/// Opaque handle to a resolved element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub u64);

/// Errors reported by a [`DomDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// No element matched
    NoSuchElement {
        /// What was looked up
        detail: String,
    },
    /// The element handle no longer points at a live node
    StaleElement {
        /// Handle description
        detail: String,
    },
    /// Pointer move failed because the element is outside the viewport
    MoveTargetOutOfBounds {
        /// Handle description
        detail: String,
    },
    /// No alert is currently open
    NoAlert,
    /// Script evaluation failed
    Script {
        /// Error message
        message: String,
    },
    /// Any other backend failure
    Backend {
        /// Error message
        message: String,
    },
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchElement { detail } => write!(f, "no such element: {detail}"),
            Self::StaleElement { detail } => write!(f, "stale element: {detail}"),
            Self::MoveTargetOutOfBounds { detail } => {
                write!(f, "move target out of bounds: {detail}")
            }
            Self::NoAlert => write!(f, "no alert present"),
            Self::Script { message } => write!(f, "script failed: {message}"),
            Self::Backend { message } => write!(f, "backend failure: {message}"),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<DriverError> for RecorrerError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NoSuchElement { detail } => Self::ElementNotFound { locator: detail },
            DriverError::StaleElement { detail } => Self::StaleElement { locator: detail },
            DriverError::MoveTargetOutOfBounds { detail } => {
                Self::MoveTargetOutOfBounds { locator: detail }
            }
            DriverError::NoAlert => Self::NoAlert,
            DriverError::Script { message } => Self::Script { message },
            DriverError::Backend { message } => Self::Driver { message },
        }
    }
}

/// Abstract driver for DOM interaction.
///
/// Implementations must be cheap to call; all waiting, retrying and
/// scoping policy lives in [`crate::Browser`].
pub trait DomDriver: Send + Sync {
    /// Find elements matching the expression, optionally under a scope node.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] on backend failure; an empty result is
    /// not an error.
    fn find(
        &self,
        scope: Option<ElementHandle>,
        strategy: Strategy,
        expression: &str,
    ) -> Result<Vec<ElementHandle>, DriverError>;

    /// Whether the element is rendered and visible
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn is_displayed(&self, element: ElementHandle) -> Result<bool, DriverError>;

    /// Element tag name, lowercase
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn tag_name(&self, element: ElementHandle) -> Result<String, DriverError>;

    /// Visible text content
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn text(&self, element: ElementHandle) -> Result<String, DriverError>;

    /// Attribute value, `None` when absent
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn attribute(&self, element: ElementHandle, name: &str)
        -> Result<Option<String>, DriverError>;

    /// Set an attribute value
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn set_attribute(
        &self,
        element: ElementHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DriverError>;

    /// Click the element
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn click(&self, element: ElementHandle) -> Result<(), DriverError>;

    /// Clear an input element
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn clear(&self, element: ElementHandle) -> Result<(), DriverError>;

    /// Type text into the element
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn send_keys(&self, element: ElementHandle, text: &str) -> Result<(), DriverError>;

    /// Move the pointer onto the element
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::MoveTargetOutOfBounds`] when the element is
    /// outside the viewport.
    fn move_pointer_to(&self, element: ElementHandle) -> Result<(), DriverError>;

    /// Scroll the element into the viewport
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is stale.
    fn scroll_into_view(&self, element: ElementHandle) -> Result<(), DriverError>;

    /// Evaluate a script in the page, returning its JSON result
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Script`] when evaluation fails.
    fn execute_script(&self, script: &str, args: &[Value]) -> Result<Value, DriverError>;

    /// Navigate to a URL
    ///
    /// # Errors
    ///
    /// Returns an error if navigation fails.
    fn goto(&self, url: &str) -> Result<(), DriverError>;

    /// Current page URL
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn current_url(&self) -> Result<String, DriverError>;

    /// Reload the current page
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn refresh(&self) -> Result<(), DriverError>;

    /// Text of the open alert
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NoAlert`] when no alert is open.
    fn alert_text(&self) -> Result<String, DriverError>;

    /// Accept the open alert
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NoAlert`] when no alert is open.
    fn alert_accept(&self) -> Result<(), DriverError>;

    /// Dismiss the open alert
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NoAlert`] when no alert is open.
    fn alert_dismiss(&self) -> Result<(), DriverError>;

    /// Type into the open alert prompt
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NoAlert`] when no alert is open.
    fn alert_send_keys(&self, text: &str) -> Result<(), DriverError>;

    /// Terminate the browser session
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn quit(&self) -> Result<(), DriverError>;
}

// ============================================================================
// Mock backend
// ============================================================================

#[derive(Debug)]
struct MockNode {
    tag: String,
    attrs: BTreeMap<String, String>,
    text: String,
    displayed: bool,
    selectors: Vec<(Strategy, String)>,
    parent: Option<u64>,
    present: bool,
    stale_remaining: u32,
}

#[derive(Debug, Default)]
struct MockState {
    nodes: BTreeMap<u64, MockNode>,
    next_id: u64,
    script_defaults: BTreeMap<String, Value>,
    script_queue: BTreeMap<String, VecDeque<Value>>,
    alerts: VecDeque<String>,
    prompt_inputs: Vec<String>,
    url: String,
    query_log: Vec<String>,
    clicks: Vec<u64>,
    moves: Vec<u64>,
    typed: Vec<(u64, String)>,
    out_of_bounds: HashSet<u64>,
    unscrollable: HashSet<u64>,
    scrolled: HashSet<u64>,
    quit_count: u32,
}

/// Declarative description of a mock element
#[derive(Debug, Clone)]
pub struct MockElement {
    tag: String,
    selectors: Vec<(Strategy, String)>,
    attrs: BTreeMap<String, String>,
    text: String,
    displayed: bool,
    parent: Option<ElementHandle>,
}

impl MockElement {
    /// Create a mock element with the given tag
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            selectors: Vec::new(),
            attrs: BTreeMap::new(),
            text: String::new(),
            displayed: true,
            parent: None,
        }
    }

    /// Register a CSS selector this element answers to
    #[must_use]
    pub fn css(mut self, selector: impl Into<String>) -> Self {
        self.selectors.push((Strategy::Css, selector.into()));
        self
    }

    /// Register an XPath expression this element answers to
    #[must_use]
    pub fn xpath(mut self, expression: impl Into<String>) -> Self {
        self.selectors.push((Strategy::XPath, expression.into()));
        self
    }

    /// Set an attribute
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.attrs.insert(name.into(), value.into());
        self
    }

    /// Set the text content
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Set visibility (default: displayed)
    #[must_use]
    pub const fn displayed(mut self, displayed: bool) -> Self {
        self.displayed = displayed;
        self
    }

    /// Attach under a parent element
    #[must_use]
    pub const fn child_of(mut self, parent: ElementHandle) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// In-memory DOM used by unit tests.
///
/// Elements answer to the selectors registered on them plus a few
/// structural shortcuts (tag name, `#id`, `.class`, `id`/`name`/`class`
/// strategies). Stale handles, out-of-viewport targets, canned script
/// results and alert queues can all be injected.
#[derive(Debug, Default)]
pub struct MockDom {
    state: Mutex<MockState>,
}

impl MockDom {
    /// Create an empty mock document
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element, returning its handle
    pub fn add_element(&self, element: MockElement) -> ElementHandle {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.next_id += 1;
        let id = state.next_id;
        state.nodes.insert(
            id,
            MockNode {
                tag: element.tag,
                attrs: element.attrs,
                text: element.text,
                displayed: element.displayed,
                selectors: element.selectors,
                parent: element.parent.map(|p| p.0),
                present: true,
                stale_remaining: 0,
            },
        );
        ElementHandle(id)
    }

    /// Make the next `times` operations on the element fail as stale
    pub fn make_stale(&self, element: ElementHandle, times: u32) {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(node) = state.nodes.get_mut(&element.0) {
            node.stale_remaining = times;
        }
    }

    /// Detach the element from the document
    pub fn detach(&self, element: ElementHandle) {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(node) = state.nodes.get_mut(&element.0) {
            node.present = false;
        }
    }

    /// Change the element's visibility
    pub fn set_displayed(&self, element: ElementHandle, displayed: bool) {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(node) = state.nodes.get_mut(&element.0) {
            node.displayed = displayed;
        }
    }

    /// Update the element's text content
    pub fn set_text(&self, element: ElementHandle, text: impl Into<String>) {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(node) = state.nodes.get_mut(&element.0) {
            node.text = text.into();
        }
    }

    /// Pointer moves onto the element fail until it is scrolled into view
    pub fn mark_out_of_bounds(&self, element: ElementHandle) {
        let mut state = self.state.lock().expect("mock state poisoned");
        let _ = state.out_of_bounds.insert(element.0);
    }

    /// Pointer moves keep failing even after scrolling
    pub fn mark_unscrollable(&self, element: ElementHandle) {
        let mut state = self.state.lock().expect("mock state poisoned");
        let _ = state.out_of_bounds.insert(element.0);
        let _ = state.unscrollable.insert(element.0);
    }

    /// Set the persistent result for a script
    pub fn set_script_result(&self, script: impl Into<String>, result: Value) {
        let mut state = self.state.lock().expect("mock state poisoned");
        let _ = state.script_defaults.insert(script.into(), result);
    }

    /// Queue a one-shot result for a script; queued results are consumed
    /// before the persistent one
    pub fn push_script_result(&self, script: impl Into<String>, result: Value) {
        let mut state = self.state.lock().expect("mock state poisoned");
        state
            .script_queue
            .entry(script.into())
            .or_default()
            .push_back(result);
    }

    /// Open an alert with the given text
    pub fn push_alert(&self, text: impl Into<String>) {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.alerts.push_back(text.into());
    }

    /// All find queries issued so far
    #[must_use]
    pub fn query_log(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .query_log
            .clone()
    }

    /// Elements clicked so far
    #[must_use]
    pub fn clicks(&self) -> Vec<ElementHandle> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .clicks
            .iter()
            .map(|id| ElementHandle(*id))
            .collect()
    }

    /// Elements the pointer successfully moved onto
    #[must_use]
    pub fn moves(&self) -> Vec<ElementHandle> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .moves
            .iter()
            .map(|id| ElementHandle(*id))
            .collect()
    }

    /// Text typed so far, per element
    #[must_use]
    pub fn typed(&self) -> Vec<(ElementHandle, String)> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .typed
            .iter()
            .map(|(id, text)| (ElementHandle(*id), text.clone()))
            .collect()
    }

    /// Text typed into alert prompts
    #[must_use]
    pub fn prompt_inputs(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .prompt_inputs
            .clone()
    }

    /// Whether the element was scrolled into view
    #[must_use]
    pub fn was_scrolled(&self, element: ElementHandle) -> bool {
        self.state
            .lock()
            .expect("mock state poisoned")
            .scrolled
            .contains(&element.0)
    }

    /// How many times the session was terminated
    #[must_use]
    pub fn quit_count(&self) -> u32 {
        self.state.lock().expect("mock state poisoned").quit_count
    }

    fn check_live(state: &mut MockState, element: ElementHandle) -> Result<(), DriverError> {
        let node = state
            .nodes
            .get_mut(&element.0)
            .ok_or(DriverError::NoSuchElement {
                detail: format!("element#{}", element.0),
            })?;
        if node.stale_remaining > 0 {
            node.stale_remaining -= 1;
            return Err(DriverError::StaleElement {
                detail: format!("element#{}", element.0),
            });
        }
        if !node.present {
            return Err(DriverError::StaleElement {
                detail: format!("element#{}", element.0),
            });
        }
        Ok(())
    }

    fn is_descendant(state: &MockState, node: u64, ancestor: u64) -> bool {
        let mut current = state.nodes.get(&node).and_then(|n| n.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = state.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn matches(node: &MockNode, strategy: Strategy, expression: &str) -> bool {
        if node
            .selectors
            .iter()
            .any(|(s, e)| *s == strategy && e == expression)
        {
            return true;
        }
        match strategy {
            Strategy::Tag => node.tag == expression,
            Strategy::Id => node.attrs.get("id").is_some_and(|v| v == expression),
            Strategy::Name => node.attrs.get("name").is_some_and(|v| v == expression),
            Strategy::Class => node
                .attrs
                .get("class")
                .is_some_and(|v| v.split_whitespace().any(|c| c == expression)),
            Strategy::Css => {
                if expression == node.tag {
                    return true;
                }
                if let Some(id) = expression.strip_prefix('#') {
                    return node.attrs.get("id").is_some_and(|v| v == id);
                }
                if let Some(class) = expression.strip_prefix('.') {
                    return node
                        .attrs
                        .get("class")
                        .is_some_and(|v| v.split_whitespace().any(|c| c == class));
                }
                false
            }
            Strategy::LinkText => node.tag == "a" && node.text == expression,
            Strategy::PartialLinkText => node.tag == "a" && node.text.contains(expression),
            Strategy::XPath => false,
        }
    }
}

impl DomDriver for MockDom {
    fn find(
        &self,
        scope: Option<ElementHandle>,
        strategy: Strategy,
        expression: &str,
    ) -> Result<Vec<ElementHandle>, DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.query_log.push(format!("{strategy}={expression}"));

        // Relative parent step, used for the option -> select special case
        if strategy == Strategy::XPath && expression == ".." {
            if let Some(scope) = scope {
                let parent = state.nodes.get(&scope.0).and_then(|n| n.parent);
                return Ok(parent.map(ElementHandle).into_iter().collect());
            }
            return Ok(vec![]);
        }

        let result = state
            .nodes
            .iter()
            .filter(|(id, node)| {
                node.present
                    && scope.map_or(true, |s| Self::is_descendant(&state, **id, s.0))
                    && Self::matches(node, strategy, expression)
            })
            .map(|(id, _)| ElementHandle(*id))
            .collect();
        Ok(result)
    }

    fn is_displayed(&self, element: ElementHandle) -> Result<bool, DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        Ok(state.nodes[&element.0].displayed)
    }

    fn tag_name(&self, element: ElementHandle) -> Result<String, DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        Ok(state.nodes[&element.0].tag.clone())
    }

    fn text(&self, element: ElementHandle) -> Result<String, DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        Ok(state.nodes[&element.0].text.clone())
    }

    fn attribute(
        &self,
        element: ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        Ok(state.nodes[&element.0].attrs.get(name).cloned())
    }

    fn set_attribute(
        &self,
        element: ElementHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        if let Some(node) = state.nodes.get_mut(&element.0) {
            let _ = node.attrs.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }

    fn click(&self, element: ElementHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        state.clicks.push(element.0);
        Ok(())
    }

    fn clear(&self, element: ElementHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        if let Some(node) = state.nodes.get_mut(&element.0) {
            let _ = node.attrs.insert("value".to_string(), String::new());
        }
        Ok(())
    }

    fn send_keys(&self, element: ElementHandle, text: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        if let Some(node) = state.nodes.get_mut(&element.0) {
            let value = node.attrs.entry("value".to_string()).or_default();
            value.push_str(text);
        }
        state.typed.push((element.0, text.to_string()));
        Ok(())
    }

    fn move_pointer_to(&self, element: ElementHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        if state.out_of_bounds.contains(&element.0)
            && (!state.scrolled.contains(&element.0) || state.unscrollable.contains(&element.0))
        {
            return Err(DriverError::MoveTargetOutOfBounds {
                detail: format!("element#{}", element.0),
            });
        }
        state.moves.push(element.0);
        Ok(())
    }

    fn scroll_into_view(&self, element: ElementHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        Self::check_live(&mut state, element)?;
        let _ = state.scrolled.insert(element.0);
        Ok(())
    }

    fn execute_script(&self, script: &str, _args: &[Value]) -> Result<Value, DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(queue) = state.script_queue.get_mut(script) {
            if let Some(result) = queue.pop_front() {
                return Ok(result);
            }
        }
        Ok(state
            .script_defaults
            .get(script)
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn goto(&self, url: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.url = url.to_string();
        Ok(())
    }

    fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.state.lock().expect("mock state poisoned").url.clone())
    }

    fn refresh(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn alert_text(&self) -> Result<String, DriverError> {
        let state = self.state.lock().expect("mock state poisoned");
        state.alerts.front().cloned().ok_or(DriverError::NoAlert)
    }

    fn alert_accept(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.alerts.pop_front().map(|_| ()).ok_or(DriverError::NoAlert)
    }

    fn alert_dismiss(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.alerts.pop_front().map(|_| ()).ok_or(DriverError::NoAlert)
    }

    fn alert_send_keys(&self, text: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if state.alerts.is_empty() {
            return Err(DriverError::NoAlert);
        }
        state.prompt_inputs.push(text.to_string());
        Ok(())
    }

    fn quit(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.quit_count += 1;
        state.alerts.clear();
        Ok(())
    }
}
