//! Widgets: addressable UI elements inside a view.
//!
//! A widget kind describes behavior (locator, read, fill); a bound widget
//! ties a kind to a browser and a parent locator chain. Widget declaration
//! happens on a view schema; binding and caching happen on view instances.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::browser::{Browser, QueryOptions, ScopedBrowser};
use crate::driver::ElementHandle;
use crate::locator::{quote_attr, Locate, Locator};
use crate::result::{RecorrerError, RecorrerResult};
use crate::wait::{wait_until, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};

/// Declarative behavior shared by every binding of a widget.
pub trait WidgetKind: Send + Sync {
    /// Locator of the widget's root element
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::NotImplemented`] when the kind has no
    /// locator of its own.
    fn locator(&self) -> RecorrerResult<Locator>;

    /// Short description used in error messages
    fn describe(&self) -> String;

    /// Read the widget's current value.
    ///
    /// # Errors
    ///
    /// Interactive kinds override this; the default is
    /// [`RecorrerError::NotImplemented`].
    fn read(&self, widget: &BoundWidget) -> RecorrerResult<Value> {
        let _ = widget;
        Err(RecorrerError::NotImplemented {
            widget: self.describe(),
            operation: "read".to_string(),
        })
    }

    /// Fill the widget with a value, reporting whether anything changed.
    ///
    /// # Errors
    ///
    /// Interactive kinds override this; the default is
    /// [`RecorrerError::NotImplemented`].
    fn fill(&self, widget: &BoundWidget, value: &Value) -> RecorrerResult<bool> {
        let _ = (widget, value);
        Err(RecorrerError::NotImplemented {
            widget: self.describe(),
            operation: "fill".to_string(),
        })
    }
}

/// A widget bound to a browser and a position in the DOM.
pub struct BoundWidget {
    kind: Arc<dyn WidgetKind>,
    browser: Arc<Browser>,
    parents: Vec<Locator>,
    name: String,
}

impl std::fmt::Debug for BoundWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundWidget")
            .field("name", &self.name)
            .field("kind", &self.kind.describe())
            .field("parents", &self.parents.len())
            .finish()
    }
}

impl BoundWidget {
    pub(crate) fn bind(
        kind: Arc<dyn WidgetKind>,
        browser: Arc<Browser>,
        parents: Vec<Locator>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            browser,
            parents,
            name: name.into(),
        }
    }

    /// Declared name of the widget on its view
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unscoped browser
    #[must_use]
    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    /// A browser proxy scoped to this widget's parent chain
    #[must_use]
    pub fn scoped_browser(&self) -> ScopedBrowser<'_> {
        self.browser.in_parent_context(self.parents.clone())
    }

    /// Resolve the widget to its root element in parent-view context
    ///
    /// # Errors
    ///
    /// Returns an error when the widget cannot be located.
    pub fn element(&self) -> RecorrerResult<ElementHandle> {
        let locator = self.kind.locator()?;
        self.scoped_browser().element(&locator, &QueryOptions::new())
    }

    /// Whether the widget is currently displayed
    ///
    /// # Errors
    ///
    /// See [`Browser::is_displayed`].
    pub fn is_displayed(&self) -> RecorrerResult<bool> {
        let locator = self.kind.locator()?;
        self.scoped_browser().is_displayed(&locator, &QueryOptions::new())
    }

    /// Wait until the widget is displayed (15s budget, 200ms cadence)
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::Timeout`] when the budget is exhausted.
    pub fn wait_displayed(&self) -> RecorrerResult<()> {
        self.wait_displayed_within(DEFAULT_WAIT_TIMEOUT)
    }

    /// Wait until the widget is displayed within an explicit budget
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::Timeout`] when the budget is exhausted.
    pub fn wait_displayed_within(&self, budget: Duration) -> RecorrerResult<()> {
        wait_until(budget, DEFAULT_POLL_INTERVAL, || {
            Ok(self.is_displayed()?.then_some(()))
        })
    }

    /// Move the pointer onto the widget
    ///
    /// # Errors
    ///
    /// See [`Browser::move_to_element`].
    pub fn move_to(&self) -> RecorrerResult<ElementHandle> {
        let locator = self.kind.locator()?;
        self.scoped_browser()
            .move_to_element(&locator, &QueryOptions::new())
    }

    /// Click the widget
    ///
    /// # Errors
    ///
    /// See [`Browser::click`].
    pub fn click(&self) -> RecorrerResult<()> {
        let locator = self.kind.locator()?;
        self.scoped_browser().click(&locator, &QueryOptions::new())
    }

    /// Text content of the widget's root element
    ///
    /// # Errors
    ///
    /// Returns an error when the widget cannot be located.
    pub fn text(&self) -> RecorrerResult<String> {
        let locator = self.kind.locator()?;
        self.scoped_browser().text(&locator, &QueryOptions::new())
    }

    /// Read the widget's value
    ///
    /// # Errors
    ///
    /// See [`WidgetKind::read`].
    pub fn read(&self) -> RecorrerResult<Value> {
        self.kind.read(self)
    }

    /// Fill the widget with a value
    ///
    /// # Errors
    ///
    /// See [`WidgetKind::fill`].
    pub fn fill(&self, value: &Value) -> RecorrerResult<bool> {
        self.kind.fill(self, value)
    }
}

impl Locate for BoundWidget {
    fn locator(&self) -> RecorrerResult<Locator> {
        self.kind.locator()
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Built-in widget kinds
// ============================================================================

/// `<input>`/`<textarea>` addressed by `name` (or `id`) attribute
#[derive(Debug, Clone)]
pub struct Input {
    names: Vec<String>,
    use_id: bool,
}

impl Input {
    /// Input matched by any of the given `name` attribute values
    #[must_use]
    pub fn named(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            use_id: false,
        }
    }

    /// Input matched by `id` instead of `name`
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            names: vec![id.into()],
            use_id: true,
        }
    }

    fn attr_tests(&self) -> String {
        let attr = if self.use_id { "id" } else { "name" };
        self.names
            .iter()
            .map(|name| format!("@{attr}={}", quote_attr(name)))
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

impl WidgetKind for Input {
    fn locator(&self) -> RecorrerResult<Locator> {
        Ok(Locator::xpath(format!(
            "//*[(self::input or self::textarea) and ({})]",
            self.attr_tests()
        )))
    }

    fn describe(&self) -> String {
        format!("Input({})", self.names.join("|"))
    }

    fn read(&self, widget: &BoundWidget) -> RecorrerResult<Value> {
        let locator = self.locator()?;
        let value = widget
            .scoped_browser()
            .get_attribute("value", &locator, &QueryOptions::new())?;
        Ok(Value::String(value.unwrap_or_default()))
    }

    fn fill(&self, widget: &BoundWidget, value: &Value) -> RecorrerResult<bool> {
        let text = value_as_text(value);
        let old = match self.read(widget)? {
            Value::String(s) => s,
            _ => String::new(),
        };
        if old == text {
            return Ok(false);
        }
        let locator = self.locator()?;
        let scoped = widget.scoped_browser();
        scoped.clear(&locator, &QueryOptions::new())?;
        scoped.send_keys(&text, &locator, &QueryOptions::new())?;
        Ok(true)
    }
}

/// `<input type="checkbox">` addressed by `name` (or `id`) attribute
#[derive(Debug, Clone)]
pub struct Checkbox {
    names: Vec<String>,
    use_id: bool,
}

impl Checkbox {
    /// Checkbox matched by any of the given `name` attribute values
    #[must_use]
    pub fn named(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            use_id: false,
        }
    }

    /// Checkbox matched by `id` instead of `name`
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            names: vec![id.into()],
            use_id: true,
        }
    }

    fn attr_tests(&self) -> String {
        let attr = if self.use_id { "id" } else { "name" };
        self.names
            .iter()
            .map(|name| format!("@{attr}={}", quote_attr(name)))
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

impl WidgetKind for Checkbox {
    fn locator(&self) -> RecorrerResult<Locator> {
        Ok(Locator::xpath(format!(
            "//input[@type=\"checkbox\" and ({})]",
            self.attr_tests()
        )))
    }

    fn describe(&self) -> String {
        format!("Checkbox({})", self.names.join("|"))
    }

    fn read(&self, widget: &BoundWidget) -> RecorrerResult<Value> {
        let locator = self.locator()?;
        let checked = widget
            .scoped_browser()
            .get_attribute("checked", &locator, &QueryOptions::new())?;
        Ok(Value::Bool(checked.as_deref() == Some("true")))
    }

    fn fill(&self, widget: &BoundWidget, value: &Value) -> RecorrerResult<bool> {
        let wanted = matches!(value, Value::Bool(true));
        let current = matches!(self.read(widget)?, Value::Bool(true));
        if wanted == current {
            return Ok(false);
        }
        widget
            .scoped_browser()
            .click(&self.locator()?, &QueryOptions::new())?;
        Ok(true)
    }
}

/// A `btn`-classed button or link, matched by its text or by one of the
/// allowed attributes (`title`, `alt`).
#[derive(Debug, Clone)]
pub struct Button {
    text: Option<String>,
    attr: Option<(String, String)>,
}

impl Button {
    const ALLOWED_ATTRS: [&'static str; 2] = ["title", "alt"];

    /// Button matched by its normalized text
    #[must_use]
    pub fn by_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attr: None,
        }
    }

    /// Button matched by an attribute value; only `title` and `alt` are
    /// allowed.
    ///
    /// # Errors
    ///
    /// Returns an error for a disallowed attribute name.
    pub fn by_attr(attr: impl Into<String>, value: impl Into<String>) -> RecorrerResult<Self> {
        let attr = attr.into();
        if !Self::ALLOWED_ATTRS.contains(&attr.as_str()) {
            return Err(RecorrerError::NotImplemented {
                widget: format!("Button[@{attr}]"),
                operation: "locator".to_string(),
            });
        }
        Ok(Self {
            text: None,
            attr: Some((attr, value.into())),
        })
    }
}

impl WidgetKind for Button {
    fn locator(&self) -> RecorrerResult<Locator> {
        let expression = match (&self.text, &self.attr) {
            (Some(text), _) => format!(
                "(//a | //button)[contains(@class, \"btn\") and normalize-space(.)={}]",
                quote_attr(text)
            ),
            (None, Some((attr, value))) => format!(
                "(//a | //button)[contains(@class, \"btn\") and @{attr}={}]",
                quote_attr(value)
            ),
            (None, None) => {
                return Err(RecorrerError::NotImplemented {
                    widget: "Button".to_string(),
                    operation: "locator".to_string(),
                })
            }
        };
        Ok(Locator::xpath(expression))
    }

    fn describe(&self) -> String {
        match (&self.text, &self.attr) {
            (Some(text), _) => format!("Button({text:?})"),
            (None, Some((attr, value))) => format!("Button[@{attr}={value:?}]"),
            (None, None) => "Button".to_string(),
        }
    }

    fn fill(&self, widget: &BoundWidget, value: &Value) -> RecorrerResult<bool> {
        let press = match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            _ => true,
        };
        if press {
            widget
                .scoped_browser()
                .click(&self.locator()?, &QueryOptions::new())?;
        }
        Ok(press)
    }
}

/// A read-only, clickable text fragment at a fixed locator
#[derive(Debug, Clone)]
pub struct Text {
    locator: Locator,
}

impl Text {
    /// Text widget at the given locator
    #[must_use]
    pub fn at(locator: impl Into<Locator>) -> Self {
        Self {
            locator: locator.into(),
        }
    }
}

impl WidgetKind for Text {
    fn locator(&self) -> RecorrerResult<Locator> {
        Ok(self.locator.clone())
    }

    fn describe(&self) -> String {
        format!("Text({})", self.locator.describe())
    }

    fn read(&self, widget: &BoundWidget) -> RecorrerResult<Value> {
        widget.text().map(Value::String)
    }
}

/// A single attribute of an element, readable and fillable
#[derive(Debug, Clone)]
pub struct AttributeValue {
    locator: Locator,
    attribute: String,
}

impl AttributeValue {
    /// Track `attribute` on the element at `locator`
    #[must_use]
    pub fn of(locator: impl Into<Locator>, attribute: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            attribute: attribute.into(),
        }
    }
}

impl WidgetKind for AttributeValue {
    fn locator(&self) -> RecorrerResult<Locator> {
        Ok(self.locator.clone())
    }

    fn describe(&self) -> String {
        format!("AttributeValue({}, @{})", self.locator.describe(), self.attribute)
    }

    fn read(&self, widget: &BoundWidget) -> RecorrerResult<Value> {
        let value = widget.scoped_browser().get_attribute(
            &self.attribute,
            &self.locator,
            &QueryOptions::new(),
        )?;
        Ok(value.map_or(Value::Null, Value::String))
    }

    fn fill(&self, widget: &BoundWidget, value: &Value) -> RecorrerResult<bool> {
        let wanted = value_as_text(value);
        let current = match self.read(widget)? {
            Value::String(s) => s,
            _ => String::new(),
        };
        if current == wanted {
            return Ok(false);
        }
        widget.scoped_browser().set_attribute(
            &self.attribute,
            &wanted,
            &self.locator,
            &QueryOptions::new(),
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DomDriver, MockDom, MockElement};
    use serde_json::json;

    fn bind(kind: impl WidgetKind + 'static, dom: &Arc<MockDom>) -> BoundWidget {
        let driver: Arc<dyn DomDriver> = Arc::clone(dom) as Arc<dyn DomDriver>;
        BoundWidget::bind(
            Arc::new(kind),
            Arc::new(Browser::new(driver)),
            vec![],
            "widget",
        )
    }

    mod locator_tests {
        use super::*;

        #[test]
        fn test_input_locator_by_name() {
            let input = Input::named(["user_name", "login"]);
            let locator = input.locator().unwrap();
            let Locator::Query { expression, .. } = locator else {
                panic!("expected a query locator");
            };
            assert!(expression.contains("@name=\"user_name\" or @name=\"login\""));
            assert!(expression.starts_with("//*[(self::input or self::textarea)"));
        }

        #[test]
        fn test_input_locator_by_id() {
            let input = Input::by_id("search");
            let Locator::Query { expression, .. } = input.locator().unwrap() else {
                panic!("expected a query locator");
            };
            assert!(expression.contains("@id=\"search\""));
        }

        #[test]
        fn test_checkbox_locator() {
            let checkbox = Checkbox::named(["remember_me"]);
            let Locator::Query { expression, .. } = checkbox.locator().unwrap() else {
                panic!("expected a query locator");
            };
            assert!(expression.contains("@type=\"checkbox\""));
            assert!(expression.contains("@name=\"remember_me\""));
        }

        #[test]
        fn test_button_by_text() {
            let button = Button::by_text("Reset");
            let Locator::Query { expression, .. } = button.locator().unwrap() else {
                panic!("expected a query locator");
            };
            assert!(expression.contains("normalize-space(.)=\"Reset\""));
        }

        #[test]
        fn test_button_by_disallowed_attr() {
            assert!(Button::by_attr("onclick", "x").is_err());
            assert!(Button::by_attr("title", "Reset the dashboard").is_ok());
        }
    }

    mod fill_read_tests {
        use super::*;

        #[test]
        fn test_input_fill_and_read() {
            let dom = Arc::new(MockDom::new());
            let input_kind = Input::named(["user_name"]);
            let xp = match input_kind.locator().unwrap() {
                Locator::Query { expression, .. } => expression,
                Locator::Element(_) => panic!("expected a query locator"),
            };
            let _ = dom.add_element(
                MockElement::new("input")
                    .xpath(xp.clone())
                    .attr("name", "user_name"),
            );
            let widget = bind(input_kind, &dom);

            assert!(widget.fill(&json!("admin")).unwrap());
            assert_eq!(widget.read().unwrap(), json!("admin"));
            // Same value again: no change
            assert!(!widget.fill(&json!("admin")).unwrap());
        }

        #[test]
        fn test_checkbox_fill_only_on_change() {
            let dom = Arc::new(MockDom::new());
            let kind = Checkbox::named(["remember_me"]);
            let xp = match kind.locator().unwrap() {
                Locator::Query { expression, .. } => expression,
                Locator::Element(_) => panic!("expected a query locator"),
            };
            let el = dom.add_element(
                MockElement::new("input")
                    .xpath(xp.clone())
                    .attr("type", "checkbox")
                    .attr("checked", "false"),
            );
            let widget = bind(kind, &dom);

            assert_eq!(widget.read().unwrap(), json!(false));
            assert!(widget.fill(&json!(true)).unwrap());
            assert_eq!(dom.clicks(), vec![el]);
            // Already unchecked: no click
            assert!(!widget.fill(&json!(false)).unwrap());
            assert_eq!(dom.clicks().len(), 1);
        }

        #[test]
        fn test_button_fill_clicks_on_truthy() {
            let dom = Arc::new(MockDom::new());
            let kind = Button::by_text("Reset");
            let xp = match kind.locator().unwrap() {
                Locator::Query { expression, .. } => expression,
                Locator::Element(_) => panic!("expected a query locator"),
            };
            let el = dom.add_element(
                MockElement::new("button")
                    .xpath(xp.clone())
                    .attr("class", "btn")
                    .text("Reset"),
            );
            let widget = bind(kind, &dom);

            assert!(!widget.fill(&json!(false)).unwrap());
            assert!(dom.clicks().is_empty());
            assert!(widget.fill(&json!(true)).unwrap());
            assert_eq!(dom.clicks(), vec![el]);
        }

        #[test]
        fn test_text_read() {
            let dom = Arc::new(MockDom::new());
            let _ = dom.add_element(MockElement::new("span").css("#status").text("Ready"));
            let widget = bind(Text::at("#status"), &dom);
            assert_eq!(widget.read().unwrap(), json!("Ready"));
        }

        #[test]
        fn test_text_fill_not_implemented() {
            let dom = Arc::new(MockDom::new());
            let widget = bind(Text::at("#status"), &dom);
            assert!(matches!(
                widget.fill(&json!("x")),
                Err(RecorrerError::NotImplemented { .. })
            ));
        }

        #[test]
        fn test_attribute_value_round_trip() {
            let dom = Arc::new(MockDom::new());
            let _ = dom.add_element(MockElement::new("div").css("#panel").attr("data-mode", "view"));
            let widget = bind(AttributeValue::of("#panel", "data-mode"), &dom);

            assert_eq!(widget.read().unwrap(), json!("view"));
            assert!(widget.fill(&json!("edit")).unwrap());
            assert_eq!(widget.read().unwrap(), json!("edit"));
            assert!(!widget.fill(&json!("edit")).unwrap());
        }
    }

    mod binding_tests {
        use super::*;

        #[test]
        fn test_widget_scoped_to_parents() {
            let dom = Arc::new(MockDom::new());
            let form = dom.add_element(MockElement::new("form").css("#login-form"));
            let inside = dom.add_element(MockElement::new("span").css("#status").child_of(form));
            let _outside = dom.add_element(MockElement::new("span").css("#status"));

            let driver: Arc<dyn DomDriver> = Arc::clone(&dom) as Arc<dyn DomDriver>;
            let widget = BoundWidget::bind(
                Arc::new(Text::at("#status")),
                Arc::new(Browser::new(driver)),
                vec![Locator::css("#login-form")],
                "status",
            );
            assert_eq!(widget.element().unwrap(), inside);
        }

        #[test]
        fn test_widget_is_displayed() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("span").css("#status"));
            let widget = bind(Text::at("#status"), &dom);

            assert!(widget.is_displayed().unwrap());
            dom.set_displayed(el, false);
            assert!(!widget.is_displayed().unwrap());
        }
    }
}
