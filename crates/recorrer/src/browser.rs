//! Browser facade: the single point of contact for element interaction.
//!
//! Wraps a [`DomDriver`] with the conveniences page objects rely on:
//! parent-scoped lookups, visibility filtering, stale-element retries,
//! scroll-into-view recovery, alert handling and page-readiness gating.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::driver::{DomDriver, DriverError, ElementHandle};
use crate::locator::{Locate, Locator};
use crate::plugin::{DefaultPlugin, PagePlugin};
use crate::result::{RecorrerError, RecorrerResult};
use crate::retry::RetryPolicy;
use crate::wait::wait_until;

/// Default page-readiness poll budget
pub const DEFAULT_PAGE_SAFE_BUDGET: Duration = Duration::from_secs(10);

/// Page-readiness poll cadence
pub const PAGE_SAFE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Cap on consecutive alert dismissals, so a misbehaving page cannot trap us
const MAX_ALERT_DISMISSALS: u32 = 32;

/// Events emitted around element lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    /// Fired before a locator query runs
    BeforeElementQuery {
        /// Locator description
        locator: String,
    },
    /// Fired once per element a query returned
    ElementFound {
        /// Locator description
        locator: String,
    },
    /// Fired when a single-element lookup came up empty
    ElementNotFound {
        /// Locator description
        locator: String,
    },
}

type EventHook = Box<dyn Fn(&BrowserEvent) + Send + Sync>;

/// Options controlling an element query
#[derive(Default, Clone)]
pub struct QueryOptions {
    /// Parent chain, nearest first; the first entry is resolved recursively
    /// in the context of the rest
    pub parents: Vec<Locator>,
    /// Drop elements that are not displayed
    pub check_visibility: bool,
    /// Do not emit [`BrowserEvent`]s for this query
    pub suppress_signals: bool,
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("parents", &self.parents.len())
            .field("check_visibility", &self.check_visibility)
            .field("suppress_signals", &self.suppress_signals)
            .finish()
    }
}

impl QueryOptions {
    /// Options with no parents and no filtering
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options scoped to a parent chain, nearest first
    #[must_use]
    pub fn within(parents: Vec<Locator>) -> Self {
        Self {
            parents,
            ..Self::default()
        }
    }

    /// Only return displayed elements
    #[must_use]
    pub fn visible_only(mut self) -> Self {
        self.check_visibility = true;
        self
    }

    /// Suppress signal emission
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.suppress_signals = true;
        self
    }
}

/// Options for [`Browser::handle_alert`]
#[derive(Debug, Clone)]
pub struct AlertOptions {
    /// Dismiss instead of accepting
    pub cancel: bool,
    /// How long to wait for the alert to appear; `None` disables waiting
    pub wait: Option<Duration>,
    /// Swallow errors during handling and report them as `Some(false)`
    pub squash: bool,
    /// Keys to type when the alert is a prompt
    pub prompt: Option<String>,
    /// Raise instead of returning `None` when no alert is present
    pub check_present: bool,
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            cancel: false,
            wait: Some(Duration::from_secs(30)),
            squash: false,
            prompt: None,
            check_present: false,
        }
    }
}

/// Strip the common leading whitespace from every non-blank line.
#[must_use]
pub fn dedent(script: &str) -> String {
    let indent = script
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = String::with_capacity(script.len());
    for (i, line) in script.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.len() >= indent {
            out.push_str(&line[indent..]);
        } else {
            out.push_str(line.trim_start());
        }
    }
    out.trim().to_string()
}

/// Thin adapter over a remote-controlled browser.
///
/// All element interaction in views, widgets and the navigator goes
/// through this type, so known backend issues (stale handles, elements
/// outside the viewport, busy pages) are mitigated in exactly one place.
pub struct Browser {
    driver: Arc<dyn DomDriver>,
    plugin: Arc<dyn PagePlugin>,
    stale_retry: RetryPolicy,
    page_safe_budget: Duration,
    hooks: Mutex<Vec<EventHook>>,
    product_version: Option<String>,
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("stale_retry", &self.stale_retry)
            .field("page_safe_budget", &self.page_safe_budget)
            .field("product_version", &self.product_version)
            .finish()
    }
}

impl Browser {
    /// Create a browser over the given driver with default policies
    #[must_use]
    pub fn new(driver: Arc<dyn DomDriver>) -> Self {
        Self {
            driver,
            plugin: Arc::new(DefaultPlugin),
            stale_retry: RetryPolicy::stale(),
            page_safe_budget: DEFAULT_PAGE_SAFE_BUDGET,
            hooks: Mutex::new(Vec::new()),
            product_version: None,
        }
    }

    /// Replace the readiness plugin
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn PagePlugin>) -> Self {
        self.plugin = plugin;
        self
    }

    /// Replace the stale-element retry policy
    #[must_use]
    pub const fn with_stale_retry(mut self, policy: RetryPolicy) -> Self {
        self.stale_retry = policy;
        self
    }

    /// Replace the default page-readiness budget
    #[must_use]
    pub const fn with_page_safe_budget(mut self, budget: Duration) -> Self {
        self.page_safe_budget = budget;
        self
    }

    /// Record the product version widgets may branch on
    #[must_use]
    pub fn with_product_version(mut self, version: impl Into<String>) -> Self {
        self.product_version = Some(version.into());
        self
    }

    /// The underlying driver
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn DomDriver> {
        &self.driver
    }

    /// Product version of the application under test, when known
    #[must_use]
    pub fn product_version(&self) -> Option<&str> {
        self.product_version.as_deref()
    }

    /// Register an event hook
    pub fn on_event(&self, hook: impl Fn(&BrowserEvent) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .expect("hook list poisoned")
            .push(Box::new(hook));
    }

    fn emit(&self, event: &BrowserEvent) {
        tracing::trace!(?event, "browser event");
        for hook in self.hooks.lock().expect("hook list poisoned").iter() {
            hook(event);
        }
    }

    fn describe(locator: &dyn Locate) -> String {
        locator
            .locator()
            .map_or_else(|_| "<unlocatable>".to_string(), |l| l.describe())
    }

    fn resolve_scope(&self, parents: &[Locator]) -> RecorrerResult<Option<ElementHandle>> {
        if parents.is_empty() {
            return Ok(None);
        }
        let rest = QueryOptions::within(parents[1..].to_vec()).silent();
        self.element(&parents[0], &rest).map(Some)
    }

    /// Resolve a locator to all matching elements.
    ///
    /// An already-resolved handle is returned as a singleton. When
    /// `check_visibility` is set, non-displayed elements are filtered out.
    ///
    /// # Errors
    ///
    /// Returns an error when the page never becomes safe, a parent cannot
    /// be resolved, or the backend fails.
    pub fn elements(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<Vec<ElementHandle>> {
        self.ensure_page_safe()?;
        let resolved = locator.locator()?;
        let description = resolved.describe();

        if !opts.suppress_signals {
            self.emit(&BrowserEvent::BeforeElementQuery {
                locator: description.clone(),
            });
        }

        let mut result = match resolved {
            Locator::Element(handle) => vec![handle],
            Locator::Query {
                strategy,
                expression,
            } => {
                let scope = self.resolve_scope(&opts.parents)?;
                self.driver.find(scope, strategy, &expression)?
            }
        };

        if opts.check_visibility {
            result.retain(|el| self.driver.is_displayed(*el).unwrap_or(false));
        }

        if !opts.suppress_signals {
            for _ in &result {
                self.emit(&BrowserEvent::ElementFound {
                    locator: description.clone(),
                });
            }
        }
        Ok(result)
    }

    /// Resolve a locator to a single element, preferring displayed ones
    /// when several match.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::ElementNotFound`] when nothing matches.
    pub fn element(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<ElementHandle> {
        let found = self.elements(locator, opts)?;
        let chosen = if found.len() > 1 {
            found
                .iter()
                .find(|el| self.driver.is_displayed(**el).unwrap_or(false))
                .or_else(|| found.first())
                .copied()
        } else {
            found.first().copied()
        };
        chosen.ok_or_else(|| {
            let description = Self::describe(locator);
            if !opts.suppress_signals {
                self.emit(&BrowserEvent::ElementNotFound {
                    locator: description.clone(),
                });
            }
            RecorrerError::ElementNotFound {
                locator: description,
            }
        })
    }

    /// Whether the located element is displayed.
    ///
    /// Missing elements and move targets out of bounds read as `false`.
    /// Stale handles are retried per the browser's retry policy, unless
    /// the locator is itself a raw handle that cannot be re-resolved.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::StaleElement`] when retries are exhausted.
    pub fn is_displayed(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<bool> {
        let raw_handle = locator.locator().map(|l| l.is_element()).unwrap_or(false);
        let mut probe_opts = opts.clone();
        probe_opts.check_visibility = false;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .move_to_element(locator, &probe_opts)
                .and_then(|el| self.driver.is_displayed(el).map_err(RecorrerError::from));
            match outcome {
                Ok(displayed) => return Ok(displayed),
                Err(err) if err.is_recoverable() => return Ok(false),
                Err(RecorrerError::StaleElement { locator: detail }) => {
                    if raw_handle || attempt >= self.stale_retry.max_attempts {
                        return Err(RecorrerError::StaleElement { locator: detail });
                    }
                    std::thread::sleep(self.stale_retry.delay_for(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Move the pointer onto the element.
    ///
    /// `<option>` elements are special-cased: the move targets the
    /// enclosing `<select>`. An out-of-bounds target is scrolled into view
    /// and retried once; a second failure is an error.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::MoveTargetOutOfBounds`] when the element
    /// stays unreachable.
    pub fn move_to_element(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<ElementHandle> {
        let el = self.element(locator, opts)?;

        if self.driver.tag_name(el)? == "option" {
            let parent_opts = QueryOptions::within(vec![Locator::Element(el)]).silent();
            if let Ok(parent) = self.element(&Locator::xpath(".."), &parent_opts) {
                if self.driver.tag_name(parent)? == "select" {
                    self.driver.move_pointer_to(parent)?;
                    return Ok(el);
                }
            }
        }

        match self.driver.move_pointer_to(el) {
            Ok(()) => Ok(el),
            Err(DriverError::MoveTargetOutOfBounds { .. }) => {
                self.driver.scroll_into_view(el)?;
                self.driver.move_pointer_to(el).map_err(|_| {
                    RecorrerError::MoveTargetOutOfBounds {
                        locator: Self::describe(locator),
                    }
                })?;
                Ok(el)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Evaluate a script in the page after dedenting it.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::Script`] when evaluation fails.
    pub fn execute_script(&self, script: &str, args: &[Value]) -> RecorrerResult<Value> {
        Ok(self.driver.execute_script(&dedent(script), args)?)
    }

    /// Move to the element and click it, then wait for the page to settle.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be reached or the page
    /// never settles.
    pub fn click(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<()> {
        let el = self.move_to_element(locator, opts)?;
        self.driver.click(el)?;
        self.ensure_page_safe()
    }

    /// Clear an input element.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be resolved.
    pub fn clear(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<()> {
        let el = self.element(locator, opts)?;
        Ok(self.driver.clear(el)?)
    }

    /// Move to the element and type into it.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be reached.
    pub fn send_keys(
        &self,
        text: &str,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<()> {
        let el = self.move_to_element(locator, opts)?;
        Ok(self.driver.send_keys(el, text)?)
    }

    /// Element text content.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be resolved.
    pub fn text(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<String> {
        let el = self.element(locator, opts)?;
        Ok(self.driver.text(el)?)
    }

    /// Element tag name.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be resolved.
    pub fn tag(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<String> {
        let el = self.element(locator, opts)?;
        Ok(self.driver.tag_name(el)?)
    }

    /// CSS classes attached to the element.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be resolved.
    pub fn classes(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<BTreeSet<String>> {
        let class_attr = self.get_attribute("class", locator, opts)?;
        Ok(class_attr
            .map(|value| {
                value
                    .split_whitespace()
                    .map(ToString::to_string)
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default())
    }

    /// Attribute value of the element, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be resolved.
    pub fn get_attribute(
        &self,
        name: &str,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<Option<String>> {
        let el = self.element(locator, opts)?;
        Ok(self.driver.attribute(el, name)?)
    }

    /// Set an attribute on the element.
    ///
    /// # Errors
    ///
    /// Returns an error when the element cannot be resolved.
    pub fn set_attribute(
        &self,
        name: &str,
        value: &str,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<()> {
        let el = self.element(locator, opts)?;
        Ok(self.driver.set_attribute(el, name, value)?)
    }

    /// Navigate to a URL.
    ///
    /// # Errors
    ///
    /// Returns an error when navigation fails.
    pub fn open(&self, url: &str) -> RecorrerResult<()> {
        tracing::debug!(url, "opening");
        Ok(self.driver.goto(url)?)
    }

    /// Current page URL.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn current_url(&self) -> RecorrerResult<String> {
        Ok(self.driver.current_url()?)
    }

    /// Reload the current page.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn refresh(&self) -> RecorrerResult<()> {
        Ok(self.driver.refresh()?)
    }

    /// Terminate the underlying browser session.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn quit(&self) -> RecorrerResult<()> {
        tracing::debug!("quitting browser session");
        Ok(self.driver.quit()?)
    }

    /// Whether an alert is currently open.
    #[must_use]
    pub fn is_alert_present(&self) -> bool {
        self.driver.alert_text().is_ok()
    }

    /// Dismiss alerts until none remain. Useful when an alert pops up
    /// several times in a row.
    pub fn dismiss_any_alerts(&self) {
        for _ in 0..MAX_ALERT_DISMISSALS {
            match self.driver.alert_dismiss() {
                Ok(()) => tracing::debug!("dismissed an alert"),
                Err(_) => break,
            }
        }
    }

    /// Handle an alert popup.
    ///
    /// Returns `Some(true)` when the alert was handled, `None` when no
    /// alert was present, and `Some(false)` when an error was squashed.
    ///
    /// # Errors
    ///
    /// Returns an error when the alert never appears (with `wait`), when
    /// `check_present` is set and no alert exists, or on backend failure
    /// without `squash`.
    pub fn handle_alert(&self, opts: &AlertOptions) -> RecorrerResult<Option<bool>> {
        let attempt = || -> RecorrerResult<Option<bool>> {
            if let Some(budget) = opts.wait {
                wait_until(budget, PAGE_SAFE_POLL_INTERVAL, || {
                    Ok(self.is_alert_present().then_some(()))
                })?;
            }
            match self.driver.alert_text() {
                Ok(text) => tracing::debug!(alert = %text, "handling alert"),
                Err(DriverError::NoAlert) => {
                    if opts.check_present {
                        return Err(RecorrerError::NoAlert);
                    }
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
            if let Some(keys) = &opts.prompt {
                self.driver.alert_send_keys(keys)?;
            }
            if opts.cancel {
                self.driver.alert_dismiss()?;
            } else {
                self.driver.alert_accept()?;
            }
            self.dismiss_any_alerts();
            Ok(Some(true))
        };

        match attempt() {
            Ok(outcome) => Ok(outcome),
            Err(RecorrerError::NoAlert) if opts.check_present => Err(RecorrerError::NoAlert),
            Err(_) if opts.squash => Ok(Some(false)),
            Err(err) => Err(err),
        }
    }

    /// Wait for the page to become safe within the default budget.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::PageNotSafe`] when the budget is exhausted.
    pub fn ensure_page_safe(&self) -> RecorrerResult<()> {
        self.ensure_page_safe_within(self.page_safe_budget)
    }

    /// Wait for the page to become safe within an explicit budget,
    /// polling the plugin at a 200ms cadence.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::PageNotSafe`] when the budget is exhausted.
    pub fn ensure_page_safe_within(&self, budget: Duration) -> RecorrerResult<()> {
        self.dismiss_any_alerts();
        let plugin = Arc::clone(&self.plugin);
        wait_until(budget, PAGE_SAFE_POLL_INTERVAL, || {
            Ok(plugin.check_page_ready(self)?.then_some(()))
        })
        .map_err(|err| match err {
            RecorrerError::Timeout { ms } => RecorrerError::PageNotSafe { ms },
            other => other,
        })
    }

    /// A browser view scoped to a parent chain: every query-taking method
    /// on the returned proxy resolves in the context of `parents`.
    #[must_use]
    pub fn in_parent_context(&self, parents: Vec<Locator>) -> ScopedBrowser<'_> {
        ScopedBrowser {
            browser: self,
            parents,
        }
    }
}

/// A [`Browser`] proxy that already knows its position in the DOM.
///
/// Widgets use this so their element lookups are automatically scoped to
/// the parent widget/view chain.
#[derive(Debug)]
pub struct ScopedBrowser<'a> {
    browser: &'a Browser,
    parents: Vec<Locator>,
}

impl ScopedBrowser<'_> {
    /// The wrapped browser
    #[must_use]
    pub fn browser(&self) -> &Browser {
        self.browser
    }

    /// The injected parent chain, nearest first
    #[must_use]
    pub fn parents(&self) -> &[Locator] {
        &self.parents
    }

    fn scoped(&self, opts: &QueryOptions) -> QueryOptions {
        let mut merged = opts.clone();
        merged.parents.extend(self.parents.iter().cloned());
        merged
    }

    /// Scoped [`Browser::elements`]
    ///
    /// # Errors
    ///
    /// See [`Browser::elements`].
    pub fn elements(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<Vec<ElementHandle>> {
        self.browser.elements(locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::element`]
    ///
    /// # Errors
    ///
    /// See [`Browser::element`].
    pub fn element(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<ElementHandle> {
        self.browser.element(locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::is_displayed`]
    ///
    /// # Errors
    ///
    /// See [`Browser::is_displayed`].
    pub fn is_displayed(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<bool> {
        self.browser.is_displayed(locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::move_to_element`]
    ///
    /// # Errors
    ///
    /// See [`Browser::move_to_element`].
    pub fn move_to_element(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<ElementHandle> {
        self.browser.move_to_element(locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::click`]
    ///
    /// # Errors
    ///
    /// See [`Browser::click`].
    pub fn click(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<()> {
        self.browser.click(locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::clear`]
    ///
    /// # Errors
    ///
    /// See [`Browser::clear`].
    pub fn clear(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<()> {
        self.browser.clear(locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::send_keys`]
    ///
    /// # Errors
    ///
    /// See [`Browser::send_keys`].
    pub fn send_keys(
        &self,
        text: &str,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<()> {
        self.browser.send_keys(text, locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::text`]
    ///
    /// # Errors
    ///
    /// See [`Browser::text`].
    pub fn text(&self, locator: &dyn Locate, opts: &QueryOptions) -> RecorrerResult<String> {
        self.browser.text(locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::get_attribute`]
    ///
    /// # Errors
    ///
    /// See [`Browser::get_attribute`].
    pub fn get_attribute(
        &self,
        name: &str,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<Option<String>> {
        self.browser.get_attribute(name, locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::set_attribute`]
    ///
    /// # Errors
    ///
    /// See [`Browser::set_attribute`].
    pub fn set_attribute(
        &self,
        name: &str,
        value: &str,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<()> {
        self.browser
            .set_attribute(name, value, locator, &self.scoped(opts))
    }

    /// Scoped [`Browser::classes`]
    ///
    /// # Errors
    ///
    /// See [`Browser::classes`].
    pub fn classes(
        &self,
        locator: &dyn Locate,
        opts: &QueryOptions,
    ) -> RecorrerResult<BTreeSet<String>> {
        self.browser.classes(locator, &self.scoped(opts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockDom, MockElement};
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn browser_over(dom: &Arc<MockDom>) -> Browser {
        let driver: Arc<dyn DomDriver> = Arc::clone(dom) as Arc<dyn DomDriver>;
        // Keep retry delays short so tests stay fast
        Browser::new(driver).with_stale_retry(RetryPolicy::new(10, Duration::from_millis(1)))
    }

    mod element_tests {
        use super::*;

        #[test]
        fn test_elements_visibility_filter() {
            let dom = Arc::new(MockDom::new());
            let shown = dom.add_element(MockElement::new("a").css(".item"));
            let _hidden = dom.add_element(MockElement::new("a").css(".item").displayed(false));
            let browser = browser_over(&dom);

            let all = browser
                .elements(&Locator::css(".item"), &QueryOptions::new())
                .unwrap();
            assert_eq!(all.len(), 2);

            let visible = browser
                .elements(&Locator::css(".item"), &QueryOptions::new().visible_only())
                .unwrap();
            assert_eq!(visible, vec![shown]);
        }

        #[test]
        fn test_element_prefers_displayed() {
            let dom = Arc::new(MockDom::new());
            let _hidden = dom.add_element(MockElement::new("a").css(".item").displayed(false));
            let shown = dom.add_element(MockElement::new("a").css(".item"));
            let browser = browser_over(&dom);

            let el = browser
                .element(&Locator::css(".item"), &QueryOptions::new())
                .unwrap();
            assert_eq!(el, shown);
        }

        #[test]
        fn test_element_not_found() {
            let dom = Arc::new(MockDom::new());
            let browser = browser_over(&dom);
            let result = browser.element(&Locator::css("#missing"), &QueryOptions::new());
            assert!(matches!(
                result,
                Err(RecorrerError::ElementNotFound { .. })
            ));
        }

        #[test]
        fn test_raw_handle_passthrough() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("div"));
            let browser = browser_over(&dom);

            let found = browser
                .elements(&Locator::Element(el), &QueryOptions::new())
                .unwrap();
            assert_eq!(found, vec![el]);
        }

        #[test]
        fn test_parent_scoping() {
            let dom = Arc::new(MockDom::new());
            let menu = dom.add_element(MockElement::new("nav").css("#menu"));
            let inside = dom.add_element(MockElement::new("a").css(".item").child_of(menu));
            let _outside = dom.add_element(MockElement::new("a").css(".item"));
            let browser = browser_over(&dom);

            let found = browser
                .elements(
                    &Locator::css(".item"),
                    &QueryOptions::within(vec![Locator::css("#menu")]),
                )
                .unwrap();
            assert_eq!(found, vec![inside]);
        }
    }

    mod signal_tests {
        use super::*;

        #[test]
        fn test_signals_fire_per_element() {
            let dom = Arc::new(MockDom::new());
            let _ = dom.add_element(MockElement::new("a").css(".item"));
            let _ = dom.add_element(MockElement::new("a").css(".item"));
            let browser = browser_over(&dom);

            let queries = Arc::new(AtomicUsize::new(0));
            let found = Arc::new(AtomicUsize::new(0));
            let q = Arc::clone(&queries);
            let f = Arc::clone(&found);
            browser.on_event(move |event| match event {
                BrowserEvent::BeforeElementQuery { .. } => {
                    let _ = q.fetch_add(1, Ordering::SeqCst);
                }
                BrowserEvent::ElementFound { .. } => {
                    let _ = f.fetch_add(1, Ordering::SeqCst);
                }
                BrowserEvent::ElementNotFound { .. } => {}
            });

            let _ = browser
                .elements(&Locator::css(".item"), &QueryOptions::new())
                .unwrap();
            assert_eq!(queries.load(Ordering::SeqCst), 1);
            assert_eq!(found.load(Ordering::SeqCst), 2);
        }

        #[test]
        fn test_suppressed_signals() {
            let dom = Arc::new(MockDom::new());
            let _ = dom.add_element(MockElement::new("a").css(".item"));
            let browser = browser_over(&dom);

            let count = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&count);
            browser.on_event(move |_| {
                let _ = c.fetch_add(1, Ordering::SeqCst);
            });

            let _ = browser
                .elements(&Locator::css(".item"), &QueryOptions::new().silent())
                .unwrap();
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn test_not_found_signal() {
            let dom = Arc::new(MockDom::new());
            let browser = browser_over(&dom);

            let misses = Arc::new(AtomicUsize::new(0));
            let m = Arc::clone(&misses);
            browser.on_event(move |event| {
                if matches!(event, BrowserEvent::ElementNotFound { .. }) {
                    let _ = m.fetch_add(1, Ordering::SeqCst);
                }
            });

            let _ = browser.element(&Locator::css("#missing"), &QueryOptions::new());
            assert_eq!(misses.load(Ordering::SeqCst), 1);
        }
    }

    mod displayed_tests {
        use super::*;

        #[test]
        fn test_missing_element_reads_false() {
            let dom = Arc::new(MockDom::new());
            let browser = browser_over(&dom);
            assert!(!browser
                .is_displayed(&Locator::css("#missing"), &QueryOptions::new())
                .unwrap());
        }

        #[test]
        fn test_stale_element_retries_to_success() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("button").css("#b"));
            dom.make_stale(el, 3);
            let browser = browser_over(&dom);

            assert!(browser
                .is_displayed(&Locator::css("#b"), &QueryOptions::new())
                .unwrap());
        }

        #[test]
        fn test_exhausted_retries_raise() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("button").css("#b"));
            dom.make_stale(el, 50);
            let browser = browser_over(&dom);

            let result = browser.is_displayed(&Locator::css("#b"), &QueryOptions::new());
            assert!(matches!(result, Err(RecorrerError::StaleElement { .. })));
        }

        #[test]
        fn test_raw_handle_is_not_retried() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("button").css("#b"));
            dom.make_stale(el, 1);
            let browser = browser_over(&dom);

            let result = browser.is_displayed(&Locator::Element(el), &QueryOptions::new());
            assert!(matches!(result, Err(RecorrerError::StaleElement { .. })));
        }
    }

    mod move_tests {
        use super::*;

        #[test]
        fn test_out_of_bounds_recovered_by_scroll() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("button").css("#b"));
            dom.mark_out_of_bounds(el);
            let browser = browser_over(&dom);

            let moved = browser
                .move_to_element(&Locator::css("#b"), &QueryOptions::new())
                .unwrap();
            assert_eq!(moved, el);
            assert!(dom.was_scrolled(el));
        }

        #[test]
        fn test_second_failure_raises() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("button").css("#b"));
            dom.mark_unscrollable(el);
            let browser = browser_over(&dom);

            let result = browser.move_to_element(&Locator::css("#b"), &QueryOptions::new());
            assert!(matches!(
                result,
                Err(RecorrerError::MoveTargetOutOfBounds { .. })
            ));
        }

        #[test]
        fn test_option_moves_to_enclosing_select() {
            let dom = Arc::new(MockDom::new());
            let select = dom.add_element(MockElement::new("select").css("#choices"));
            let option = dom.add_element(
                MockElement::new("option").css("#choices-item").child_of(select),
            );
            let browser = browser_over(&dom);

            let moved = browser
                .move_to_element(&Locator::css("#choices-item"), &QueryOptions::new())
                .unwrap();
            assert_eq!(moved, option);
            assert_eq!(dom.moves(), vec![select]);
        }
    }

    mod script_tests {
        use super::*;

        #[test]
        fn test_scripts_are_dedented() {
            let dom = Arc::new(MockDom::new());
            dom.set_script_result("return document.title;", json!("Dashboard"));
            let browser = browser_over(&dom);

            let result = browser
                .execute_script("            return document.title;", &[])
                .unwrap();
            assert_eq!(result, json!("Dashboard"));
        }

        #[test]
        fn test_dedent_multiline() {
            let script = "\n    if (x) {\n        y();\n    }\n";
            assert_eq!(dedent(script), "if (x) {\n    y();\n}");
        }
    }

    mod interaction_tests {
        use super::*;

        #[test]
        fn test_click_moves_and_clicks() {
            let dom = Arc::new(MockDom::new());
            let el = dom.add_element(MockElement::new("button").css("#go"));
            let browser = browser_over(&dom);

            browser.click(&Locator::css("#go"), &QueryOptions::new()).unwrap();
            assert_eq!(dom.clicks(), vec![el]);
            assert_eq!(dom.moves(), vec![el]);
        }

        #[test]
        fn test_send_keys_and_clear() {
            let dom = Arc::new(MockDom::new());
            let _ = dom.add_element(MockElement::new("input").css("#user"));
            let browser = browser_over(&dom);
            let locator = Locator::css("#user");

            browser.send_keys("admin", &locator, &QueryOptions::new()).unwrap();
            assert_eq!(
                browser
                    .get_attribute("value", &locator, &QueryOptions::new())
                    .unwrap(),
                Some("admin".to_string())
            );

            browser.clear(&locator, &QueryOptions::new()).unwrap();
            assert_eq!(
                browser
                    .get_attribute("value", &locator, &QueryOptions::new())
                    .unwrap(),
                Some(String::new())
            );
        }

        #[test]
        fn test_classes() {
            let dom = Arc::new(MockDom::new());
            let _ = dom.add_element(
                MockElement::new("button")
                    .css("#go")
                    .attr("class", "btn btn-primary"),
            );
            let browser = browser_over(&dom);

            let classes = browser
                .classes(&Locator::css("#go"), &QueryOptions::new())
                .unwrap();
            assert!(classes.contains("btn"));
            assert!(classes.contains("btn-primary"));
            assert_eq!(classes.len(), 2);
        }
    }

    mod alert_tests {
        use super::*;

        #[test]
        fn test_handle_alert_accepts() {
            let dom = Arc::new(MockDom::new());
            dom.push_alert("Proceed?");
            let browser = browser_over(&dom);

            let outcome = browser
                .handle_alert(&AlertOptions {
                    wait: None,
                    ..AlertOptions::default()
                })
                .unwrap();
            assert_eq!(outcome, Some(true));
            assert!(!browser.is_alert_present());
        }

        #[test]
        fn test_handle_alert_prompt() {
            let dom = Arc::new(MockDom::new());
            dom.push_alert("Name?");
            let browser = browser_over(&dom);

            let outcome = browser
                .handle_alert(&AlertOptions {
                    wait: None,
                    prompt: Some("admin".to_string()),
                    ..AlertOptions::default()
                })
                .unwrap();
            assert_eq!(outcome, Some(true));
            assert_eq!(dom.prompt_inputs(), vec!["admin".to_string()]);
        }

        #[test]
        fn test_no_alert_reads_none() {
            let dom = Arc::new(MockDom::new());
            let browser = browser_over(&dom);

            let outcome = browser
                .handle_alert(&AlertOptions {
                    wait: None,
                    ..AlertOptions::default()
                })
                .unwrap();
            assert_eq!(outcome, None);
        }

        #[test]
        fn test_check_present_raises() {
            let dom = Arc::new(MockDom::new());
            let browser = browser_over(&dom);

            let result = browser.handle_alert(&AlertOptions {
                wait: None,
                check_present: true,
                ..AlertOptions::default()
            });
            assert!(matches!(result, Err(RecorrerError::NoAlert)));
        }
    }

    mod page_safe_tests {
        use super::*;
        use crate::plugin::DefaultPlugin;

        #[test]
        fn test_busy_page_times_out() {
            let dom = Arc::new(MockDom::new());
            dom.set_script_result(
                dedent(DefaultPlugin::ENSURE_PAGE_SAFE),
                json!({"jquery": false, "document": true}),
            );
            let browser = browser_over(&dom);

            let result = browser.ensure_page_safe_within(Duration::from_millis(300));
            assert!(matches!(result, Err(RecorrerError::PageNotSafe { .. })));
        }

        #[test]
        fn test_page_becomes_ready() {
            let dom = Arc::new(MockDom::new());
            let key = dedent(DefaultPlugin::ENSURE_PAGE_SAFE);
            dom.push_script_result(key.as_str(), json!({"jquery": false, "document": true}));
            dom.set_script_result(key.as_str(), json!({"jquery": true, "document": true}));
            let browser = browser_over(&dom);

            browser
                .ensure_page_safe_within(Duration::from_secs(2))
                .unwrap();
        }
    }

    mod scoped_tests {
        use super::*;

        #[test]
        fn test_scoped_browser_injects_parents() {
            let dom = Arc::new(MockDom::new());
            let form = dom.add_element(MockElement::new("form").css("#login-form"));
            let inside = dom.add_element(MockElement::new("input").css(".field").child_of(form));
            let _outside = dom.add_element(MockElement::new("input").css(".field"));
            let browser = browser_over(&dom);

            let scoped = browser.in_parent_context(vec![Locator::css("#login-form")]);
            let found = scoped
                .elements(&Locator::css(".field"), &QueryOptions::new())
                .unwrap();
            assert_eq!(found, vec![inside]);
        }

        #[test]
        fn test_scoped_chain_nests() {
            let dom = Arc::new(MockDom::new());
            let outer = dom.add_element(MockElement::new("div").css("#outer"));
            let inner = dom.add_element(MockElement::new("div").css("#inner").child_of(outer));
            let target = dom.add_element(MockElement::new("a").css(".link").child_of(inner));
            let browser = browser_over(&dom);

            let scoped = browser.in_parent_context(vec![Locator::css("#outer")]);
            let found = scoped
                .elements(
                    &Locator::css(".link"),
                    &QueryOptions::within(vec![Locator::css("#inner")]),
                )
                .unwrap();
            assert_eq!(found, vec![target]);
        }
    }
}
