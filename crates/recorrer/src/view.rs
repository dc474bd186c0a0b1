//! Views: declarative compositions of widgets, sub-views and transitions.
//!
//! A [`ViewSchema`] is built once per screen with an explicit builder and
//! is the data structure the navigator consumes: widgets in declaration
//! order, nested sub-views, transition declarations, and the optional
//! `on_view` / `on_load` hooks. A [`ViewHandle`] is one instantiation of a
//! schema against a browser, owning the per-instance widget cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::browser::{Browser, QueryOptions};
use crate::locator::Locator;
use crate::result::{RecorrerError, RecorrerResult};
use crate::widget::{BoundWidget, WidgetKind};

/// Predicate recognizing whether a view is currently displayed
pub type OnViewFn = Arc<dyn Fn(&Browser) -> bool + Send + Sync>;

/// Side effect run right after a view is instantiated
pub type OnLoadFn = Arc<dyn Fn(&Browser, &NavContext) -> RecorrerResult<()> + Send + Sync>;

/// A transition body: drives the browser from the source view
pub type TransitionFn = Arc<dyn Fn(&ViewHandle, &NavContext) -> RecorrerResult<()> + Send + Sync>;

/// A transition target: either a built schema or a forward reference by
/// name, resolved against the registry at graph-build time.
#[derive(Clone)]
pub enum ViewRef {
    /// Direct reference to a built schema
    Schema(Arc<ViewSchema>),
    /// Forward reference by view name
    Named(String),
}

impl ViewRef {
    /// The referenced view name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Schema(schema) => schema.name(),
            Self::Named(name) => name,
        }
    }
}

impl std::fmt::Debug for ViewRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(schema) => write!(f, "ViewRef::Schema({})", schema.name()),
            Self::Named(name) => write!(f, "ViewRef::Named({name})"),
        }
    }
}

impl From<&Arc<ViewSchema>> for ViewRef {
    fn from(schema: &Arc<ViewSchema>) -> Self {
        Self::Schema(Arc::clone(schema))
    }
}

impl From<&str> for ViewRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

/// A declared transition on a view
#[derive(Clone)]
pub struct TransitionDecl {
    /// Transition name; dotted for sub-view transitions
    pub name: String,
    /// Names of the context parameters the body consumes
    pub params: Vec<String>,
    /// Candidate target views, in declaration order
    pub targets: Vec<ViewRef>,
    /// The transition body
    pub handler: TransitionFn,
}

impl std::fmt::Debug for TransitionDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionDecl")
            .field("name", &self.name)
            .field("params", &self.params)
            .field(
                "targets",
                &self.targets.iter().map(ViewRef::name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A declared widget on a view
#[derive(Clone)]
pub struct WidgetDecl {
    /// Widget name on the view
    pub name: String,
    /// Shared behavior
    pub kind: Arc<dyn WidgetKind>,
}

impl std::fmt::Debug for WidgetDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetDecl")
            .field("name", &self.name)
            .field("kind", &self.kind.describe())
            .finish()
    }
}

/// Declarative description of one screen or fragment of the UI
pub struct ViewSchema {
    name: String,
    root: Option<Locator>,
    widgets: Vec<WidgetDecl>,
    subviews: Vec<(String, Arc<ViewSchema>)>,
    transitions: Vec<TransitionDecl>,
    on_view: Option<OnViewFn>,
    on_load: Option<OnLoadFn>,
}

impl std::fmt::Debug for ViewSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSchema")
            .field("name", &self.name)
            .field("widgets", &self.widgets.len())
            .field("subviews", &self.subviews.len())
            .field("transitions", &self.transitions.len())
            .field("has_on_view", &self.on_view.is_some())
            .field("has_on_load", &self.on_load.is_some())
            .finish()
    }
}

impl ViewSchema {
    /// Start building a view schema
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ViewSchemaBuilder {
        ViewSchemaBuilder {
            name: name.into(),
            root: None,
            widgets: Vec::new(),
            subviews: Vec::new(),
            transitions: Vec::new(),
            on_view: None,
            on_load: None,
        }
    }

    /// View name, unique within a registry
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root locator, when declared
    #[must_use]
    pub const fn root(&self) -> Option<&Locator> {
        self.root.as_ref()
    }

    /// Widget names in declaration order
    #[must_use]
    pub fn widget_names(&self) -> Vec<&str> {
        self.widgets.iter().map(|decl| decl.name.as_str()).collect()
    }

    /// Declared widgets in declaration order
    #[must_use]
    pub fn widgets(&self) -> &[WidgetDecl] {
        &self.widgets
    }

    /// Declared sub-views in declaration order
    #[must_use]
    pub fn subviews(&self) -> &[(String, Arc<ViewSchema>)] {
        &self.subviews
    }

    /// Declared transitions in declaration order
    #[must_use]
    pub fn transitions(&self) -> &[TransitionDecl] {
        &self.transitions
    }

    /// Whether the view declares an `on_view` predicate
    #[must_use]
    pub const fn has_on_view(&self) -> bool {
        self.on_view.is_some()
    }

    /// Whether the view declares an `on_load` hook
    #[must_use]
    pub const fn has_on_load(&self) -> bool {
        self.on_load.is_some()
    }

    /// Probe the `on_view` predicate against current browser state.
    /// `None` when the view declares no predicate.
    #[must_use]
    pub fn probe(&self, browser: &Browser) -> Option<bool> {
        self.on_view.as_ref().map(|f| f(browser))
    }

    fn widget_index(&self, name: &str) -> Option<usize> {
        self.widgets.iter().position(|decl| decl.name == name)
    }

    fn subview_index(&self, name: &str) -> Option<usize> {
        self.subviews.iter().position(|(n, _)| n == name)
    }
}

/// Builder for [`ViewSchema`]
pub struct ViewSchemaBuilder {
    name: String,
    root: Option<Locator>,
    widgets: Vec<WidgetDecl>,
    subviews: Vec<(String, Arc<ViewSchema>)>,
    transitions: Vec<TransitionDecl>,
    on_view: Option<OnViewFn>,
    on_load: Option<OnLoadFn>,
}

impl std::fmt::Debug for ViewSchemaBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSchemaBuilder")
            .field("name", &self.name)
            .finish()
    }
}

impl ViewSchemaBuilder {
    /// Set the root locator; widgets and sub-views resolve inside it
    #[must_use]
    pub fn root(mut self, locator: impl Into<Locator>) -> Self {
        self.root = Some(locator.into());
        self
    }

    /// Declare a widget; declaration order is preserved
    #[must_use]
    pub fn widget(mut self, name: impl Into<String>, kind: impl WidgetKind + 'static) -> Self {
        self.widgets.push(WidgetDecl {
            name: name.into(),
            kind: Arc::new(kind),
        });
        self
    }

    /// Declare a nested sub-view
    #[must_use]
    pub fn subview(mut self, name: impl Into<String>, schema: &Arc<ViewSchema>) -> Self {
        self.subviews.push((name.into(), Arc::clone(schema)));
        self
    }

    /// Declare a transition to one or more candidate target views
    #[must_use]
    pub fn transition(
        mut self,
        name: impl Into<String>,
        params: &[&str],
        targets: impl IntoIterator<Item = ViewRef>,
        handler: impl Fn(&ViewHandle, &NavContext) -> RecorrerResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.transitions.push(TransitionDecl {
            name: name.into(),
            params: params.iter().map(ToString::to_string).collect(),
            targets: targets.into_iter().collect(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Declare the view-recognition predicate
    #[must_use]
    pub fn on_view(mut self, f: impl Fn(&Browser) -> bool + Send + Sync + 'static) -> Self {
        self.on_view = Some(Arc::new(f));
        self
    }

    /// Declare the post-instantiation side effect
    #[must_use]
    pub fn on_load(
        mut self,
        f: impl Fn(&Browser, &NavContext) -> RecorrerResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_load = Some(Arc::new(f));
        self
    }

    /// Finish the schema
    #[must_use]
    pub fn build(self) -> Arc<ViewSchema> {
        Arc::new(ViewSchema {
            name: self.name,
            root: self.root,
            widgets: self.widgets,
            subviews: self.subviews,
            transitions: self.transitions,
            on_view: self.on_view,
            on_load: self.on_load,
        })
    }
}

/// Ordered string-to-JSON map used for navigation context and scratch
/// state. Reads of missing keys yield `None` instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavContext {
    entries: BTreeMap<String, Value>,
}

/// Scratch space carried by a navigator instance
pub type NavigatorState = NavContext;

impl NavContext {
    /// An empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Insert a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let _ = self.entries.insert(key.into(), value.into());
    }

    /// Read a value; missing keys are `None`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Read a string value; missing keys and non-strings are `None`
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    /// Overlay `other` on top of this context; `other` wins on conflicts
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut entries = self.entries.clone();
        for (key, value) in &other.entries {
            let _ = entries.insert(key.clone(), value.clone());
        }
        Self { entries }
    }

    /// The sub-context containing only the named keys
    #[must_use]
    pub fn subset(&self, keys: &[String]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(key, _)| keys.contains(key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Whether every named key is present
    #[must_use]
    pub fn contains_all(&self, keys: &[String]) -> bool {
        keys.iter().all(|key| self.entries.contains_key(key))
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Whether the context is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One instantiation of a [`ViewSchema`] against a browser.
///
/// Owns the per-instance widget cache: each widget declaration resolves to
/// at most one bound widget per view instance, and repeated access returns
/// the identical object until the cache is flushed.
pub struct ViewHandle {
    schema: Arc<ViewSchema>,
    browser: Arc<Browser>,
    parents: Vec<Locator>,
    context: Mutex<NavContext>,
    widget_cache: Mutex<HashMap<usize, Arc<BoundWidget>>>,
    subview_cache: Mutex<HashMap<usize, Arc<ViewHandle>>>,
}

impl std::fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("schema", &self.schema.name())
            .field("parents", &self.parents.len())
            .finish()
    }
}

impl ViewHandle {
    /// Instantiate a schema as a top-level view
    #[must_use]
    pub fn new(schema: Arc<ViewSchema>, browser: Arc<Browser>, context: NavContext) -> Arc<Self> {
        Arc::new(Self {
            schema,
            browser,
            parents: Vec::new(),
            context: Mutex::new(context),
            widget_cache: Mutex::new(HashMap::new()),
            subview_cache: Mutex::new(HashMap::new()),
        })
    }

    /// The view's schema
    #[must_use]
    pub fn schema(&self) -> &Arc<ViewSchema> {
        &self.schema
    }

    /// The view name
    #[must_use]
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// The browser this view is bound to
    #[must_use]
    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    /// Snapshot of the view's context
    #[must_use]
    pub fn context(&self) -> NavContext {
        self.context.lock().expect("view context poisoned").clone()
    }

    /// Merge new entries into the view's context in place
    pub fn update_context(&self, additional: &NavContext) {
        let mut context = self.context.lock().expect("view context poisoned");
        *context = context.merged_with(additional);
    }

    /// Locator chain for children of this view, nearest first
    fn child_chain(&self) -> Vec<Locator> {
        let mut chain = Vec::with_capacity(self.parents.len() + 1);
        if let Some(root) = self.schema.root() {
            chain.push(root.clone());
        }
        chain.extend(self.parents.iter().cloned());
        chain
    }

    /// The named widget, materialized on first access and cached under its
    /// declaration slot.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::UnknownWidget`] for undeclared names.
    pub fn widget(&self, name: &str) -> RecorrerResult<Arc<BoundWidget>> {
        let index = self
            .schema
            .widget_index(name)
            .ok_or_else(|| RecorrerError::UnknownWidget {
                view: self.schema.name().to_string(),
                widget: name.to_string(),
            })?;
        let mut cache = self.widget_cache.lock().expect("widget cache poisoned");
        if let Some(widget) = cache.get(&index) {
            return Ok(Arc::clone(widget));
        }
        let decl = &self.schema.widgets()[index];
        let widget = Arc::new(BoundWidget::bind(
            Arc::clone(&decl.kind),
            Arc::clone(&self.browser),
            self.child_chain(),
            decl.name.clone(),
        ));
        let _ = cache.insert(index, Arc::clone(&widget));
        Ok(widget)
    }

    /// Widget names in declaration order
    #[must_use]
    pub fn widget_names(&self) -> Vec<&str> {
        self.schema.widget_names()
    }

    /// All widgets, in declaration order
    ///
    /// # Errors
    ///
    /// Propagates widget materialization failures.
    pub fn widgets(&self) -> RecorrerResult<Vec<Arc<BoundWidget>>> {
        self.schema
            .widgets()
            .iter()
            .map(|decl| self.widget(&decl.name))
            .collect()
    }

    /// The named sub-view, instantiated on first access and cached.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::UnknownWidget`] for undeclared names.
    pub fn subview(&self, name: &str) -> RecorrerResult<Arc<Self>> {
        let index = self
            .schema
            .subview_index(name)
            .ok_or_else(|| RecorrerError::UnknownWidget {
                view: self.schema.name().to_string(),
                widget: name.to_string(),
            })?;
        let mut cache = self.subview_cache.lock().expect("subview cache poisoned");
        if let Some(view) = cache.get(&index) {
            return Ok(Arc::clone(view));
        }
        let (_, schema) = &self.schema.subviews()[index];
        let view = Arc::new(Self {
            schema: Arc::clone(schema),
            browser: Arc::clone(&self.browser),
            parents: self.child_chain(),
            context: Mutex::new(self.context()),
            widget_cache: Mutex::new(HashMap::new()),
            subview_cache: Mutex::new(HashMap::new()),
        });
        let _ = cache.insert(index, Arc::clone(&view));
        Ok(view)
    }

    /// Resolve a dotted sub-view path, e.g. `navigation` or `a.b`
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::UnknownWidget`] when a step is undeclared.
    pub fn subview_path(self: &Arc<Self>, path: &[String]) -> RecorrerResult<Arc<Self>> {
        let mut current = Arc::clone(self);
        for step in path {
            current = current.subview(step)?;
        }
        Ok(current)
    }

    /// Drop every cached widget, recursively through cached sub-views.
    /// The next access materializes fresh objects.
    pub fn flush_widget_cache(&self) {
        for view in self
            .subview_cache
            .lock()
            .expect("subview cache poisoned")
            .values()
        {
            view.flush_widget_cache();
        }
        self.widget_cache
            .lock()
            .expect("widget cache poisoned")
            .clear();
    }

    /// Probe the view's `on_view` predicate; `None` when undeclared
    #[must_use]
    pub fn on_view(&self) -> Option<bool> {
        self.schema.probe(&self.browser)
    }

    /// Run the view's `on_load` hook, when declared
    ///
    /// # Errors
    ///
    /// Propagates hook failures.
    pub fn on_load(&self) -> RecorrerResult<()> {
        if let Some(hook) = &self.schema.on_load {
            let context = self.context();
            hook(&self.browser, &context)?;
        }
        Ok(())
    }

    /// Whether the view is displayed: its root when declared, else `true`
    ///
    /// # Errors
    ///
    /// See [`Browser::is_displayed`].
    pub fn is_displayed(&self) -> RecorrerResult<bool> {
        match self.schema.root() {
            Some(root) => self
                .browser
                .is_displayed(root, &QueryOptions::within(self.parents.clone())),
            None => Ok(true),
        }
    }

    /// Fill widgets from a value map, in declaration order. Unknown names
    /// are an error; `Null` values are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::UnknownWidget`] for unknown names and
    /// propagates widget failures.
    pub fn fill(&self, values: &BTreeMap<String, Value>) -> RecorrerResult<bool> {
        let names = self.schema.widget_names();
        for name in values.keys() {
            if !names.contains(&name.as_str()) {
                return Err(RecorrerError::UnknownWidget {
                    view: self.schema.name().to_string(),
                    widget: name.clone(),
                });
            }
        }
        let mut changed = false;
        for name in names {
            let Some(value) = values.get(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if self.widget(name)?.fill(value)? {
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Read every readable widget into a map. Widgets without a read
    /// implementation or without a present element are skipped.
    ///
    /// # Errors
    ///
    /// Propagates unexpected widget failures.
    pub fn read(&self) -> RecorrerResult<BTreeMap<String, Value>> {
        let mut result = BTreeMap::new();
        for name in self.schema.widget_names() {
            match self.widget(name)?.read() {
                Ok(value) => {
                    let _ = result.insert(name.to_string(), value);
                }
                Err(
                    RecorrerError::NotImplemented { .. } | RecorrerError::ElementNotFound { .. },
                ) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(result)
    }
}
