//! Navigator: a directed graph of views connected by named transitions.
//!
//! The navigator reflects over view schemas to build the transition graph,
//! resolves forward references by name against a registry (failing closed
//! on unknown names), finds the shortest parameter-satisfiable path from
//! the current view to a requested one, and executes it edge by edge with
//! page-readiness gating. Multi-target transitions are disambiguated at
//! runtime by probing each candidate's `on_view` predicate in declaration
//! order, re-planning when the browser landed somewhere else than assumed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::Browser;
use crate::result::{RecorrerError, RecorrerResult};
use crate::view::{NavContext, NavigatorState, TransitionFn, ViewHandle, ViewRef, ViewSchema};

/// Page-readiness budget between transition steps
pub const TRANSITION_PAGE_SAFE_BUDGET: Duration = Duration::from_secs(15);

/// An edge of the navigation graph
#[derive(Clone)]
pub struct Edge {
    /// Source view name
    pub source: String,
    /// Transition name; dotted for sub-view transitions
    pub transition: String,
    /// Sub-view path leading to the transition's owner, empty for direct
    /// transitions
    pub subview_path: Vec<String>,
    /// Context parameters the transition consumes
    pub params: Vec<String>,
    /// Candidate target view names, declaration order
    pub targets: Vec<String>,
    handler: TransitionFn,
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("source", &self.source)
            .field("transition", &self.transition)
            .field("params", &self.params)
            .field("targets", &self.targets)
            .finish()
    }
}

/// One hop of a planned path: an edge plus the target the planner assumed
#[derive(Debug, Clone)]
pub struct PathStep {
    /// The edge to execute
    pub edge: Edge,
    /// The target view the plan assumes this edge reaches
    pub target: String,
}

/// Name-to-schema registry. Forward references resolve against it and
/// unknown names fail closed.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: Vec<Arc<ViewSchema>>,
    by_name: HashMap<String, usize>,
}

impl ViewRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under its name
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::DuplicateView`] when the name is taken.
    pub fn register(&mut self, schema: &Arc<ViewSchema>) -> RecorrerResult<()> {
        if self.by_name.contains_key(schema.name()) {
            return Err(RecorrerError::DuplicateView {
                name: schema.name().to_string(),
            });
        }
        let _ = self
            .by_name
            .insert(schema.name().to_string(), self.views.len());
        self.views.push(Arc::clone(schema));
        Ok(())
    }

    /// Look up a schema by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ViewSchema>> {
        self.by_name.get(name).map(|index| &self.views[*index])
    }

    /// Look up a schema by name, failing closed
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::UnknownView`] for unregistered names.
    pub fn resolve(&self, name: &str) -> RecorrerResult<Arc<ViewSchema>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| RecorrerError::UnknownView {
                name: name.to_string(),
            })
    }

    /// Registered schemas in registration order
    #[must_use]
    pub fn views(&self) -> &[Arc<ViewSchema>] {
        &self.views
    }
}

/// The transition graph: view names as nodes, transitions as edges
#[derive(Debug, Default)]
pub struct NavGraph {
    order: Vec<String>,
    nodes: HashMap<String, Arc<ViewSchema>>,
    edges: HashMap<String, Vec<Edge>>,
}

impl NavGraph {
    /// Build the graph reachable from `entry`, resolving named forward
    /// references against the registry to a fixed point.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::UnknownView`] for unresolvable names and
    /// [`RecorrerError::MissingOnView`] when a multi-target transition has
    /// a candidate without an `on_view` predicate.
    pub fn build(registry: &ViewRegistry, entry: &Arc<ViewSchema>) -> RecorrerResult<Self> {
        let mut graph = Self::default();
        let mut queue = vec![Arc::clone(entry)];

        while let Some(schema) = queue.pop() {
            if graph.nodes.contains_key(schema.name()) {
                continue;
            }
            graph.order.push(schema.name().to_string());
            let _ = graph
                .nodes
                .insert(schema.name().to_string(), Arc::clone(&schema));

            let mut edges = Vec::new();
            Self::collect_edges(registry, &schema, &schema, &[], &mut edges, &mut queue)?;
            let _ = graph.edges.insert(schema.name().to_string(), edges);
        }

        graph.validate()?;
        Ok(graph)
    }

    fn collect_edges(
        registry: &ViewRegistry,
        source: &Arc<ViewSchema>,
        owner: &Arc<ViewSchema>,
        subview_path: &[String],
        edges: &mut Vec<Edge>,
        queue: &mut Vec<Arc<ViewSchema>>,
    ) -> RecorrerResult<()> {
        for decl in owner.transitions() {
            let mut targets = Vec::with_capacity(decl.targets.len());
            for target in &decl.targets {
                let resolved = match target {
                    ViewRef::Schema(schema) => Arc::clone(schema),
                    ViewRef::Named(name) => registry.resolve(name)?,
                };
                targets.push(resolved.name().to_string());
                queue.push(resolved);
            }
            let transition = if subview_path.is_empty() {
                decl.name.clone()
            } else {
                format!("{}.{}", subview_path.join("."), decl.name)
            };
            edges.push(Edge {
                source: source.name().to_string(),
                transition,
                subview_path: subview_path.to_vec(),
                params: decl.params.clone(),
                targets,
                handler: Arc::clone(&decl.handler),
            });
        }
        for (name, sub) in owner.subviews() {
            let mut deeper = subview_path.to_vec();
            deeper.push(name.clone());
            Self::collect_edges(registry, source, sub, &deeper, edges, queue)?;
        }
        Ok(())
    }

    fn validate(&self) -> RecorrerResult<()> {
        for edges in self.edges.values() {
            for edge in edges {
                if edge.targets.len() < 2 {
                    continue;
                }
                for target in &edge.targets {
                    let schema = self
                        .nodes
                        .get(target)
                        .ok_or_else(|| RecorrerError::UnknownView {
                            name: target.clone(),
                        })?;
                    if !schema.has_on_view() {
                        return Err(RecorrerError::MissingOnView {
                            view: target.clone(),
                            transition: edge.transition.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Node names in discovery order
    #[must_use]
    pub fn nodes(&self) -> &[String] {
        &self.order
    }

    /// The schema of a node
    #[must_use]
    pub fn schema(&self, name: &str) -> Option<&Arc<ViewSchema>> {
        self.nodes.get(name)
    }

    /// Outgoing edges of a node, in declaration order
    #[must_use]
    pub fn edges_from(&self, name: &str) -> &[Edge] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Enumerate paths starting at `from`. With `to` set, only paths
    /// terminating there are kept. Cycles are prevented by adding each
    /// visited view to the ignored set for deeper recursion. Paths are
    /// ordered shortest first; ties keep enumeration order.
    #[must_use]
    pub fn all_paths(
        &self,
        from: &str,
        to: Option<&str>,
        ignored: &HashSet<String>,
    ) -> Vec<Vec<PathStep>> {
        let mut found = Vec::new();
        self.walk(from, to, ignored, &[], &mut found);
        found.sort_by_key(Vec::len);
        found
    }

    fn walk(
        &self,
        current: &str,
        to: Option<&str>,
        ignored: &HashSet<String>,
        prefix: &[PathStep],
        found: &mut Vec<Vec<PathStep>>,
    ) {
        for edge in self.edges_from(current) {
            for target in &edge.targets {
                if ignored.contains(target) {
                    continue;
                }
                let mut path = prefix.to_vec();
                path.push(PathStep {
                    edge: edge.clone(),
                    target: target.clone(),
                });
                match to {
                    Some(destination) if destination == target => {
                        found.push(path);
                        continue;
                    }
                    Some(_) => {}
                    None => found.push(path.clone()),
                }
                let mut deeper = ignored.clone();
                let _ = deeper.insert(current.to_string());
                self.walk(target, to, &deeper, &path, found);
            }
        }
    }

    /// The shortest path from `src` to `dst` whose every transition
    /// parameter can be supplied from `context`.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::PathMissing`] when no satisfiable path
    /// exists.
    pub fn path_from_to(
        &self,
        src: &str,
        dst: &str,
        context: &NavContext,
    ) -> RecorrerResult<Vec<PathStep>> {
        if src == dst {
            return Ok(Vec::new());
        }
        self.all_paths(src, Some(dst), &HashSet::new())
            .into_iter()
            .find(|path| {
                path.iter()
                    .all(|step| context.contains_all(&step.edge.params))
            })
            .ok_or_else(|| RecorrerError::PathMissing {
                from: src.to_string(),
                to: dst.to_string(),
            })
    }
}

/// Drives the browser between views along the transition graph.
pub struct Navigator {
    browser: Arc<Browser>,
    registry: ViewRegistry,
    graph: NavGraph,
    entry: Arc<ViewSchema>,
    current: Mutex<Option<Arc<ViewHandle>>>,
    state: Mutex<NavigatorState>,
    default_context: NavContext,
    page_safe_budget: Duration,
}

impl std::fmt::Debug for Navigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Navigator")
            .field("entry", &self.entry.name())
            .field("nodes", &self.graph.nodes())
            .finish()
    }
}

impl Navigator {
    /// Build a navigator rooted at `entry`, whose `on_load` is the first
    /// side effect after a cold start.
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::MissingOnLoad`] when the entry view has no
    /// `on_load` hook, plus any graph-construction error.
    pub fn new(
        browser: Arc<Browser>,
        registry: ViewRegistry,
        entry: &Arc<ViewSchema>,
    ) -> RecorrerResult<Self> {
        if !entry.has_on_load() {
            return Err(RecorrerError::MissingOnLoad {
                view: entry.name().to_string(),
            });
        }
        let graph = NavGraph::build(&registry, entry)?;
        Ok(Self {
            browser,
            registry,
            graph,
            entry: Arc::clone(entry),
            current: Mutex::new(None),
            state: Mutex::new(NavigatorState::new()),
            default_context: NavContext::new(),
            page_safe_budget: TRANSITION_PAGE_SAFE_BUDGET,
        })
    }

    /// Context entries merged under every `navigate_to` call
    #[must_use]
    pub fn with_default_context(mut self, context: NavContext) -> Self {
        self.default_context = context;
        self
    }

    /// Replace the per-step page-readiness budget
    #[must_use]
    pub const fn with_page_safe_budget(mut self, budget: Duration) -> Self {
        self.page_safe_budget = budget;
        self
    }

    /// The transition graph
    #[must_use]
    pub fn graph(&self) -> &NavGraph {
        &self.graph
    }

    /// The browser this navigator drives
    #[must_use]
    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    /// The current view, when one is established
    #[must_use]
    pub fn current_view(&self) -> Option<Arc<ViewHandle>> {
        self.current.lock().expect("current view poisoned").clone()
    }

    /// Snapshot of the navigator's scratch state
    #[must_use]
    pub fn state(&self) -> NavigatorState {
        self.state.lock().expect("navigator state poisoned").clone()
    }

    /// Mutate the navigator's scratch state
    pub fn update_state(&self, f: impl FnOnce(&mut NavigatorState)) {
        let mut state = self.state.lock().expect("navigator state poisoned");
        f(&mut state);
    }

    fn set_current(&self, view: Option<Arc<ViewHandle>>) {
        *self.current.lock().expect("current view poisoned") = view;
    }

    fn wait_page_safe(&self) -> RecorrerResult<()> {
        self.browser.ensure_page_safe_within(self.page_safe_budget)
    }

    /// Instantiate a view: an existing current instance of the same schema
    /// gets its context updated in place, otherwise a new instance is
    /// constructed, `on_load` runs and page readiness is awaited.
    ///
    /// # Errors
    ///
    /// Propagates `on_load` and readiness failures.
    pub fn instantiate_view(
        &self,
        schema: &Arc<ViewSchema>,
        context: &NavContext,
    ) -> RecorrerResult<Arc<ViewHandle>> {
        if let Some(current) = self.current_view() {
            if current.name() == schema.name() {
                current.update_context(context);
                return Ok(current);
            }
        }
        let view = ViewHandle::new(
            Arc::clone(schema),
            Arc::clone(&self.browser),
            context.clone(),
        );
        view.on_load()?;
        self.wait_page_safe()?;
        Ok(view)
    }

    /// Determine the view the browser is currently on. A current view
    /// whose `on_view` still holds is kept; anything else resets the
    /// session back to the entry view.
    ///
    /// # Errors
    ///
    /// Propagates reload failures.
    pub fn detect_view(&self) -> RecorrerResult<Arc<ViewHandle>> {
        if let Some(current) = self.current_view() {
            match current.on_view() {
                Some(false) => {
                    tracing::debug!(view = current.name(), "current view no longer holds");
                    return self.reload_browser();
                }
                Some(true) | None => return Ok(current),
            }
        }
        self.start_from_entry(false)
    }

    /// Drop caches, quit the underlying browser, and reset to the entry
    /// view; its `on_load` re-runs on instantiation.
    ///
    /// # Errors
    ///
    /// Propagates quit and entry-load failures.
    pub fn reload_browser(&self) -> RecorrerResult<Arc<ViewHandle>> {
        self.start_from_entry(true)
    }

    fn start_from_entry(&self, quit_first: bool) -> RecorrerResult<Arc<ViewHandle>> {
        if quit_first {
            if let Some(current) = self.current_view() {
                current.flush_widget_cache();
            }
            self.set_current(None);
            self.browser.quit()?;
        }
        let entry = ViewHandle::new(
            Arc::clone(&self.entry),
            Arc::clone(&self.browser),
            self.default_context.clone(),
        );
        entry.on_load()?;
        self.wait_page_safe()?;
        self.set_current(Some(Arc::clone(&entry)));
        Ok(entry)
    }

    /// Navigate to the named view, supplying transition parameters from
    /// `context` (merged over the navigator's default context).
    ///
    /// # Errors
    ///
    /// Returns [`RecorrerError::PathMissing`] when no satisfiable path
    /// exists, [`RecorrerError::PageNotSafe`] when a step never settles,
    /// and [`RecorrerError::UnknownLandingView`] when a transition ends on
    /// a page no expected target recognizes.
    pub fn navigate_to(
        &self,
        target: &str,
        context: &NavContext,
    ) -> RecorrerResult<Arc<ViewHandle>> {
        let context = self.default_context.merged_with(context);
        let _ = self.registry.resolve(target)?;
        let mut current = self.detect_view()?;

        // Re-planning after an unexpected landing is bounded by the graph
        // size; exceeding it means the probes send us in circles.
        let max_plans = self.graph.nodes().len() * 2 + 3;
        for _ in 0..max_plans {
            if current.name() == target {
                current.update_context(&context);
                self.set_current(Some(Arc::clone(&current)));
                return Ok(current);
            }

            let path = self
                .graph
                .path_from_to(current.name(), target, &context)?;
            tracing::debug!(
                from = current.name(),
                to = target,
                hops = path.len(),
                "executing navigation path"
            );

            for step in &path {
                let landed = self.execute_step(&current, step, &context)?;
                let expected = landed.name() == step.target;
                current = landed;
                self.set_current(Some(Arc::clone(&current)));
                if !expected {
                    tracing::debug!(
                        planned = step.target,
                        actual = current.name(),
                        "landed off-plan, re-planning"
                    );
                    break;
                }
            }
        }
        Err(RecorrerError::PathMissing {
            from: self
                .current_view()
                .map_or_else(|| "<nowhere>".to_string(), |v| v.name().to_string()),
            to: target.to_string(),
        })
    }

    fn execute_step(
        &self,
        current: &Arc<ViewHandle>,
        step: &PathStep,
        context: &NavContext,
    ) -> RecorrerResult<Arc<ViewHandle>> {
        let edge = &step.edge;
        self.wait_page_safe()?;
        let invoke_on = current.subview_path(&edge.subview_path)?;
        tracing::debug!(
            transition = edge.transition,
            source = edge.source,
            "executing transition"
        );
        (edge.handler)(&invoke_on, &context.subset(&edge.params))?;
        self.wait_page_safe()?;

        if edge.targets.len() == 1 {
            let schema = self.registry.resolve(&edge.targets[0])?;
            if schema.probe(&self.browser) == Some(false) {
                self.set_current(None);
                return Err(RecorrerError::UnknownLandingView {
                    transition: edge.transition.clone(),
                });
            }
            return self.instantiate_view(&schema, context);
        }

        // Multi-target: probe candidates in declaration order
        for name in &edge.targets {
            let schema = self.registry.resolve(name)?;
            if schema.probe(&self.browser) == Some(true) {
                return self.instantiate_view(&schema, context);
            }
        }
        self.set_current(None);
        Err(RecorrerError::UnknownLandingView {
            transition: edge.transition.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::QueryOptions;
    use crate::driver::{DomDriver, MockDom, MockElement};
    use crate::locator::Locator;
    use crate::retry::RetryPolicy;
    use crate::widget::{Button, Text};
    use serde_json::json;

    fn displayed(browser: &Browser, selector: &str) -> bool {
        browser
            .is_displayed(&Locator::css(selector), &QueryOptions::new())
            .unwrap_or(false)
    }

    /// A miniature application: login screen, dashboard with a navigation
    /// menu, and a three-way menu landing that only the seeded DOM decides.
    struct MiniApp {
        dom: Arc<MockDom>,
        browser: Arc<Browser>,
        registry: ViewRegistry,
        entry: Arc<ViewSchema>,
    }

    impl MiniApp {
        #[allow(clippy::too_many_lines)]
        fn new() -> Self {
            let dom = Arc::new(MockDom::new());
            let driver: Arc<dyn DomDriver> = Arc::clone(&dom) as Arc<dyn DomDriver>;
            let browser = Arc::new(
                Browser::new(driver)
                    .with_stale_retry(RetryPolicy::new(10, Duration::from_millis(1))),
            );

            let login_el = dom.add_element(MockElement::new("div").css("#login_div"));
            let dashboard_el =
                dom.add_element(MockElement::new("div").css("#dashboard").displayed(false));
            let nav = dom.add_element(
                MockElement::new("nav")
                    .css("#navigation")
                    .child_of(dashboard_el),
            );
            let _selected = dom.add_element(
                MockElement::new("span")
                    .css("#currently-selected")
                    .text("Overview, Dashboard")
                    .child_of(nav),
            );
            let reset_xp = match crate::widget::WidgetKind::locator(&Button::by_text("Reset"))
                .unwrap()
            {
                Locator::Query { expression, .. } => expression,
                Locator::Element(_) => panic!("expected a query locator"),
            };
            let _reset = dom.add_element(
                MockElement::new("button")
                    .xpath(reset_xp)
                    .attr("class", "btn")
                    .text("Reset")
                    .child_of(dashboard_el),
            );
            let menu_a = dom.add_element(MockElement::new("div").css("#menu_a").displayed(false));
            let menu_b = dom.add_element(MockElement::new("div").css("#menu_b").displayed(false));
            let _menu_c = dom.add_element(MockElement::new("div").css("#menu_c").displayed(false));

            let menu_a_schema = ViewSchema::builder("InMenuA")
                .on_view(|b| displayed(b, "#menu_a"))
                .build();
            let menu_b_schema = {
                let dom = Arc::clone(&dom);
                ViewSchema::builder("InMenuB")
                    .on_view(|b| displayed(b, "#menu_b"))
                    .transition(
                        "switch_to_a",
                        &[],
                        [ViewRef::from("InMenuA")],
                        move |_view, _ctx| {
                            dom.set_displayed(menu_b, false);
                            dom.set_displayed(menu_a, true);
                            Ok(())
                        },
                    )
                    .build()
            };
            let menu_c_schema = ViewSchema::builder("InMenuC")
                .on_view(|b| displayed(b, "#menu_c"))
                .build();

            let navigation_schema = ViewSchema::builder("Navigation")
                .root(Locator::css("#navigation"))
                .widget("currently_selected", Text::at("#currently-selected"))
                .build();

            let dashboard_schema = {
                let dom = Arc::clone(&dom);
                ViewSchema::builder("Dashboard")
                    .on_view(|b| displayed(b, "#dashboard"))
                    .widget("reset_button", Button::by_text("Reset"))
                    .subview("navigation", &navigation_schema)
                    .transition(
                        "go_to_menus",
                        &[],
                        [
                            ViewRef::from("InMenuA"),
                            ViewRef::from("InMenuB"),
                            ViewRef::from("InMenuC"),
                        ],
                        move |_view, _ctx| {
                            // The seeded DOM decides which menu view shows up
                            dom.set_displayed(dashboard_el, false);
                            Ok(())
                        },
                    )
                    .build()
            };

            let entry = {
                let dom = Arc::clone(&dom);
                ViewSchema::builder("Login")
                    .on_view(|b| displayed(b, "#login_div"))
                    .on_load(|browser, _ctx| browser.open("https://appliance.example/ui"))
                    .transition(
                        "login_user",
                        &["user"],
                        [ViewRef::from("Dashboard")],
                        move |_view, ctx| {
                            assert_eq!(ctx.get_str("user"), Some("admin"));
                            dom.set_displayed(login_el, false);
                            dom.set_displayed(dashboard_el, true);
                            Ok(())
                        },
                    )
                    .build()
            };

            let mut registry = ViewRegistry::new();
            registry.register(&entry).unwrap();
            registry.register(&dashboard_schema).unwrap();
            registry.register(&menu_a_schema).unwrap();
            registry.register(&menu_b_schema).unwrap();
            registry.register(&menu_c_schema).unwrap();

            Self {
                dom,
                browser,
                registry,
                entry,
            }
        }

        fn navigator(self) -> (Arc<MockDom>, Navigator) {
            let dom = Arc::clone(&self.dom);
            let navigator = Navigator::new(self.browser, self.registry, &self.entry).unwrap();
            (dom, navigator)
        }
    }

    mod graph_tests {
        use super::*;

        #[test]
        fn test_forward_references_resolve_to_fixed_point() {
            let app = MiniApp::new();
            let graph = NavGraph::build(&app.registry, &app.entry).unwrap();

            let mut nodes = graph.nodes().to_vec();
            nodes.sort();
            assert_eq!(
                nodes,
                vec!["Dashboard", "InMenuA", "InMenuB", "InMenuC", "Login"]
            );
        }

        #[test]
        fn test_unknown_forward_reference_fails_closed() {
            let entry = ViewSchema::builder("Entry")
                .on_load(|_, _| Ok(()))
                .transition("leap", &[], [ViewRef::from("Nowhere")], |_, _| Ok(()))
                .build();
            let registry = {
                let mut r = ViewRegistry::new();
                r.register(&entry).unwrap();
                r
            };
            let result = NavGraph::build(&registry, &entry);
            assert!(matches!(
                result,
                Err(RecorrerError::UnknownView { name }) if name == "Nowhere"
            ));
        }

        #[test]
        fn test_multi_target_requires_on_view() {
            let blind = ViewSchema::builder("Blind").build();
            let sighted = ViewSchema::builder("Sighted").on_view(|_| false).build();
            let entry = ViewSchema::builder("Entry")
                .on_load(|_, _| Ok(()))
                .transition(
                    "split",
                    &[],
                    [ViewRef::from(&sighted), ViewRef::from(&blind)],
                    |_, _| Ok(()),
                )
                .build();
            let mut registry = ViewRegistry::new();
            registry.register(&entry).unwrap();
            registry.register(&blind).unwrap();
            registry.register(&sighted).unwrap();

            let result = NavGraph::build(&registry, &entry);
            assert!(matches!(
                result,
                Err(RecorrerError::MissingOnView { view, .. }) if view == "Blind"
            ));
        }

        #[test]
        fn test_all_paths_terminate_at_destination() {
            let app = MiniApp::new();
            let graph = NavGraph::build(&app.registry, &app.entry).unwrap();

            for from in graph.nodes().to_vec() {
                for to in graph.nodes().to_vec() {
                    for path in graph.all_paths(&from, Some(&to), &HashSet::new()) {
                        assert_eq!(path.last().map(|s| s.target.as_str()), Some(to.as_str()));
                    }
                }
            }
        }

        #[test]
        fn test_shortest_path_wins() {
            let app = MiniApp::new();
            let graph = NavGraph::build(&app.registry, &app.entry).unwrap();
            let context = NavContext::from_pairs([("user", json!("admin"))]);

            let path = graph.path_from_to("Login", "Dashboard", &context).unwrap();
            assert_eq!(path.len(), 1);
            assert_eq!(path[0].edge.transition, "login_user");
        }

        #[test]
        fn test_parameter_filtering() {
            let app = MiniApp::new();
            let graph = NavGraph::build(&app.registry, &app.entry).unwrap();

            // login_user needs `user`, which the empty context cannot supply
            let result = graph.path_from_to("Login", "Dashboard", &NavContext::new());
            assert!(matches!(result, Err(RecorrerError::PathMissing { .. })));
        }

        #[test]
        fn test_dotted_subview_transitions() {
            let inner = ViewSchema::builder("Toolbar")
                .transition("open_settings", &[], [ViewRef::from("Settings")], |_, _| {
                    Ok(())
                })
                .build();
            let settings = ViewSchema::builder("Settings").build();
            let entry = ViewSchema::builder("Shell")
                .on_load(|_, _| Ok(()))
                .subview("toolbar", &inner)
                .build();
            let mut registry = ViewRegistry::new();
            registry.register(&entry).unwrap();
            registry.register(&settings).unwrap();

            let graph = NavGraph::build(&registry, &entry).unwrap();
            let edges = graph.edges_from("Shell");
            assert_eq!(edges.len(), 1);
            assert_eq!(edges[0].transition, "toolbar.open_settings");
            assert_eq!(edges[0].subview_path, vec!["toolbar".to_string()]);
            assert_eq!(edges[0].targets, vec!["Settings".to_string()]);
        }
    }

    mod navigation_tests {
        use super::*;

        #[test]
        fn test_login_to_dashboard() {
            let (dom, navigator) = MiniApp::new().navigator();
            let context = NavContext::from_pairs([("user", json!("admin"))]);

            let dashboard = navigator.navigate_to("Dashboard", &context).unwrap();
            assert_eq!(dashboard.name(), "Dashboard");
            assert_eq!(
                dom.quit_count(),
                0,
                "cold start must not recycle the session"
            );

            // The entry on_load opened the application
            assert_eq!(
                navigator.browser().current_url().unwrap(),
                "https://appliance.example/ui"
            );

            let reset = dashboard.widget("reset_button").unwrap();
            assert!(reset.is_displayed().unwrap());

            let selected = dashboard
                .subview("navigation")
                .unwrap()
                .widget("currently_selected")
                .unwrap()
                .read()
                .unwrap();
            let crumbs: Vec<String> = selected
                .as_str()
                .unwrap()
                .split(", ")
                .map(ToString::to_string)
                .collect();
            assert_eq!(crumbs, vec!["Overview", "Dashboard"]);
        }

        #[test]
        fn test_navigate_to_current_view_is_noop() {
            let (_dom, navigator) = MiniApp::new().navigator();
            let context = NavContext::from_pairs([("user", json!("admin"))]);

            let first = navigator.navigate_to("Dashboard", &context).unwrap();
            let second = navigator.navigate_to("Dashboard", &context).unwrap();
            assert!(Arc::ptr_eq(&first, &second));
        }

        #[test]
        fn test_multi_target_lands_on_probed_view() {
            let (dom, navigator) = MiniApp::new().navigator();
            let context = NavContext::from_pairs([("user", json!("admin"))]);
            let _ = navigator.navigate_to("Dashboard", &context).unwrap();

            // Seed the DOM so only menu B shows up after the transition
            let menu_b = dom.find(None, crate::locator::Strategy::Css, "#menu_b").unwrap()[0];
            dom.set_displayed(menu_b, true);

            let landed = navigator.navigate_to("InMenuB", &context).unwrap();
            assert_eq!(landed.name(), "InMenuB");
            assert_eq!(
                navigator.current_view().unwrap().name(),
                "InMenuB",
                "current view must follow the probe result"
            );
        }

        #[test]
        fn test_off_plan_landing_replans() {
            let (dom, navigator) = MiniApp::new().navigator();
            let context = NavContext::from_pairs([("user", json!("admin"))]);
            let _ = navigator.navigate_to("Dashboard", &context).unwrap();

            // Ask for menu A, but the application drops us in menu B; the
            // navigator must recover via InMenuB.switch_to_a.
            let menu_b = dom.find(None, crate::locator::Strategy::Css, "#menu_b").unwrap()[0];
            dom.set_displayed(menu_b, true);

            let landed = navigator.navigate_to("InMenuA", &context).unwrap();
            assert_eq!(landed.name(), "InMenuA");
        }

        #[test]
        fn test_unknown_landing_clears_current_view() {
            let (_dom, navigator) = MiniApp::new().navigator();
            let context = NavContext::from_pairs([("user", json!("admin"))]);
            let _ = navigator.navigate_to("Dashboard", &context).unwrap();

            // No menu becomes displayed: every candidate probe fails
            let result = navigator.navigate_to("InMenuB", &context);
            assert!(matches!(
                result,
                Err(RecorrerError::UnknownLandingView { .. })
            ));
            assert!(navigator.current_view().is_none());
        }

        #[test]
        fn test_reload_after_lost_view() {
            let (dom, navigator) = MiniApp::new().navigator();
            let context = NavContext::from_pairs([("user", json!("admin"))]);
            let dashboard = navigator.navigate_to("Dashboard", &context).unwrap();

            // The dashboard disappears behind our back; detection recycles
            // the browser session and starts over from the entry view.
            dom.set_displayed(dom.find(None, crate::locator::Strategy::Css, "#dashboard").unwrap()[0], false);
            dom.set_displayed(dom.find(None, crate::locator::Strategy::Css, "#login_div").unwrap()[0], true);

            let detected = navigator.detect_view().unwrap();
            assert_eq!(detected.name(), "Login");
            assert_eq!(dom.quit_count(), 1);
            assert!(!Arc::ptr_eq(&dashboard, &detected));
        }

        #[test]
        fn test_entry_requires_on_load() {
            let entry = ViewSchema::builder("Entry").build();
            let mut registry = ViewRegistry::new();
            registry.register(&entry).unwrap();
            let dom = Arc::new(MockDom::new());
            let driver: Arc<dyn DomDriver> = dom as Arc<dyn DomDriver>;

            let result = Navigator::new(Arc::new(Browser::new(driver)), registry, &entry);
            assert!(matches!(result, Err(RecorrerError::MissingOnLoad { .. })));
        }

        #[test]
        fn test_unknown_target_does_not_touch_state() {
            let (_dom, navigator) = MiniApp::new().navigator();
            let result = navigator.navigate_to("Elsewhere", &NavContext::new());
            assert!(matches!(result, Err(RecorrerError::UnknownView { .. })));
            assert!(navigator.current_view().is_none());
        }
    }

    mod state_tests {
        use super::*;

        #[test]
        fn test_scratch_state_defaults_to_none() {
            let (_dom, navigator) = MiniApp::new().navigator();
            assert!(navigator.state().get("anything").is_none());

            navigator.update_state(|state| state.insert("visited", json!(1)));
            assert_eq!(navigator.state().get("visited"), Some(&json!(1)));
        }
    }
}
