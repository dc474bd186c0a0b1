//! Recorrer: view/widget page-object model with graph-driven UI navigation.
//!
//! The building blocks UI test suites are written against:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      RECORRER Architecture                       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐    ┌─────────────┐    ┌─────────┐    ┌─────────┐  │
//! │  │ Navigator │───►│ View/Widget │───►│ Browser │───►│ Driver  │  │
//! │  │ (graph)   │    │ (schemas)   │    │ (facade)│    │ (DOM)   │  │
//! │  └───────────┘    └─────────────┘    └─────────┘    └─────────┘  │
//! │        │ page-safe gating   ▲                                    │
//! │        └────────────────────┴── PagePlugin (readiness predicate) │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A test declares "I need to be looking at view X with context Y"; the
//! [`Navigator`] detects where the browser currently is, plans the
//! shortest satisfiable path through the transition graph and executes
//! it, gating every hop on the page-readiness plugin.
//!
//! The default build is fully self-contained and drives the in-memory
//! [`MockDom`]; enable the `browser` feature for real chromium control
//! over CDP.

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]

mod browser;
#[cfg(feature = "browser")]
mod cdp;
mod driver;
mod locator;
mod navigator;
mod plugin;
mod result;
mod retry;
mod version;
mod view;
mod wait;
mod widget;

pub use browser::{
    dedent, AlertOptions, Browser, BrowserEvent, QueryOptions, ScopedBrowser,
    DEFAULT_PAGE_SAFE_BUDGET, PAGE_SAFE_POLL_INTERVAL,
};
#[cfg(feature = "browser")]
pub use cdp::{CdpDriver, CdpDriverConfig};
pub use driver::{DomDriver, DriverError, ElementHandle, MockDom, MockElement};
pub use locator::{quote_attr, Locate, Locator, Strategy};
pub use navigator::{
    Edge, NavGraph, Navigator, PathStep, ViewRegistry, TRANSITION_PAGE_SAFE_BUDGET,
};
pub use plugin::{DefaultPlugin, PagePlugin, QuiescePlugin};
pub use result::{RecorrerError, RecorrerResult};
pub use retry::RetryPolicy;
pub use version::{Version, VersionPick};
pub use view::{
    NavContext, NavigatorState, OnLoadFn, OnViewFn, TransitionDecl, TransitionFn, ViewHandle,
    ViewRef, ViewSchema, ViewSchemaBuilder, WidgetDecl,
};
pub use wait::{wait_until, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};
pub use widget::{
    AttributeValue, BoundWidget, Button, Checkbox, Input, Text, WidgetKind,
};
