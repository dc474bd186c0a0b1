//! CDP-backed driver (feature `browser`).
//!
//! Blocking facade over the async chromiumoxide client. Element handles
//! are indices into a page-side registry array; every element operation is
//! a single JavaScript evaluation, so one code path serves all locator
//! strategies. Disconnected registry entries surface as stale handles.

use std::sync::Mutex;

use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig as CdpConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::runtime::Runtime;

use crate::driver::{DomDriver, DriverError, ElementHandle};
use crate::locator::Strategy;
use crate::result::{RecorrerError, RecorrerResult};

/// Launch options for the CDP driver
#[derive(Debug, Clone)]
pub struct CdpDriverConfig {
    /// Run without a visible window
    pub headless: bool,
    /// Path to the chromium binary, `None` for auto-detection
    pub chromium_path: Option<String>,
    /// Sandbox mode (disable inside containers)
    pub sandbox: bool,
}

impl Default for CdpDriverConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chromium_path: None,
            sandbox: true,
        }
    }
}

/// A [`DomDriver`] over a real chromium instance
pub struct CdpDriver {
    runtime: Runtime,
    browser: Mutex<CdpBrowser>,
    page: Page,
    #[allow(dead_code)]
    handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for CdpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpDriver").finish()
    }
}

fn backend_err(err: impl std::fmt::Display) -> DriverError {
    DriverError::Backend {
        message: err.to_string(),
    }
}

impl CdpDriver {
    /// Launch a chromium instance and open a blank page.
    ///
    /// # Errors
    ///
    /// Returns an error when the browser cannot be launched.
    pub fn launch(config: &CdpDriverConfig) -> RecorrerResult<Self> {
        let runtime = Runtime::new()?;

        let mut builder = CdpConfig::builder();
        if !config.headless {
            builder = builder.with_head();
        }
        if !config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(path) = &config.chromium_path {
            builder = builder.chrome_executable(path);
        }
        let cdp_config = builder
            .build()
            .map_err(|message| RecorrerError::Driver { message })?;

        let (browser, mut handler) = runtime
            .block_on(CdpBrowser::launch(cdp_config))
            .map_err(|e| RecorrerError::Driver {
                message: e.to_string(),
            })?;

        // The handler task drives the websocket; it must run before any
        // page operation can complete.
        let handle = runtime.spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = runtime
            .block_on(browser.new_page("about:blank"))
            .map_err(|e| RecorrerError::Driver {
                message: e.to_string(),
            })?;

        Ok(Self {
            runtime,
            browser: Mutex::new(browser),
            page,
            handle,
        })
    }

    fn eval(&self, expression: &str) -> Result<Value, DriverError> {
        self.runtime.block_on(async {
            let result = self
                .page
                .evaluate(expression)
                .await
                .map_err(backend_err)?;
            result.into_value::<Value>().map_err(backend_err)
        })
    }

    /// Run an element operation body against the registry entry. The body
    /// sees `el` and must produce the `return` value itself.
    fn eval_on(&self, element: ElementHandle, body: &str) -> Result<Value, DriverError> {
        let script = format!(
            r"(function() {{
                const reg = window.__recorrer_reg || [];
                const el = reg[{index}];
                if (!el || !el.isConnected) return {{ __stale: true }};
                {body}
            }})()",
            index = element.0,
        );
        let value = self.eval(&script)?;
        if value.get("__stale").is_some() {
            return Err(DriverError::StaleElement {
                detail: format!("element#{}", element.0),
            });
        }
        Ok(value)
    }

    fn query_expression(strategy: Strategy, expression: &str) -> String {
        let quoted = Value::String(expression.to_string()).to_string();
        match strategy {
            Strategy::Css => format!("scope.querySelectorAll({quoted})"),
            Strategy::Id => format!("scope.querySelectorAll('[id=' + CSS.escape({quoted}) + ']')"),
            Strategy::Name => {
                format!("scope.querySelectorAll('[name=' + CSS.escape({quoted}) + ']')")
            }
            Strategy::Class => format!("scope.getElementsByClassName({quoted})"),
            Strategy::Tag => format!("scope.getElementsByTagName({quoted})"),
            Strategy::XPath => format!(
                "(function() {{
                    const out = [];
                    const snap = document.evaluate({quoted}, scope === document ? document : scope,
                        null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
                    for (let i = 0; i < snap.snapshotLength; i++) out.push(snap.snapshotItem(i));
                    return out;
                }})()"
            ),
            Strategy::LinkText => format!(
                "Array.from(scope.getElementsByTagName('a')).filter(a => a.textContent.trim() === {quoted})"
            ),
            Strategy::PartialLinkText => format!(
                "Array.from(scope.getElementsByTagName('a')).filter(a => a.textContent.includes({quoted}))"
            ),
        }
    }
}

impl DomDriver for CdpDriver {
    fn find(
        &self,
        scope: Option<ElementHandle>,
        strategy: Strategy,
        expression: &str,
    ) -> Result<Vec<ElementHandle>, DriverError> {
        let scope_expr = scope.map_or_else(
            || "document".to_string(),
            |el| format!("(window.__recorrer_reg || [])[{}]", el.0),
        );
        let query = Self::query_expression(strategy, expression);
        let script = format!(
            r"(function() {{
                const reg = window.__recorrer_reg = window.__recorrer_reg || [];
                const scope = {scope_expr};
                if (!scope || (scope !== document && !scope.isConnected)) return {{ __stale: true }};
                const nodes = {query};
                const ids = [];
                for (const node of nodes) {{ reg.push(node); ids.push(reg.length - 1); }}
                return {{ ids: ids }};
            }})()"
        );
        let value = self.eval(&script)?;
        if value.get("__stale").is_some() {
            return Err(DriverError::StaleElement {
                detail: scope.map_or_else(|| "document".to_string(), |el| format!("element#{}", el.0)),
            });
        }
        let ids = value
            .get("ids")
            .and_then(Value::as_array)
            .ok_or_else(|| DriverError::Script {
                message: "element query returned no id list".to_string(),
            })?;
        Ok(ids
            .iter()
            .filter_map(Value::as_u64)
            .map(ElementHandle)
            .collect())
    }

    fn is_displayed(&self, element: ElementHandle) -> Result<bool, DriverError> {
        let value = self.eval_on(
            element,
            "return { value: !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length) };",
        )?;
        Ok(value.get("value").and_then(Value::as_bool).unwrap_or(false))
    }

    fn tag_name(&self, element: ElementHandle) -> Result<String, DriverError> {
        let value = self.eval_on(element, "return { value: el.tagName.toLowerCase() };")?;
        Ok(value
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn text(&self, element: ElementHandle) -> Result<String, DriverError> {
        let value = self.eval_on(
            element,
            "return { value: (el.innerText !== undefined ? el.innerText : el.textContent).trim() };",
        )?;
        Ok(value
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn attribute(
        &self,
        element: ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        let quoted = Value::String(name.to_string()).to_string();
        let value = self.eval_on(element, &format!("return {{ value: el.getAttribute({quoted}) }};"))?;
        Ok(value
            .get("value")
            .and_then(Value::as_str)
            .map(ToString::to_string))
    }

    fn set_attribute(
        &self,
        element: ElementHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DriverError> {
        let name_q = Value::String(name.to_string()).to_string();
        let value_q = Value::String(value.to_string()).to_string();
        let _ = self.eval_on(
            element,
            &format!("el.setAttribute({name_q}, {value_q}); return {{ value: true }};"),
        )?;
        Ok(())
    }

    fn click(&self, element: ElementHandle) -> Result<(), DriverError> {
        let _ = self.eval_on(element, "el.click(); return { value: true };")?;
        Ok(())
    }

    fn clear(&self, element: ElementHandle) -> Result<(), DriverError> {
        let _ = self.eval_on(
            element,
            "el.value = ''; el.dispatchEvent(new Event('input', { bubbles: true })); return { value: true };",
        )?;
        Ok(())
    }

    fn send_keys(&self, element: ElementHandle, text: &str) -> Result<(), DriverError> {
        let quoted = Value::String(text.to_string()).to_string();
        let _ = self.eval_on(
            element,
            &format!(
                "el.focus(); el.value = (el.value || '') + {quoted};
                 el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                 return {{ value: true }};"
            ),
        )?;
        Ok(())
    }

    fn move_pointer_to(&self, element: ElementHandle) -> Result<(), DriverError> {
        let _ = self.eval_on(
            element,
            "el.dispatchEvent(new MouseEvent('mouseover', { bubbles: true })); return { value: true };",
        )?;
        Ok(())
    }

    fn scroll_into_view(&self, element: ElementHandle) -> Result<(), DriverError> {
        let _ = self.eval_on(element, "el.scrollIntoView(); return { value: true };")?;
        Ok(())
    }

    fn execute_script(&self, script: &str, _args: &[Value]) -> Result<Value, DriverError> {
        // Wrap so scripts written as function bodies (`return {...}`) work
        self.eval(&format!("(function() {{ {script} }})()"))
    }

    fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.runtime.block_on(async {
            self.page.goto(url).await.map_err(backend_err)?;
            Ok(())
        })
    }

    fn current_url(&self) -> Result<String, DriverError> {
        let value = self.eval("location.href")?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn refresh(&self) -> Result<(), DriverError> {
        let _ = self.eval("location.reload(); true")?;
        Ok(())
    }

    fn alert_text(&self) -> Result<String, DriverError> {
        // Native dialogs need CDP event subscriptions this backend does
        // not install; report none so predicates read negative.
        Err(DriverError::NoAlert)
    }

    fn alert_accept(&self) -> Result<(), DriverError> {
        Err(DriverError::NoAlert)
    }

    fn alert_dismiss(&self) -> Result<(), DriverError> {
        Err(DriverError::NoAlert)
    }

    fn alert_send_keys(&self, _text: &str) -> Result<(), DriverError> {
        Err(DriverError::NoAlert)
    }

    fn quit(&self) -> Result<(), DriverError> {
        self.runtime.block_on(async {
            let mut browser = self.browser.lock().expect("cdp browser poisoned");
            browser.close().await.map_err(backend_err)?;
            Ok(())
        })
    }
}
