//! Browser driver abstraction.
//!
//! Defines the `BrowserDriver` trait that the session and extraction layers
//! drive. The production implementation is Chromium via chromiumoxide; tests
//! use a scripted in-memory driver.

pub mod chromium;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors raised by a browser driver.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    /// A bounded wait expired before its condition held.
    #[error("timed out after {}s waiting for {what}", .timeout.as_secs())]
    Timeout { what: String, timeout: Duration },

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("tab error: {0}")]
    Tab(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    /// The connection to the browser is gone.
    #[error("browser connection lost: {0}")]
    Disconnected(String),
}

impl DriverError {
    /// Whether this error is an expired wait rather than a driver fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }

    /// Faults no amount of re-polling can clear.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Tab(_) | DriverError::Disconnected(_))
    }
}

/// Bookkeeping for a polled wait.
///
/// Probe failures are tolerated while a navigation swaps the document. A wait
/// whose probes never evaluated at all reports the last failure instead of a
/// timeout.
#[derive(Debug, Default)]
pub(crate) struct PollState {
    evaluated: bool,
    last_error: Option<DriverError>,
}

impl PollState {
    /// Record one probe. Returns the wait's result once it is decided.
    pub fn record(&mut self, probe: Result<bool, DriverError>) -> Option<Result<(), DriverError>> {
        match probe {
            Ok(true) => Some(Ok(())),
            Ok(false) => {
                self.evaluated = true;
                None
            }
            Err(e) if e.is_fatal() => Some(Err(e)),
            Err(e) => {
                self.last_error = Some(e);
                None
            }
        }
    }

    /// Result once the deadline passes.
    pub fn expire(self, what: String, timeout: Duration) -> DriverError {
        match self.last_error {
            Some(e) if !self.evaluated => e,
            _ => DriverError::Timeout { what, timeout },
        }
    }
}

/// How to find an element on the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Css(String),
    XPath(String),
    /// Form control by its `name` attribute.
    Name(String),
    Id(String),
}

impl Locator {
    pub fn css(s: impl Into<String>) -> Self {
        Locator::Css(s.into())
    }

    pub fn xpath(s: impl Into<String>) -> Self {
        Locator::XPath(s.into())
    }

    pub fn name(s: impl Into<String>) -> Self {
        Locator::Name(s.into())
    }

    pub fn id(s: impl Into<String>) -> Self {
        Locator::Id(s.into())
    }

    /// CSS selector equivalent, if one exists.
    pub fn as_css(&self) -> Option<String> {
        match self {
            Locator::Css(s) => Some(s.clone()),
            Locator::Name(n) => Some(format!("[name={}]", js_string(n))),
            Locator::Id(id) => Some(format!("[id={}]", js_string(id))),
            Locator::XPath(_) => None,
        }
    }

    /// JavaScript expression evaluating to the first matching element or `null`.
    pub fn element_expr(&self) -> String {
        match self {
            Locator::XPath(xp) => format!(
                "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
                js_string(xp)
            ),
            other => {
                // Every non-XPath locator has a CSS form.
                let css = other.as_css().unwrap_or_default();
                format!("document.querySelector({})", js_string(&css))
            }
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css `{s}`"),
            Locator::XPath(s) => write!(f, "xpath `{s}`"),
            Locator::Name(s) => write!(f, "element named `{s}`"),
            Locator::Id(s) => write!(f, "element #{s}"),
        }
    }
}

/// A condition a driver can wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The element exists in the DOM.
    Present(Locator),
    /// The element exists and is rendered with a non-empty box.
    Visible(Locator),
    /// No element matches.
    Absent(Locator),
}

impl Condition {
    pub fn locator(&self) -> &Locator {
        match self {
            Condition::Present(l) | Condition::Visible(l) | Condition::Absent(l) => l,
        }
    }

    /// JavaScript expression evaluating to `true` once the condition holds.
    pub fn probe_script(&self) -> String {
        let el = self.locator().element_expr();
        match self {
            Condition::Present(_) => format!("({el}) !== null"),
            Condition::Absent(_) => format!("({el}) === null"),
            Condition::Visible(_) => format!(
                "(() => {{ const el = {el}; if (!el) return false; \
                 const r = el.getBoundingClientRect(); const s = window.getComputedStyle(el); \
                 return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none'; }})()"
            ),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Present(l) => write!(f, "{l} to be present"),
            Condition::Visible(l) => write!(f, "{l} to be visible"),
            Condition::Absent(l) => write!(f, "{l} to disappear"),
        }
    }
}

/// Opaque handle to a browser tab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(pub u64);

/// A browser cookie in the driver's native JSON shape.
///
/// Fields the crate does not interpret are kept in `extra` so the persisted
/// file round-trips whatever the browser reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            http_only: None,
            secure: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Capabilities the scraper needs from a browser session.
///
/// All operations act on the active tab. Waits are bounded by the timeout
/// passed in and report expiry as `DriverError::Timeout`.
#[async_trait]
pub trait BrowserDriver: Send {
    /// Navigate the active tab and wait for the load to finish.
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// URL of the active tab after redirects.
    async fn current_url(&mut self) -> Result<String, DriverError>;

    /// Poll until `condition` holds or `timeout` expires.
    async fn wait_for(&mut self, condition: &Condition, timeout: Duration)
        -> Result<(), DriverError>;

    /// `outerHTML` of the first element matching `locator`, if any.
    async fn outer_html(&mut self, locator: &Locator) -> Result<Option<String>, DriverError>;

    /// Full HTML of the active tab.
    async fn page_html(&mut self) -> Result<String, DriverError>;

    /// Type `text` into the matching form control.
    async fn fill(&mut self, locator: &Locator, text: &str) -> Result<(), DriverError>;

    /// Press Enter with focus in the matching element.
    async fn press_enter(&mut self, locator: &Locator) -> Result<(), DriverError>;

    async fn click(&mut self, locator: &Locator) -> Result<(), DriverError>;

    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError>;

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<(), DriverError>;

    /// Open a blank tab. The active tab does not change.
    async fn open_tab(&mut self) -> Result<TabId, DriverError>;

    async fn switch_tab(&mut self, tab: TabId) -> Result<(), DriverError>;

    /// Close a tab. Closing the active tab leaves no tab active until
    /// `switch_tab` is called.
    async fn close_tab(&mut self, tab: TabId) -> Result<(), DriverError>;

    fn active_tab(&self) -> TabId;

    /// Release the browser. Further calls fail.
    async fn shutdown(&mut self) -> Result<(), DriverError>;
}

/// Quote `s` as a JavaScript string literal.
pub(crate) fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
