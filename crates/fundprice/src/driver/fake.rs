//! Scripted in-memory driver for component tests.
//!
//! Pages are registered by URL with the locators they contain. Navigation to a
//! page that requires a cookie the jar does not hold lands on the configured
//! login URL instead, which is enough to exercise the session state machine.

use super::{BrowserDriver, Condition, Cookie, DriverError, Locator, TabId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub(crate) struct FakePage {
    pub html: String,
    pub markers: Vec<Locator>,
    /// Cookie name that must be in the jar to view this page.
    pub requires_cookie: Option<String>,
    /// Where pressing Enter in any field leads.
    pub on_enter: Option<String>,
    /// Where clicking any control leads.
    pub on_click: Option<String>,
    /// Cookie granted when this page is reached.
    pub grants_cookie: Option<Cookie>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn marker(mut self, locator: Locator) -> Self {
        self.markers.push(locator);
        self
    }

    pub fn requires_cookie(mut self, name: &str) -> Self {
        self.requires_cookie = Some(name.to_string());
        self
    }

    pub fn on_enter(mut self, url: &str) -> Self {
        self.on_enter = Some(url.to_string());
        self
    }

    pub fn on_click(mut self, url: &str) -> Self {
        self.on_click = Some(url.to_string());
        self
    }

    pub fn grants_cookie(mut self, cookie: Cookie) -> Self {
        self.grants_cookie = Some(cookie);
        self
    }

    fn has(&self, locator: &Locator) -> bool {
        self.markers.contains(locator)
    }
}

#[derive(Default)]
pub(crate) struct FakeDriver {
    pages: HashMap<String, FakePage>,
    redirect_once: HashMap<String, String>,
    failing_urls: HashSet<String>,
    login_url: Option<String>,
    tabs: BTreeMap<TabId, Option<String>>,
    active: TabId,
    next_tab: u64,
    pub jar: Vec<Cookie>,
    pub navigations: Vec<String>,
    pub filled: Vec<(Locator, String)>,
    pub enter_presses: usize,
    pub clicks: usize,
    pub tabs_opened: usize,
    pub max_open_tabs: usize,
    pub shut_down: bool,
}

impl FakeDriver {
    pub fn new() -> Self {
        let mut driver = Self::default();
        driver.tabs.insert(TabId(0), None);
        driver.next_tab = 1;
        driver.max_open_tabs = 1;
        driver
    }

    pub fn page(mut self, url: &str, page: FakePage) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    /// Pages requiring a missing cookie land here.
    pub fn login_url(mut self, url: &str) -> Self {
        self.login_url = Some(url.to_string());
        self
    }

    /// The next navigation to `from` lands on `to`.
    pub fn redirect_once(mut self, from: &str, to: &str) -> Self {
        self.redirect_once.insert(from.to_string(), to.to_string());
        self
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.failing_urls.insert(url.to_string());
        self
    }

    pub fn open_tab_count(&self) -> usize {
        self.tabs.len()
    }

    fn current(&self) -> Option<&FakePage> {
        self.tabs
            .get(&self.active)
            .and_then(|u| u.as_ref())
            .and_then(|u| self.pages.get(u))
    }

    fn land(&mut self, url: &str) {
        let mut target = self
            .redirect_once
            .remove(url)
            .unwrap_or_else(|| url.to_string());

        if let Some(page) = self.pages.get(&target) {
            if let Some(required) = &page.requires_cookie {
                if !self.jar.iter().any(|c| &c.name == required) {
                    if let Some(login) = &self.login_url {
                        target = login.clone();
                    }
                }
            }
        }
        if let Some(cookie) = self.pages.get(&target).and_then(|p| p.grants_cookie.clone()) {
            self.jar.retain(|c| c.name != cookie.name);
            self.jar.push(cookie);
        }
        if let Some(slot) = self.tabs.get_mut(&self.active) {
            *slot = Some(target);
        }
    }

    fn holds(&self, condition: &Condition) -> bool {
        let present = self.current().is_some_and(|p| p.has(condition.locator()));
        match condition {
            Condition::Present(_) | Condition::Visible(_) => present,
            Condition::Absent(_) => !present,
        }
    }

    fn ensure_tab(&self) -> Result<(), DriverError> {
        if self.tabs.contains_key(&self.active) {
            Ok(())
        } else {
            Err(DriverError::Tab("no active tab".into()))
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.ensure_tab()?;
        self.navigations.push(url.to_string());
        if self.failing_urls.contains(url) {
            return Err(DriverError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_CONNECTION_RESET".into(),
            });
        }
        self.land(url);
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, DriverError> {
        self.ensure_tab()?;
        Ok(self.tabs[&self.active].clone().unwrap_or_default())
    }

    async fn wait_for(
        &mut self,
        condition: &Condition,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.ensure_tab()?;
        if self.holds(condition) {
            Ok(())
        } else {
            Err(DriverError::Timeout {
                what: condition.to_string(),
                timeout,
            })
        }
    }

    async fn outer_html(&mut self, locator: &Locator) -> Result<Option<String>, DriverError> {
        self.ensure_tab()?;
        Ok(self
            .current()
            .filter(|p| p.has(locator))
            .map(|p| p.html.clone()))
    }

    async fn page_html(&mut self) -> Result<String, DriverError> {
        self.ensure_tab()?;
        Ok(self.current().map(|p| p.html.clone()).unwrap_or_default())
    }

    async fn fill(&mut self, locator: &Locator, text: &str) -> Result<(), DriverError> {
        if !self.current().is_some_and(|p| p.has(locator)) {
            return Err(DriverError::ElementNotFound(locator.to_string()));
        }
        self.filled.push((locator.clone(), text.to_string()));
        Ok(())
    }

    async fn press_enter(&mut self, locator: &Locator) -> Result<(), DriverError> {
        let next = match self.current() {
            Some(p) if p.has(locator) => p.on_enter.clone(),
            _ => return Err(DriverError::ElementNotFound(locator.to_string())),
        };
        self.enter_presses += 1;
        if let Some(url) = next {
            self.land(&url);
        }
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), DriverError> {
        let next = match self.current() {
            Some(p) if p.has(locator) => p.on_click.clone(),
            _ => return Err(DriverError::ElementNotFound(locator.to_string())),
        };
        self.clicks += 1;
        if let Some(url) = next {
            self.land(&url);
        }
        Ok(())
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError> {
        Ok(self.jar.clone())
    }

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<(), DriverError> {
        for cookie in cookies {
            self.jar.retain(|c| c.name != cookie.name);
            self.jar.push(cookie.clone());
        }
        Ok(())
    }

    async fn open_tab(&mut self) -> Result<TabId, DriverError> {
        let id = TabId(self.next_tab);
        self.next_tab += 1;
        self.tabs.insert(id, None);
        self.tabs_opened += 1;
        self.max_open_tabs = self.max_open_tabs.max(self.tabs.len());
        Ok(id)
    }

    async fn switch_tab(&mut self, tab: TabId) -> Result<(), DriverError> {
        if !self.tabs.contains_key(&tab) {
            return Err(DriverError::Tab(format!("unknown tab {tab:?}")));
        }
        self.active = tab;
        Ok(())
    }

    async fn close_tab(&mut self, tab: TabId) -> Result<(), DriverError> {
        self.tabs
            .remove(&tab)
            .map(|_| ())
            .ok_or_else(|| DriverError::Tab(format!("unknown tab {tab:?}")))
    }

    fn active_tab(&self) -> TabId {
        self.active
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        self.shut_down = true;
        self.tabs.clear();
        Ok(())
    }
}
