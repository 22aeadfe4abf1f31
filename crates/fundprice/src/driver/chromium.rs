//! Chromium-based driver using chromiumoxide.

use super::{BrowserDriver, Condition, Cookie, DriverError, Locator, PollState, TabId};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, CookieSameSite, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Hides the automation flag from page scripts.
const HIDE_WEBDRIVER_JS: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Launch options for the browser process.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    /// Explicit browser binary. Falls back to [`find_chromium`].
    pub chrome_path: Option<PathBuf>,
    /// Upper bound for a single page navigation.
    pub page_load_timeout: Duration,
}

/// Map a CDP failure, singling out a dead browser connection.
fn cdp_error(context: &str, e: CdpError) -> DriverError {
    match e {
        CdpError::Ws(_) | CdpError::ChannelSendError(_) => {
            DriverError::Disconnected(format!("{context}: {e}"))
        }
        other => DriverError::Script(format!("{context}: {other}")),
    }
}

/// CDP parameters restoring a saved cookie.
///
/// Session cookies are reported with a non-positive expiry and stay session
/// cookies.
fn cookie_param(cookie: &Cookie) -> Result<CookieParam, DriverError> {
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone());
    if let Some(domain) = &cookie.domain {
        builder = builder.domain(domain.clone());
    }
    if let Some(path) = &cookie.path {
        builder = builder.path(path.clone());
    }
    if let Some(secure) = cookie.secure {
        builder = builder.secure(secure);
    }
    if let Some(http_only) = cookie.http_only {
        builder = builder.http_only(http_only);
    }
    if let Some(expires) = cookie.expires.filter(|e| *e > 0.0) {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }
    if let Some(same_site) = cookie
        .extra
        .get("sameSite")
        .and_then(|v| serde_json::from_value::<CookieSameSite>(v.clone()).ok())
    {
        builder = builder.same_site(same_site);
    }
    builder
        .build()
        .map_err(|e| DriverError::Script(format!("bad cookie {}: {e}", cookie.name)))
}

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FUNDPRICE_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Chromium driver holding the browser process and its open tabs.
pub struct ChromiumDriver {
    browser: Browser,
    handler: JoinHandle<()>,
    tabs: BTreeMap<TabId, Page>,
    active: TabId,
    next_tab: u64,
    page_load_timeout: Duration,
}

impl ChromiumDriver {
    /// Launch Chromium and open the first tab.
    pub async fn launch(options: BrowserOptions) -> Result<Self, DriverError> {
        let mut rng = rand::thread_rng();
        let width: u32 = rng.gen_range(1000..=2000);
        let height: u32 = rng.gen_range(1000..=2000);

        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg(format!("--user-agent={USER_AGENT}"));

        if let Some(path) = options.chrome_path.clone().or_else(find_chromium) {
            builder = builder.chrome_executable(path);
        }
        builder = if options.headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };

        let config = builder
            .build()
            .map_err(|e| DriverError::Launch(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Launch(format!("failed to launch Chromium: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        tracing::debug!("launched Chromium ({width}x{height}, headless={})", options.headless);

        let mut driver = Self {
            browser,
            handler,
            tabs: BTreeMap::new(),
            active: TabId(0),
            next_tab: 0,
            page_load_timeout: options.page_load_timeout,
        };
        let first = driver.new_tab().await?;
        driver.active = first;
        Ok(driver)
    }

    async fn new_tab(&mut self) -> Result<TabId, DriverError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Tab(format!("failed to open tab: {e}")))?;
        let init_script = AddScriptToEvaluateOnNewDocumentParams::new(HIDE_WEBDRIVER_JS);
        page.evaluate_on_new_document(init_script)
            .await
            .map_err(|e| DriverError::Script(format!("failed to install init script: {e}")))?;

        let id = TabId(self.next_tab);
        self.next_tab += 1;
        self.tabs.insert(id, page);
        Ok(id)
    }

    fn page(&self) -> Result<&Page, DriverError> {
        self.tabs
            .get(&self.active)
            .ok_or_else(|| DriverError::Tab(format!("no active tab ({:?} is closed)", self.active)))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T, DriverError> {
        let result = self
            .page()?
            .evaluate(script)
            .await
            .map_err(|e| cdp_error("evaluate", e))?;
        result
            .into_value()
            .map_err(|e| DriverError::Script(format!("failed to convert JS result: {e:?}")))
    }

    async fn find(&self, locator: &Locator) -> Result<Element, DriverError> {
        let page = self.page()?;
        let found = match locator {
            Locator::XPath(xp) => page.find_xpath(xp.as_str()).await,
            other => page.find_element(other.as_css().unwrap_or_default()).await,
        };
        found.map_err(|e| DriverError::ElementNotFound(format!("{locator}: {e}")))
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let timeout = self.page_load_timeout;
        let page = self.page()?;

        let load = async {
            page.goto(url).await?;
            if let Err(e) = page.wait_for_navigation().await {
                tracing::trace!("waiting for {url} to settle: {e}");
            }
            Ok::<_, CdpError>(())
        };
        match tokio::time::timeout(timeout, load).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ (CdpError::Ws(_) | CdpError::ChannelSendError(_)))) => {
                Err(cdp_error(&format!("navigate to {url}"), e))
            }
            Ok(Err(e)) => Err(DriverError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DriverError::Timeout {
                what: format!("page load of {url}"),
                timeout,
            }),
        }
    }

    async fn current_url(&mut self) -> Result<String, DriverError> {
        let url = self
            .page()?
            .url()
            .await
            .map_err(|e| DriverError::Script(format!("failed to get URL: {e}")))?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn wait_for(
        &mut self,
        condition: &Condition,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let script = condition.probe_script();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = PollState::default();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let probe = match tokio::time::timeout(remaining, self.eval::<bool>(&script)).await {
                Ok(probe) => probe,
                Err(_) => return Err(poll.expire(condition.to_string(), timeout)),
            };
            if let Err(e) = &probe {
                tracing::trace!("probe for {condition} failed: {e}");
            }
            if let Some(decided) = poll.record(probe) {
                return decided;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(poll.expire(condition.to_string(), timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn outer_html(&mut self, locator: &Locator) -> Result<Option<String>, DriverError> {
        let script = format!(
            "(() => {{ const el = {}; return el ? el.outerHTML : ''; }})()",
            locator.element_expr()
        );
        let html: String = self.eval(&script).await?;
        Ok(if html.is_empty() { None } else { Some(html) })
    }

    async fn page_html(&mut self) -> Result<String, DriverError> {
        self.eval("document.documentElement.outerHTML").await
    }

    async fn fill(&mut self, locator: &Locator, text: &str) -> Result<(), DriverError> {
        let element = self.find(locator).await?;
        element
            .click()
            .await
            .map_err(|e| DriverError::Script(format!("focus {locator}: {e}")))?;
        element
            .type_str(text)
            .await
            .map_err(|e| DriverError::Script(format!("type into {locator}: {e}")))?;
        Ok(())
    }

    async fn press_enter(&mut self, locator: &Locator) -> Result<(), DriverError> {
        let element = self.find(locator).await?;
        element
            .press_key("Enter")
            .await
            .map_err(|e| DriverError::Script(format!("press Enter in {locator}: {e}")))?;
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), DriverError> {
        let element = self.find(locator).await?;
        element
            .click()
            .await
            .map_err(|e| DriverError::Script(format!("click {locator}: {e}")))?;
        Ok(())
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError> {
        let native = self
            .page()?
            .get_cookies()
            .await
            .map_err(|e| cdp_error("failed to read cookies", e))?;

        native
            .into_iter()
            .map(|c| {
                serde_json::to_value(&c)
                    .and_then(serde_json::from_value)
                    .map_err(|e| DriverError::Script(format!("unexpected cookie shape: {e}")))
            })
            .collect()
    }

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<(), DriverError> {
        let params = cookies
            .iter()
            .map(cookie_param)
            .collect::<Result<Vec<_>, _>>()?;

        self.page()?
            .set_cookies(params)
            .await
            .map_err(|e| cdp_error("failed to set cookies", e))?;
        Ok(())
    }

    async fn open_tab(&mut self) -> Result<TabId, DriverError> {
        self.new_tab().await
    }

    async fn switch_tab(&mut self, tab: TabId) -> Result<(), DriverError> {
        let page = self
            .tabs
            .get(&tab)
            .ok_or_else(|| DriverError::Tab(format!("unknown tab {tab:?}")))?;
        page.bring_to_front()
            .await
            .map_err(|e| DriverError::Tab(format!("failed to activate tab: {e}")))?;
        self.active = tab;
        Ok(())
    }

    async fn close_tab(&mut self, tab: TabId) -> Result<(), DriverError> {
        let page = self
            .tabs
            .remove(&tab)
            .ok_or_else(|| DriverError::Tab(format!("unknown tab {tab:?}")))?;
        page.close()
            .await
            .map_err(|e| DriverError::Tab(format!("failed to close tab: {e}")))?;
        Ok(())
    }

    fn active_tab(&self) -> TabId {
        self.active
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        for (_, page) in std::mem::take(&mut self.tabs) {
            let _ = page.close().await;
        }
        let closed = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler.abort();
        closed
            .map(|_| ())
            .map_err(|e| DriverError::Launch(format!("failed to close browser: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restored_cookie_keeps_expiry_and_same_site() {
        let raw = r#"{"name":"sid","value":"abc","domain":".investsmart.com.au","path":"/",
                      "expires":1798761600.5,"httpOnly":true,"secure":true,"sameSite":"Lax"}"#;
        let cookie: Cookie = serde_json::from_str(raw).unwrap();
        let param = cookie_param(&cookie).unwrap();

        assert_eq!(param.expires.as_ref().map(|t| *t.inner()), Some(1798761600.5));
        assert_eq!(param.same_site, Some(CookieSameSite::Lax));
        assert_eq!(param.domain.as_deref(), Some(".investsmart.com.au"));
        assert_eq!(param.http_only, Some(true));
    }

    #[test]
    fn test_session_cookie_stays_a_session_cookie() {
        let raw = r#"{"name":"sid","value":"abc","expires":-1,"session":true}"#;
        let cookie: Cookie = serde_json::from_str(raw).unwrap();
        let param = cookie_param(&cookie).unwrap();

        assert!(param.expires.is_none());
        assert!(param.same_site.is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_tabs_and_waits() {
        let mut driver = ChromiumDriver::launch(BrowserOptions {
            headless: true,
            chrome_path: None,
            page_load_timeout: Duration::from_secs(20),
        })
        .await
        .expect("failed to launch");

        driver
            .navigate("data:text/html,<table class='t'><tr><td>1</td></tr></table>")
            .await
            .expect("navigation failed");
        driver
            .wait_for(&Condition::Present(Locator::css("table.t")), Duration::from_secs(5))
            .await
            .expect("table never appeared");

        let html = driver.outer_html(&Locator::css("table.t")).await.unwrap();
        assert!(html.unwrap().contains("<td>1</td>"));

        let err = driver
            .wait_for(&Condition::Present(Locator::css("#missing")), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let main = driver.active_tab();
        let extra = driver.open_tab().await.unwrap();
        driver.switch_tab(extra).await.unwrap();
        driver.close_tab(extra).await.unwrap();
        driver.switch_tab(main).await.unwrap();

        driver.shutdown().await.expect("shutdown failed");
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_slow_page_load_is_bounded() {
        let mut driver = ChromiumDriver::launch(BrowserOptions {
            headless: true,
            chrome_path: None,
            page_load_timeout: Duration::from_millis(1),
        })
        .await
        .expect("failed to launch");

        // Non-routable address: the load can only end by the deadline.
        let err = driver.navigate("http://10.255.255.1/").await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");

        driver.shutdown().await.expect("shutdown failed");
    }
}
