//! Authenticated browser session: cookie resume with interactive login fallback.
//!
//! A run first tries to reuse cookies saved by an earlier run. If there are
//! none, or the site no longer honours them, it logs in once with the
//! configured credentials and saves the fresh cookie jar for next time.

use crate::driver::{BrowserDriver, Condition, DriverError, Locator};
use crate::store::{CookieStore, SavedCookies, StoreError};
use std::fmt;
use std::time::Duration;

/// Element only rendered for a signed-in user.
pub const ACCOUNT_MARKER_XPATH: &str = "//span[text()='My Account']";
pub const EMAIL_FIELD: &str = "Email";
pub const PASSWORD_FIELD: &str = "Password";
pub const LOGIN_BUTTON_ID: &str = "loginBtn";

fn account_marker() -> Locator {
    Locator::xpath(ACCOUNT_MARKER_XPATH)
}

/// Site login.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub login_url: String,
    /// Page used to prime the cookie domain and verify a resumed session.
    pub listing_url: String,
    /// Page loads and account-marker waits.
    pub long_timeout: Duration,
    /// Post-submit checks and the already-signed-in probe.
    pub short_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Resuming,
    LoggingIn,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    /// Nothing saved; nothing was touched.
    NoCookies,
    /// Saved cookies were rejected and have been deleted.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    LoggedIn,
    /// The login page showed the account marker instead of a form.
    AlreadyAuthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Resumed,
    LoggedIn,
    AlreadyAuthenticated,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("failed to load {url}: {source}")]
    Navigation {
        url: String,
        #[source]
        source: DriverError,
    },

    #[error("login form did not appear at {url} within {}s", .timeout.as_secs())]
    LoginFormMissing { url: String, timeout: Duration },

    #[error("not signed in after submitting credentials at {url} (waited {}s)", .timeout.as_secs())]
    NotAuthenticated { url: String, timeout: Duration },

    #[error("browser fault while {step}: {source}")]
    Driver {
        step: &'static str,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn driver_err(step: &'static str) -> impl FnOnce(DriverError) -> SessionError {
    move |source| SessionError::Driver { step, source }
}

/// Drives the resume/login state machine against one browser.
pub struct SessionManager<'a> {
    settings: SessionSettings,
    cookies: &'a mut dyn CookieStore,
    state: SessionState,
}

impl<'a> SessionManager<'a> {
    pub fn new(settings: SessionSettings, cookies: &'a mut dyn CookieStore) -> Self {
        Self {
            settings,
            cookies,
            state: SessionState::Fresh,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Resume from saved cookies, falling back to a single login.
    pub async fn establish(
        &mut self,
        driver: &mut dyn BrowserDriver,
        credentials: &Credentials,
    ) -> Result<SessionOutcome, SessionError> {
        match self.try_resume(driver).await? {
            ResumeOutcome::Resumed => return Ok(SessionOutcome::Resumed),
            ResumeOutcome::NoCookies => tracing::debug!("no saved session; logging in"),
            ResumeOutcome::Stale => tracing::info!("saved session expired; logging in"),
        }

        Ok(match self.login(driver, credentials).await? {
            LoginOutcome::LoggedIn => SessionOutcome::LoggedIn,
            LoginOutcome::AlreadyAuthenticated => SessionOutcome::AlreadyAuthenticated,
        })
    }

    pub async fn try_resume(
        &mut self,
        driver: &mut dyn BrowserDriver,
    ) -> Result<ResumeOutcome, SessionError> {
        let result = self.resume_inner(driver).await;
        self.settle(result)
    }

    pub async fn login(
        &mut self,
        driver: &mut dyn BrowserDriver,
        credentials: &Credentials,
    ) -> Result<LoginOutcome, SessionError> {
        let result = self.login_inner(driver, credentials).await;
        self.settle(result)
    }

    fn settle<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }

    async fn resume_inner(
        &mut self,
        driver: &mut dyn BrowserDriver,
    ) -> Result<ResumeOutcome, SessionError> {
        let saved = match self.cookies.load()? {
            SavedCookies::Missing => return Ok(ResumeOutcome::NoCookies),
            SavedCookies::Corrupt(reason) => {
                tracing::warn!("saved cookies are unreadable ({reason}); discarding");
                self.cookies.clear()?;
                self.state = SessionState::LoggingIn;
                return Ok(ResumeOutcome::Stale);
            }
            SavedCookies::Present(c) => c,
        };

        self.state = SessionState::Resuming;
        let url = self.settings.listing_url.clone();
        let nav_err = |source: DriverError| SessionError::Navigation {
            url: url.clone(),
            source,
        };

        // Cookies can only be set for the domain currently loaded.
        driver.navigate(&url).await.map_err(nav_err)?;
        driver
            .set_cookies(&saved)
            .await
            .map_err(driver_err("restoring cookies"))?;
        driver.navigate(&url).await.map_err(nav_err)?;

        match driver
            .wait_for(&Condition::Present(account_marker()), self.settings.long_timeout)
            .await
        {
            Ok(()) => {
                tracing::info!("resumed saved session ({} cookies)", saved.len());
                self.state = SessionState::Authenticated;
                Ok(ResumeOutcome::Resumed)
            }
            Err(e) if e.is_timeout() => {
                self.cookies.clear()?;
                self.state = SessionState::LoggingIn;
                Ok(ResumeOutcome::Stale)
            }
            Err(e) => Err(driver_err("checking resumed session")(e)),
        }
    }

    async fn login_inner(
        &mut self,
        driver: &mut dyn BrowserDriver,
        credentials: &Credentials,
    ) -> Result<LoginOutcome, SessionError> {
        self.state = SessionState::LoggingIn;
        let url = self.settings.login_url.clone();
        let long = self.settings.long_timeout;
        let short = self.settings.short_timeout;

        driver
            .navigate(&url)
            .await
            .map_err(|source| SessionError::Navigation {
                url: url.clone(),
                source,
            })?;

        let email = Locator::name(EMAIL_FIELD);
        let password = Locator::name(PASSWORD_FIELD);

        match driver.wait_for(&Condition::Visible(email.clone()), long).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                return match driver
                    .wait_for(&Condition::Present(account_marker()), short)
                    .await
                {
                    Ok(()) => {
                        tracing::info!("login page shows an active session");
                        self.state = SessionState::Authenticated;
                        self.save_jar(driver).await;
                        Ok(LoginOutcome::AlreadyAuthenticated)
                    }
                    Err(_) => Err(SessionError::LoginFormMissing { url, timeout: long }),
                };
            }
            Err(e) => return Err(driver_err("waiting for the login form")(e)),
        }

        driver
            .fill(&email, &credentials.username)
            .await
            .map_err(driver_err("entering the username"))?;
        driver
            .fill(&password, &credentials.password)
            .await
            .map_err(driver_err("entering the password"))?;

        let needs_click = match driver.press_enter(&password).await {
            Ok(()) => driver
                .wait_for(&Condition::Absent(email.clone()), short)
                .await
                .is_err(),
            Err(e) => {
                tracing::debug!("submitting with Enter failed: {e}");
                true
            }
        };
        if needs_click {
            tracing::debug!("login form still present; clicking the login button");
            if let Err(e) = driver.click(&Locator::id(LOGIN_BUTTON_ID)).await {
                tracing::warn!("login button click failed: {e}");
            }
        }

        match driver
            .wait_for(&Condition::Present(account_marker()), long)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                return Err(SessionError::NotAuthenticated { url, timeout: long })
            }
            Err(e) => return Err(driver_err("waiting for sign-in")(e)),
        }

        self.state = SessionState::Authenticated;
        self.save_jar(driver).await;

        tracing::info!("logged in as {}", credentials.username);
        Ok(LoginOutcome::LoggedIn)
    }

    /// Persist the browser's cookies. Failure only costs the next run a login.
    async fn save_jar(&mut self, driver: &mut dyn BrowserDriver) {
        match driver.cookies().await {
            Ok(jar) => {
                if let Err(e) = self.cookies.save(&jar) {
                    tracing::warn!("signed in but could not save cookies: {e}");
                }
            }
            Err(e) => tracing::warn!("signed in but could not read cookies: {e}"),
        }
    }
}
