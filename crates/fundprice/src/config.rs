//! Configuration loading, validation and path resolution.
//!
//! Settings live in a YAML file with three PascalCase sections:
//! `InvestSmart` (site and credentials), `Files` (ledger, caches and logs)
//! and `Email` (failure notifications). File names given relative to the
//! config file are resolved against its directory.

use crate::driver::chromium::BrowserOptions;
use crate::extract::ExtractSettings;
use crate::logging::{LogFile, LogOptions, Verbosity};
use crate::session::{Credentials, SessionSettings};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "FUNDPRICE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_DAYS_TO_SAVE: u32 = 30;
pub const MAX_DAYS_TO_SAVE: u32 = 365;
pub const FATAL_MARKER_FILE: &str = "fundprice_fatal_error.txt";

const DEFAULT_LOGIN_URL: &str = "https://www.investsmart.com.au/identity/logon";
const DEFAULT_WATCHLIST_URL: &str =
    "https://www.investsmart.com.au/portfolio-manager/watchlist/funds/850523?PortfolioID=184911";
const DEFAULT_DECOY_PREFIX: &str = "https://www.fundlater.com.au/";

/// Starter config written by `fundprice init-config`.
pub const TEMPLATE: &str = r#"InvestSmart:
  HeadlessMode: false
  LoginURL: https://www.investsmart.com.au/identity/logon
  WatchlistURL: https://www.investsmart.com.au/portfolio-manager/watchlist/funds/850523?PortfolioID=184911
  LongPageLoad: 30
  ShortPageLoad: 10
  DetailPageLoad: 10
  Username: <Your InvestSmart Username>
  Password: <Your InvestSmart Password>

Files:
  OutputCSV: price_data.csv
  DaysToSave: 30
  LogfileName: fundprice.log
  LogfileMaxLines: 500
  LogfileVerbosity: detailed
  ConsoleVerbosity: summary

Email:
  EnableEmail: false
  SendEmailsTo: <Your email address here>
  SMTPServer: smtp.gmail.com
  SMTPPort: 587
  SMTPUsername: <Your SMTP username here>
  SMTPPassword: <Your SMTP password here>
  SubjectPrefix: "[fundprice] "
"#;

/// Resolve the config file path.
///
/// Priority: explicit flag, then `FUNDPRICE_CONFIG`, then `./config.yaml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Write the starter config. Refuses to overwrite an existing file.
pub fn write_template(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists; not overwriting", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, TEMPLATE).with_context(|| format!("failed to write {}", path.display()))
}

fn default_login_url() -> String {
    DEFAULT_LOGIN_URL.to_string()
}

fn default_watchlist_url() -> String {
    DEFAULT_WATCHLIST_URL.to_string()
}

fn default_long() -> u64 {
    30
}

fn default_short() -> u64 {
    10
}

fn default_decoys() -> Vec<String> {
    vec![DEFAULT_DECOY_PREFIX.to_string()]
}

fn default_output_csv() -> String {
    "price_data.csv".to_string()
}

fn default_logfile() -> Option<String> {
    Some("fundprice.log".to_string())
}

fn default_max_lines() -> usize {
    500
}

fn default_logfile_verbosity() -> Verbosity {
    Verbosity::Detailed
}

fn default_console_verbosity() -> Verbosity {
    Verbosity::Summary
}

fn default_cookie_file() -> String {
    "cookies.json".to_string()
}

fn default_code_cache() -> String {
    "fund_code_cache.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSettings {
    #[serde(rename = "HeadlessMode", default)]
    pub headless: Option<bool>,
    #[serde(rename = "LoginURL", default = "default_login_url")]
    pub login_url: String,
    #[serde(rename = "WatchlistURL", default = "default_watchlist_url")]
    pub watchlist_url: String,
    #[serde(rename = "LongPageLoad", default = "default_long")]
    pub long_page_load: u64,
    #[serde(rename = "ShortPageLoad", default = "default_short")]
    pub short_page_load: u64,
    #[serde(rename = "DetailPageLoad", default = "default_short")]
    pub detail_page_load: u64,
    #[serde(rename = "Username", default)]
    pub username: Option<String>,
    #[serde(rename = "Password", default)]
    pub password: Option<String>,
    #[serde(rename = "RedirectRetryPrefixes", default = "default_decoys")]
    pub redirect_retry_prefixes: Vec<String>,
    #[serde(rename = "ChromiumPath", default)]
    pub chromium_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSettings {
    #[serde(rename = "OutputCSV", default = "default_output_csv")]
    pub output_csv: String,
    #[serde(rename = "DaysToSave", default)]
    pub days_to_save: Option<u32>,
    #[serde(rename = "LogfileName", default = "default_logfile")]
    pub logfile_name: Option<String>,
    #[serde(rename = "LogfileMaxLines", default = "default_max_lines")]
    pub logfile_max_lines: usize,
    #[serde(rename = "LogfileVerbosity", default = "default_logfile_verbosity")]
    pub logfile_verbosity: Verbosity,
    #[serde(rename = "ConsoleVerbosity", default = "default_console_verbosity")]
    pub console_verbosity: Verbosity,
    #[serde(rename = "CookieFile", default = "default_cookie_file")]
    pub cookie_file: String,
    #[serde(rename = "CodeCacheFile", default = "default_code_cache")]
    pub code_cache_file: String,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            output_csv: default_output_csv(),
            days_to_save: None,
            logfile_name: default_logfile(),
            logfile_max_lines: default_max_lines(),
            logfile_verbosity: default_logfile_verbosity(),
            console_verbosity: default_console_verbosity(),
            cookie_file: default_cookie_file(),
            code_cache_file: default_code_cache(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(rename = "EnableEmail", default)]
    pub enabled: bool,
    #[serde(rename = "SendEmailsTo", default)]
    pub send_to: Option<String>,
    #[serde(rename = "SMTPServer", default)]
    pub smtp_server: Option<String>,
    #[serde(rename = "SMTPPort", default)]
    pub smtp_port: Option<u16>,
    #[serde(rename = "SMTPUsername", default)]
    pub smtp_username: Option<String>,
    #[serde(rename = "SMTPPassword", default)]
    pub smtp_password: Option<String>,
    #[serde(rename = "SubjectPrefix", default)]
    pub subject_prefix: Option<String>,
}

/// Validated settings for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "InvestSmart")]
    pub site: SiteSettings,
    #[serde(rename = "Files", default)]
    pub files: FileSettings,
    #[serde(rename = "Email", default)]
    pub email: EmailSettings,
    /// Directory relative file names resolve against.
    #[serde(skip)]
    base_dir: PathBuf,
}

fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.starts_with('<') && v.ends_with('>')
}

fn require<'a>(value: Option<&'a str>, key: &str) -> Result<&'a str> {
    match value.map(str::trim) {
        None | Some("") => bail!("{key} is required"),
        Some(v) if is_placeholder(v) => bail!("{key} still holds the placeholder {v:?}"),
        Some(v) => Ok(v),
    }
}

fn check_url(value: &str, key: &str) -> Result<()> {
    let url = Url::parse(value).with_context(|| format!("{key} is not a valid URL: {value:?}"))?;
    ensure!(
        matches!(url.scheme(), "http" | "https"),
        "{key} must be an http(s) URL: {value:?}"
    );
    Ok(())
}

impl Settings {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&text, base_dir)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Parse and validate YAML, resolving relative paths against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut settings: Settings = serde_yaml::from_str(text).context("malformed YAML")?;
        settings.base_dir = base_dir.into();
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let site = &self.site;
        require(site.username.as_deref(), "InvestSmart.Username")?;
        require(site.password.as_deref(), "InvestSmart.Password")?;
        check_url(&site.login_url, "InvestSmart.LoginURL")?;
        check_url(&site.watchlist_url, "InvestSmart.WatchlistURL")?;
        for (key, secs) in [
            ("InvestSmart.LongPageLoad", site.long_page_load),
            ("InvestSmart.ShortPageLoad", site.short_page_load),
            ("InvestSmart.DetailPageLoad", site.detail_page_load),
        ] {
            ensure!(secs > 0, "{key} must be at least 1 second");
        }

        let files = &self.files;
        ensure!(!files.output_csv.trim().is_empty(), "Files.OutputCSV is required");
        if let Some(days) = files.days_to_save {
            ensure!(
                days <= MAX_DAYS_TO_SAVE,
                "Files.DaysToSave must be between 0 and {MAX_DAYS_TO_SAVE}, got {days}"
            );
        }
        ensure!(
            files.logfile_max_lines <= 100_000,
            "Files.LogfileMaxLines must be between 0 and 100000"
        );
        ensure!(
            files.console_verbosity != Verbosity::None,
            "Files.ConsoleVerbosity cannot be none"
        );

        let email = &self.email;
        if email.enabled {
            require(email.smtp_server.as_deref(), "Email.SMTPServer")?;
            let to = require(email.send_to.as_deref(), "Email.SendEmailsTo")?;
            ensure!(to.contains('@'), "Email.SendEmailsTo is not an email address: {to:?}");
            match email.smtp_port {
                None => bail!("Email.SMTPPort is required"),
                Some(port) => ensure!(
                    (25..=1000).contains(&port),
                    "Email.SMTPPort must be between 25 and 1000, got {port}"
                ),
            }
            for (key, value) in [
                ("Email.SMTPUsername", &email.smtp_username),
                ("Email.SMTPPassword", &email.smtp_password),
            ] {
                if value.as_deref().is_some_and(is_placeholder) {
                    bail!("{key} still holds a placeholder");
                }
            }
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a configured file name against the config directory.
    pub fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn output_csv(&self) -> PathBuf {
        self.resolve(&self.files.output_csv)
    }

    pub fn cookie_file(&self) -> PathBuf {
        self.resolve(&self.files.cookie_file)
    }

    pub fn code_cache_file(&self) -> PathBuf {
        self.resolve(&self.files.code_cache_file)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.files
            .logfile_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| self.resolve(n))
    }

    /// Marker remembering a failed run, kept beside the log file.
    pub fn fatal_marker_file(&self) -> PathBuf {
        let dir = self
            .log_file()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| self.base_dir.clone());
        dir.join(FATAL_MARKER_FILE)
    }

    pub fn retention_days(&self) -> u32 {
        self.files.days_to_save.unwrap_or(DEFAULT_DAYS_TO_SAVE)
    }

    pub fn headless(&self) -> bool {
        self.site.headless.unwrap_or(false)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.site.long_page_load)
    }

    pub fn short_timeout(&self) -> Duration {
        Duration::from_secs(self.site.short_page_load)
    }

    pub fn detail_timeout(&self) -> Duration {
        Duration::from_secs(self.site.detail_page_load)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.site.username.clone().unwrap_or_default(),
            self.site.password.clone().unwrap_or_default(),
        )
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            login_url: self.site.login_url.clone(),
            listing_url: self.site.watchlist_url.clone(),
            long_timeout: self.long_timeout(),
            short_timeout: self.short_timeout(),
        }
    }

    pub fn extract_settings(&self) -> ExtractSettings {
        ExtractSettings {
            listing_url: self.site.watchlist_url.clone(),
            redirect_retry_prefixes: self.site.redirect_retry_prefixes.clone(),
            page_load_timeout: self.long_timeout(),
            detail_timeout: self.detail_timeout(),
        }
    }

    /// Browser launch options; `force_headless` comes from the command line.
    pub fn browser_options(&self, force_headless: bool) -> BrowserOptions {
        BrowserOptions {
            headless: force_headless || self.headless(),
            chrome_path: self.site.chromium_path.clone(),
            page_load_timeout: self.long_timeout(),
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            console: self.files.console_verbosity,
            file: self.log_file().map(|path| LogFile {
                path,
                verbosity: self.files.logfile_verbosity,
                max_lines: self.files.logfile_max_lines,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "InvestSmart:\n  Username: me@example.com\n  Password: secret\n";

    #[test]
    fn test_minimal_config_gets_defaults() {
        let s = Settings::from_yaml(MINIMAL, "/srv/fundprice").unwrap();
        assert_eq!(s.retention_days(), 30);
        assert_eq!(s.long_timeout(), Duration::from_secs(30));
        assert_eq!(s.detail_timeout(), Duration::from_secs(10));
        assert_eq!(s.output_csv(), PathBuf::from("/srv/fundprice/price_data.csv"));
        assert_eq!(s.cookie_file(), PathBuf::from("/srv/fundprice/cookies.json"));
        assert_eq!(
            s.fatal_marker_file(),
            PathBuf::from("/srv/fundprice").join(FATAL_MARKER_FILE)
        );
        assert_eq!(s.site.redirect_retry_prefixes, vec![DEFAULT_DECOY_PREFIX]);
        assert!(!s.email.enabled);
    }

    #[test]
    fn test_template_placeholders_rejected() {
        let err = Settings::from_yaml(TEMPLATE, ".").unwrap_err();
        assert!(format!("{err:#}").contains("placeholder"), "{err:#}");
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(is_placeholder("<Your InvestSmart Username>"));
        assert!(!is_placeholder("user<1>name"));
    }
}
