//! Watchlist extraction: listing table → priced records with APIR codes.

pub mod table;

use crate::driver::{BrowserDriver, Condition, DriverError, Locator};
use crate::store::CodeStore;
use crate::types::PriceRecord;
use chrono::NaiveDate;
use std::time::Duration;
use table::{find_apir_code, parse_listing, ListingRow};
use url::Url;

/// Container holding the watchlist table.
pub const LISTING_CONTAINER: &str = "table[data-sortable-name='watchlist']";

/// Element that marks a loaded fund detail page.
pub const DETAIL_MARKER: &str = "table.table-performance";

/// Errors that end extraction. Row-level problems never surface here.
#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("failed to load watchlist {url}: {source}")]
    Navigation {
        url: String,
        #[source]
        source: DriverError,
    },

    #[error("watchlist table not found at {url}: {source}")]
    Container {
        url: String,
        #[source]
        source: DriverError,
    },

    #[error("watchlist table at {url} has no column matching {}", .missing.join(", "))]
    MissingColumns { url: String, missing: Vec<&'static str> },

    #[error("failed to return to the watchlist tab: {0}")]
    TabCleanup(#[source] DriverError),
}

/// Where and how long to look.
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub listing_url: String,
    /// Landing on a URL with one of these prefixes triggers one re-request.
    pub redirect_retry_prefixes: Vec<String>,
    pub page_load_timeout: Duration,
    pub detail_timeout: Duration,
}

/// Counters for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub rows: usize,
    pub skipped: usize,
    pub cache_hits: usize,
    pub lookups: usize,
    pub codes_found: usize,
}

#[derive(Debug)]
pub struct Extraction {
    pub records: Vec<PriceRecord>,
    pub stats: ExtractStats,
}

/// Reads the watchlist of an authenticated session.
pub struct TableExtractor {
    settings: ExtractSettings,
}

impl TableExtractor {
    pub fn new(settings: ExtractSettings) -> Self {
        Self { settings }
    }

    /// Extract every readable row, stamped with `date`.
    pub async fn extract(
        &self,
        driver: &mut dyn BrowserDriver,
        codes: &mut dyn CodeStore,
        date: NaiveDate,
    ) -> Result<Extraction, ExtractError> {
        let url = self.settings.listing_url.as_str();
        self.open_listing(driver).await?;

        let container = Locator::css(LISTING_CONTAINER);
        let container_err = |source: DriverError| ExtractError::Container {
            url: url.to_string(),
            source,
        };
        driver
            .wait_for(
                &Condition::Present(container.clone()),
                self.settings.page_load_timeout,
            )
            .await
            .map_err(container_err)?;
        let table_html = driver
            .outer_html(&container)
            .await
            .map_err(container_err)?
            .ok_or_else(|| {
                container_err(DriverError::ElementNotFound(container.to_string()))
            })?;

        let listing =
            parse_listing(&table_html).map_err(|missing| ExtractError::MissingColumns {
                url: url.to_string(),
                missing: missing.0,
            })?;
        tracing::debug!(
            "watchlist columns: name={} price={} of {:?}",
            listing.columns.name,
            listing.columns.price,
            listing.headers
        );

        let base = Url::parse(url).ok();
        let mut stats = ExtractStats::default();
        let mut records = Vec::new();

        for (idx, row) in listing.rows.into_iter().enumerate() {
            stats.rows += 1;
            let row = match row {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("skipping watchlist row {}: {e}", idx + 1);
                    stats.skipped += 1;
                    continue;
                }
            };

            let code = match codes.get(&row.name) {
                Some(code) => {
                    stats.cache_hits += 1;
                    Some(code)
                }
                None => {
                    let detail_url = match resolve_href(base.as_ref(), &row.href) {
                        Some(u) => u,
                        None => {
                            tracing::warn!(
                                "skipping {}: unusable link {:?}",
                                row.name,
                                row.href
                            );
                            stats.skipped += 1;
                            continue;
                        }
                    };
                    stats.lookups += 1;
                    match self.lookup_code(driver, &detail_url).await? {
                        Ok(Some(code)) => {
                            stats.codes_found += 1;
                            if let Err(e) = codes.put(&row.name, &code) {
                                tracing::warn!("could not cache code for {}: {e}", row.name);
                            }
                            Some(code)
                        }
                        Ok(None) => {
                            tracing::info!("no APIR code on detail page for {}", row.name);
                            None
                        }
                        Err(e) => {
                            tracing::warn!("skipping {}: detail lookup failed: {e}", row.name);
                            stats.skipped += 1;
                            continue;
                        }
                    }
                }
            };

            records.push(to_record(row, code, date));
        }

        tracing::info!(
            "extracted {} funds ({} skipped, {} codes cached, {} looked up)",
            records.len(),
            stats.skipped,
            stats.cache_hits,
            stats.lookups
        );
        Ok(Extraction { records, stats })
    }

    async fn open_listing(&self, driver: &mut dyn BrowserDriver) -> Result<(), ExtractError> {
        let url = &self.settings.listing_url;
        let nav_err = |source: DriverError| ExtractError::Navigation {
            url: url.clone(),
            source,
        };

        driver.navigate(url).await.map_err(nav_err)?;
        let landed = driver.current_url().await.map_err(nav_err)?;
        if self.is_decoy(&landed) {
            tracing::info!("redirected to {landed}; requesting the watchlist again");
            driver.navigate(url).await.map_err(nav_err)?;
        }
        Ok(())
    }

    fn is_decoy(&self, landed: &str) -> bool {
        self.settings
            .redirect_retry_prefixes
            .iter()
            .any(|p| !p.is_empty() && landed.starts_with(p.as_str()))
    }

    /// Visit a detail page in a scratch tab.
    ///
    /// The outer `Result` is fatal (the listing tab could not be restored);
    /// the inner one is the per-row lookup outcome.
    async fn lookup_code(
        &self,
        driver: &mut dyn BrowserDriver,
        detail_url: &str,
    ) -> Result<Result<Option<String>, DriverError>, ExtractError> {
        let home = driver.active_tab();
        let tab = match driver.open_tab().await {
            Ok(t) => t,
            Err(e) => return Ok(Err(e)),
        };

        let lookup = async {
            driver.switch_tab(tab).await?;
            driver.navigate(detail_url).await?;
            driver
                .wait_for(
                    &Condition::Present(Locator::css(DETAIL_MARKER)),
                    self.settings.detail_timeout,
                )
                .await?;
            let html = driver.page_html().await?;
            Ok::<_, DriverError>(find_apir_code(&html))
        }
        .await;

        if let Err(e) = driver.close_tab(tab).await {
            tracing::warn!("failed to close detail tab: {e}");
        }
        driver
            .switch_tab(home)
            .await
            .map_err(ExtractError::TabCleanup)?;

        Ok(lookup)
    }
}

fn resolve_href(base: Option<&Url>, href: &str) -> Option<String> {
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(href).ok().map(String::from),
    }
}

fn to_record(row: ListingRow, code: Option<String>, date: NaiveDate) -> PriceRecord {
    PriceRecord::new(code, date, row.name, row.price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{FakeDriver, FakePage};
    use crate::store::MemoryCodeStore;
    use rust_decimal_macros::dec;

    const LISTING: &str = "https://www.investsmart.com.au/portfolio-manager/watchlist";
    const DECOY: &str = "https://www.fundlater.com.au/";

    fn settings() -> ExtractSettings {
        ExtractSettings {
            listing_url: LISTING.into(),
            redirect_retry_prefixes: vec![DECOY.into()],
            page_load_timeout: Duration::from_secs(30),
            detail_timeout: Duration::from_secs(10),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    fn watchlist_html(rows: &[(&str, &str, &str)]) -> String {
        let body: String = rows
            .iter()
            .map(|(name, href, price)| {
                format!("<tr><td><a href=\"{href}\">{name}</a></td><td>{price}</td></tr>")
            })
            .collect();
        format!(
            "<table data-sortable-name=\"watchlist\"><thead><tr><th>Fund</th>\
             <th>Current Unit Price</th></tr></thead><tbody>{body}</tbody></table>"
        )
    }

    fn listing_page(rows: &[(&str, &str, &str)]) -> FakePage {
        FakePage::new()
            .html(watchlist_html(rows))
            .marker(Locator::css(LISTING_CONTAINER))
    }

    fn detail_page(code: &str) -> FakePage {
        FakePage::new()
            .html(format!(
                "<table class=\"table-performance\"></table><table><tr>\
                 <td><label for=\"Fund_APIRCode\">APIR</label></td><td>{code}</td></tr></table>"
            ))
            .marker(Locator::css(DETAIL_MARKER))
    }

    #[tokio::test]
    async fn test_cached_codes_open_no_tabs() {
        let mut driver = FakeDriver::new().page(
            LISTING,
            listing_page(&[("Fund A", "/funds/a", "$1.25"), ("Fund B", "/funds/b", "$2.00")]),
        );
        let mut codes = MemoryCodeStore::from([("Fund A", "ABC123"), ("Fund B", "XYZ789")]);

        let out = TableExtractor::new(settings())
            .extract(&mut driver, &mut codes, today())
            .await
            .unwrap();

        assert_eq!(driver.tabs_opened, 0);
        assert_eq!(driver.navigations, vec![LISTING.to_string()]);
        assert_eq!(
            out.records,
            vec![
                PriceRecord::new(Some("ABC123".into()), today(), "Fund A", dec!(1.25)),
                PriceRecord::new(Some("XYZ789".into()), today(), "Fund B", dec!(2.00)),
            ]
        );
        assert_eq!(out.stats.cache_hits, 2);
    }

    #[tokio::test]
    async fn test_lookup_uses_one_scratch_tab_and_caches_hits() {
        let mut driver = FakeDriver::new()
            .page(
                LISTING,
                listing_page(&[
                    ("Fund A", "/funds/a", "$1.25"),
                    ("Fund B", "https://www.investsmart.com.au/funds/b", "$2.00"),
                ]),
            )
            .page("https://www.investsmart.com.au/funds/a", detail_page("ABC123"))
            .page(
                "https://www.investsmart.com.au/funds/b",
                FakePage::new()
                    .html("<table class=\"table-performance\"></table>")
                    .marker(Locator::css(DETAIL_MARKER)),
            );
        let mut codes = MemoryCodeStore::new();

        let out = TableExtractor::new(settings())
            .extract(&mut driver, &mut codes, today())
            .await
            .unwrap();

        assert_eq!(driver.tabs_opened, 2);
        assert!(driver.max_open_tabs <= 2);
        assert_eq!(driver.open_tab_count(), 1);
        assert_eq!(driver.active_tab(), crate::driver::TabId(0));

        assert_eq!(out.records[0].code.as_deref(), Some("ABC123"));
        assert_eq!(out.records[1].code, None);
        assert_eq!(codes.get("Fund A").as_deref(), Some("ABC123"));
        assert_eq!(codes.get("Fund B"), None);
        assert_eq!(codes.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_skips_row_and_restores_tab() {
        let mut driver = FakeDriver::new()
            .page(
                LISTING,
                listing_page(&[("Fund A", "/funds/a", "$1.25"), ("Fund B", "/funds/b", "$2.00")]),
            )
            .failing("https://www.investsmart.com.au/funds/a")
            .page("https://www.investsmart.com.au/funds/b", detail_page("XYZ789"));
        let mut codes = MemoryCodeStore::new();

        let out = TableExtractor::new(settings())
            .extract(&mut driver, &mut codes, today())
            .await
            .unwrap();

        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].name, "Fund B");
        assert_eq!(out.stats.skipped, 1);
        assert_eq!(driver.open_tab_count(), 1);
    }

    #[tokio::test]
    async fn test_detail_timeout_skips_row() {
        let mut driver = FakeDriver::new()
            .page(LISTING, listing_page(&[("Fund A", "/funds/a", "$1.25")]))
            .page(
                "https://www.investsmart.com.au/funds/a",
                FakePage::new().html("<p>still loading</p>"),
            );
        let mut codes = MemoryCodeStore::new();

        let out = TableExtractor::new(settings())
            .extract(&mut driver, &mut codes, today())
            .await
            .unwrap();
        assert!(out.records.is_empty());
        assert_eq!(driver.open_tab_count(), 1);
    }

    #[tokio::test]
    async fn test_decoy_redirect_retried_once() {
        let mut driver = FakeDriver::new()
            .page(LISTING, listing_page(&[("Fund A", "/funds/a", "$1.25")]))
            .page(DECOY, FakePage::new())
            .redirect_once(LISTING, DECOY);
        let mut codes = MemoryCodeStore::from([("Fund A", "ABC123")]);

        let out = TableExtractor::new(settings())
            .extract(&mut driver, &mut codes, today())
            .await
            .unwrap();
        assert_eq!(driver.navigations, vec![LISTING.to_string(), LISTING.to_string()]);
        assert_eq!(out.records.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_container_is_fatal() {
        let mut driver = FakeDriver::new().page(LISTING, FakePage::new().html("<p>maintenance</p>"));
        let mut codes = MemoryCodeStore::new();

        let err = TableExtractor::new(settings())
            .extract(&mut driver, &mut codes, today())
            .await
            .unwrap_err();
        match err {
            ExtractError::Container { url, source } => {
                assert_eq!(url, LISTING);
                assert!(source.is_timeout());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_layout_drift_is_fatal() {
        let html = "<table data-sortable-name=\"watchlist\"><thead><tr><th>Name</th>\
                    <th>Price</th></tr></thead><tbody></tbody></table>";
        let mut driver = FakeDriver::new().page(
            LISTING,
            FakePage::new().html(html).marker(Locator::css(LISTING_CONTAINER)),
        );
        let mut codes = MemoryCodeStore::new();

        let err = TableExtractor::new(settings())
            .extract(&mut driver, &mut codes, today())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::MissingColumns { .. }));
        assert!(err.to_string().contains("current unit price"));
    }
}
