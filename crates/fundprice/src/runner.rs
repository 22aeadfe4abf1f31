//! One scheduled run: session → extraction → ledger, with failure reporting.

use crate::config::Settings;
use crate::driver::BrowserDriver;
use crate::error::RunError;
use crate::extract::{ExtractStats, TableExtractor};
use crate::ledger::{Ledger, MergeStats};
use crate::notify::{report_failure, report_success, FatalMarker, Notifier};
use crate::session::{SessionManager, SessionOutcome};
use crate::store::{CodeStore, CookieStore};
use chrono::NaiveDate;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;

/// What a successful run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub session: SessionOutcome,
    pub extract: ExtractStats,
    pub ledger: MergeStats,
    pub records: usize,
}

/// Everything a run touches, injected by the caller.
pub struct Runner<'a> {
    settings: &'a Settings,
    driver: &'a mut dyn BrowserDriver,
    cookies: &'a mut dyn CookieStore,
    codes: &'a mut dyn CodeStore,
    notifier: &'a dyn Notifier,
    marker: FatalMarker,
    ledger: Ledger,
}

impl<'a> Runner<'a> {
    pub fn new(
        settings: &'a Settings,
        driver: &'a mut dyn BrowserDriver,
        cookies: &'a mut dyn CookieStore,
        codes: &'a mut dyn CodeStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            settings,
            driver,
            cookies,
            codes,
            notifier,
            marker: FatalMarker::new(settings.fatal_marker_file()),
            ledger: Ledger::new(settings.output_csv()),
        }
    }

    /// Run all stages for `today`, then release the browser and report.
    ///
    /// The browser is shut down whether or not the stages succeed.
    pub async fn run(&mut self, today: NaiveDate) -> Result<RunSummary, RunError> {
        let outcome = AssertUnwindSafe(self.stages(today))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RunError::from_panic(panic)));

        if let Err(e) = self.driver.shutdown().await {
            tracing::warn!("browser did not shut down cleanly: {e}");
        }

        match &outcome {
            Ok(summary) => {
                tracing::info!(
                    "run complete: {} funds written to {} ({} rows kept from earlier days)",
                    summary.records,
                    self.ledger.path().display(),
                    summary.ledger.kept
                );
                report_success(self.notifier, &self.marker).await;
            }
            Err(e) => {
                report_failure(self.notifier, &self.marker, &format!("{e}")).await;
            }
        }
        outcome
    }

    async fn stages(&mut self, today: NaiveDate) -> Result<RunSummary, RunError> {
        let credentials = self.settings.credentials();
        let mut manager = SessionManager::new(self.settings.session_settings(), &mut *self.cookies);
        let session = manager.establish(&mut *self.driver, &credentials).await?;
        tracing::info!("session ready ({session:?})");

        let extraction = TableExtractor::new(self.settings.extract_settings())
            .extract(&mut *self.driver, &mut *self.codes, today)
            .await?;
        if extraction.records.is_empty() {
            tracing::warn!("watchlist yielded no funds; today's ledger rows will be empty");
        }

        let ledger = self
            .ledger
            .update(&extraction.records, self.settings.retention_days(), today)?;

        Ok(RunSummary {
            session,
            extract: extraction.stats,
            ledger,
            records: extraction.records.len(),
        })
    }
}
