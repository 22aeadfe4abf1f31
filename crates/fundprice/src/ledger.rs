//! Rolling CSV price ledger.
//!
//! The ledger keeps one row per fund per day for a trailing window of days.
//! Each run rewrites the whole file: rows from earlier days inside the window
//! are kept as they were, rows dated today are replaced by this run's records,
//! and anything outside the window is dropped.
//!
//! The header line is carried over verbatim from the existing file. Columns are
//! identified by position (symbol, date, name, currency, price), never by
//! header text.

use crate::store::write_atomic;
use crate::types::PriceRecord;
use chrono::{Duration, NaiveDate};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Header written when no ledger exists yet.
pub const DEFAULT_HEADER: [&str; 5] = ["Symbol", "Date", "Name", "Currency", "Price"];

/// On-disk date format for new rows.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Day-first format written by older installations. Read, never written.
const LEGACY_DATE_FORMAT: &str = "%d/%m/%Y";

const DATE_COLUMN: usize = 1;

/// Errors reading or writing the ledger file.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("failed to access ledger {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed ledger {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Header plus data rows, as plain fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerContents {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Default for LedgerContents {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER.iter().map(|s| s.to_string()).collect(),
            rows: Vec::new(),
        }
    }
}

impl LedgerContents {
    /// Parse CSV text. The first record is the header; blank records are skipped.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, csv::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut records = rdr
            .records()
            .filter(|r| r.as_ref().map_or(true, |rec| rec.iter().any(|f| !f.is_empty())));

        let header = match records.next() {
            Some(rec) => rec?.iter().map(str::to_string).collect(),
            None => return Ok(Self::default()),
        };

        let mut rows = Vec::new();
        for rec in records {
            rows.push(rec?.iter().map(str::to_string).collect());
        }
        Ok(Self { header, rows })
    }

    /// Serialize as CSV text with `\n` line endings.
    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut wtr = csv::WriterBuilder::new()
            .flexible(true)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        wtr.write_record(&self.header)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}

/// What a merge did, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub kept: usize,
    pub replaced_today: usize,
    pub expired: usize,
    pub unreadable: usize,
    pub appended: usize,
}

/// Parse a ledger date cell in either the canonical or the legacy format.
pub fn parse_row_date(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    NaiveDate::parse_from_str(cell, DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(cell, LEGACY_DATE_FORMAT))
        .ok()
}

/// Ledger row for a freshly extracted record.
pub fn record_row(record: &PriceRecord) -> Vec<String> {
    vec![
        record.symbol().to_string(),
        record.date.format(DATE_FORMAT).to_string(),
        record.name.clone(),
        record.currency.clone(),
        record.price.to_string(),
    ]
}

/// Merge today's records into the existing ledger.
///
/// Keeps an existing row iff its date lies in `[today - retention_days, today)`,
/// then appends every new record in order. Re-running with the same records on
/// the same day yields the same contents.
pub fn merge(
    existing: LedgerContents,
    new_records: &[PriceRecord],
    retention_days: u32,
    today: NaiveDate,
) -> LedgerContents {
    merge_with_stats(existing, new_records, retention_days, today).0
}

pub fn merge_with_stats(
    existing: LedgerContents,
    new_records: &[PriceRecord],
    retention_days: u32,
    today: NaiveDate,
) -> (LedgerContents, MergeStats) {
    let earliest = today - Duration::days(i64::from(retention_days));
    let mut stats = MergeStats::default();

    let mut rows = Vec::with_capacity(existing.rows.len() + new_records.len());
    for row in existing.rows {
        let date = row.get(DATE_COLUMN).and_then(|c| parse_row_date(c));
        match date {
            None => {
                tracing::warn!("dropping ledger row with unreadable date: {}", row.join(","));
                stats.unreadable += 1;
            }
            Some(d) if d == today => stats.replaced_today += 1,
            Some(d) if d < earliest || d > today => stats.expired += 1,
            Some(_) => {
                stats.kept += 1;
                rows.push(row);
            }
        }
    }

    rows.extend(new_records.iter().map(record_row));
    stats.appended = new_records.len();

    (
        LedgerContents {
            header: existing.header,
            rows,
        },
        stats,
    )
}

/// The ledger file on disk.
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the ledger; `None` if the file does not exist.
    pub fn load(&self) -> Result<Option<LedgerContents>, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        LedgerContents::from_reader(file)
            .map(Some)
            .map_err(|source| LedgerError::Csv {
                path: self.path.clone(),
                source,
            })
    }

    /// Replace the ledger file with `contents`.
    pub fn store(&self, contents: &LedgerContents) -> Result<(), LedgerError> {
        let data = contents.to_csv().map_err(|source| LedgerError::Csv {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &data).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Load, merge and rewrite in one step.
    pub fn update(
        &self,
        records: &[PriceRecord],
        retention_days: u32,
        today: NaiveDate,
    ) -> Result<MergeStats, LedgerError> {
        let existing = self.load()?.unwrap_or_default();
        let (merged, stats) = merge_with_stats(existing, records, retention_days, today);
        self.store(&merged)?;

        tracing::debug!(
            "ledger {}: kept {}, replaced {} from today, expired {}, appended {}",
            self.path.display(),
            stats.kept,
            stats.replaced_today,
            stats.expired,
            stats.appended
        );
        Ok(stats)
    }
}
