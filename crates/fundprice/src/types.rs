//! Core record types.

use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Every listed price is quoted in Australian dollars.
pub const CURRENCY: &str = "AUD";

/// One fund's price as read from the watchlist in a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRecord {
    /// APIR code, if the detail page exposed one.
    pub code: Option<String>,
    /// Extraction date, shared by every record of a run.
    pub date: NaiveDate,
    pub name: String,
    pub currency: String,
    pub price: Decimal,
}

impl PriceRecord {
    pub fn new(code: Option<String>, date: NaiveDate, name: impl Into<String>, price: Decimal) -> Self {
        Self {
            code,
            date,
            name: name.into(),
            currency: CURRENCY.to_string(),
            price,
        }
    }

    /// Ledger symbol; empty when the code is unknown.
    pub fn symbol(&self) -> &str {
        self.code.as_deref().unwrap_or("")
    }
}
