// Copyright 2026 Fundprice Contributors
// SPDX-License-Identifier: MIT

//! fundprice: keep a rolling CSV ledger of managed-fund unit prices.
//!
//! A run signs in to the InvestSmart watchlist (reusing saved cookies when it
//! can), reads each fund's current unit price, resolves its APIR code from the
//! fund's detail page (cached across runs) and merges the day's prices into a
//! CSV ledger that keeps a trailing window of days.

pub mod config;
pub mod driver;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod logging;
pub mod notify;
pub mod runner;
pub mod session;
pub mod store;
pub mod types;

pub use error::RunError;
pub use runner::{RunSummary, Runner};
pub use types::PriceRecord;
