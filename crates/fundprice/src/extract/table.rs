//! HTML parsing for the watchlist table and fund detail pages.
//!
//! The browser hands over `outerHTML` snapshots; everything here is pure
//! string-in, values-out so it can be tested against saved page fragments.

use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use std::str::FromStr;

/// Header text marking the fund name/link column.
pub const NAME_HEADER: &str = "fund";
/// Header text marking the price column.
pub const PRICE_HEADER: &str = "current unit price";

/// Column positions of the fields the extractor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub name: usize,
    pub price: usize,
}

/// Required header substrings that matched no column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingColumns(pub Vec<&'static str>);

/// Why a single listing row could not be read.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("row has {cells} cells, needs column {needed}")]
    MissingCell { cells: usize, needed: usize },

    #[error("fund cell has no link")]
    MissingLink,

    #[error("fund link has no href")]
    MissingHref,

    #[error("unparseable price {0:?}")]
    BadPrice(String),
}

/// One listing row before its code is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRow {
    pub name: String,
    /// Link target as written in the page; may be relative.
    pub href: String,
    pub price: Decimal,
}

/// Parsed watchlist table: the header cells, the resolved columns and each
/// body row's outcome.
#[derive(Debug)]
pub struct Listing {
    pub headers: Vec<String>,
    pub columns: ColumnMap,
    pub rows: Vec<Result<ListingRow, RowError>>,
}

/// Visible text of an element with whitespace runs collapsed.
fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Find the name and price columns by case-insensitive substring match.
///
/// When several headers match the same rule the last one wins.
pub fn resolve_columns<S: AsRef<str>>(headers: &[S]) -> Result<ColumnMap, MissingColumns> {
    let mut name = None;
    let mut price = None;

    for (idx, header) in headers.iter().enumerate() {
        let text = header.as_ref().trim().to_lowercase();
        if text.contains(NAME_HEADER) {
            name = Some(idx);
        }
        if text.contains(PRICE_HEADER) {
            price = Some(idx);
        }
    }

    match (name, price) {
        (Some(name), Some(price)) => Ok(ColumnMap { name, price }),
        _ => {
            let mut missing = Vec::new();
            if name.is_none() {
                missing.push(NAME_HEADER);
            }
            if price.is_none() {
                missing.push(PRICE_HEADER);
            }
            Err(MissingColumns(missing))
        }
    }
}

/// Parse a listed unit price such as `$1,234.56`.
pub fn parse_price(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// Split the watchlist table into header texts and raw body rows.
///
/// Fails without reading any row when a required column is missing.
pub fn parse_listing(table_html: &str) -> Result<Listing, MissingColumns> {
    let doc = Html::parse_fragment(table_html);
    let th_sel = Selector::parse("thead tr th").unwrap();
    let tr_sel = Selector::parse("tbody tr").unwrap();
    let td_sel = Selector::parse("td").unwrap();
    let a_sel = Selector::parse("a").unwrap();

    let headers: Vec<String> = doc.select(&th_sel).map(text_of).collect();
    let columns = resolve_columns(headers.as_slice())?;

    let rows = doc
        .select(&tr_sel)
        .map(|tr| {
            let cells: Vec<ElementRef<'_>> = tr.select(&td_sel).collect();
            let needed = columns.name.max(columns.price);
            if cells.len() <= needed {
                return Err(RowError::MissingCell {
                    cells: cells.len(),
                    needed,
                });
            }

            let link = cells[columns.name]
                .select(&a_sel)
                .next()
                .ok_or(RowError::MissingLink)?;
            let href = link
                .value()
                .attr("href")
                .ok_or(RowError::MissingHref)?
                .trim()
                .to_string();

            let price_text = text_of(cells[columns.price]);
            let price = parse_price(&price_text).ok_or(RowError::BadPrice(price_text))?;

            Ok(ListingRow {
                name: text_of(link),
                href,
                price,
            })
        })
        .collect();

    Ok(Listing {
        headers,
        columns,
        rows,
    })
}

/// Find the APIR code on a fund detail page.
///
/// Scans every table row for a cell holding `<label for="Fund_APIRCode">` and
/// returns the text of that row's second cell.
pub fn find_apir_code(page_html: &str) -> Option<String> {
    let doc = Html::parse_document(page_html);
    let tr_sel = Selector::parse("tr").unwrap();
    let label_sel = Selector::parse(r#"label[for="Fund_APIRCode"]"#).unwrap();

    doc.select(&tr_sel).find_map(|tr| {
        let cells: Vec<ElementRef<'_>> = tr
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| c.value().name() == "td")
            .collect();
        let labelled = cells.iter().any(|c| {
            c.children()
                .filter_map(ElementRef::wrap)
                .any(|child| label_sel.matches(&child))
        });
        if !labelled || cells.len() < 2 {
            return None;
        }
        let code = text_of(cells[1]);
        (!code.is_empty()).then_some(code)
    })
}
