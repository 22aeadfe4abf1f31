//! Fund name → APIR code cache.
//!
//! Looking a code up costs a full detail-page visit, while a fund's code never
//! changes, so every discovery is remembered across runs. Only found codes are
//! stored; a fund whose detail page had no code is retried on the next run.

use super::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One cached lookup, in the on-disk shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeEntry {
    pub fund_name: String,
    pub apir_code: String,
}

/// Lookup table from fund display name to its secondary code.
pub trait CodeStore: Send {
    fn get(&self, fund_name: &str) -> Option<String>;
    fn put(&mut self, fund_name: &str, code: &str) -> Result<(), StoreError>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Code cache persisted as a JSON array of `{fund_name, apir_code}`.
///
/// The whole file is read on open and rewritten after each new entry.
pub struct JsonCodeStore {
    path: PathBuf,
    entries: Vec<CodeEntry>,
}

impl JsonCodeStore {
    /// Open the cache, treating a missing or unreadable file as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<Vec<CodeEntry>>(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        "fund code cache {} is corrupt ({e}); starting empty",
                        path.display()
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        tracing::debug!("fund code cache: {} entries from {}", entries.len(), path.display());
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[CodeEntry] {
        &self.entries
    }

    fn persist(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.entries).map_err(|source| {
            StoreError::Encode {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| StoreError::io(&self.path, e))
    }
}

impl CodeStore for JsonCodeStore {
    fn get(&self, fund_name: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.fund_name == fund_name && !e.apir_code.is_empty())
            .map(|e| e.apir_code.clone())
    }

    fn put(&mut self, fund_name: &str, code: &str) -> Result<(), StoreError> {
        self.entries.push(CodeEntry {
            fund_name: fund_name.to_string(),
            apir_code: code.to_string(),
        });
        self.persist()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// In-memory code store.
#[derive(Debug, Default)]
pub struct MemoryCodeStore {
    codes: HashMap<String, String>,
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for MemoryCodeStore {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self {
            codes: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl CodeStore for MemoryCodeStore {
    fn get(&self, fund_name: &str) -> Option<String> {
        self.codes.get(fund_name).cloned()
    }

    fn put(&mut self, fund_name: &str, code: &str) -> Result<(), StoreError> {
        self.codes.insert(fund_name.to_string(), code.to_string());
        Ok(())
    }

    fn len(&self) -> usize {
        self.codes.len()
    }
}
