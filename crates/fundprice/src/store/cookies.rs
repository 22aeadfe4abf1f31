//! Persisted session cookies.

use super::{write_atomic, StoreError};
use crate::driver::Cookie;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What a cookie store holds.
#[derive(Debug, Clone, PartialEq)]
pub enum SavedCookies {
    /// Nothing persisted; there is no session to resume.
    Missing,
    /// A file exists but does not decode.
    Corrupt(String),
    Present(Vec<Cookie>),
}

/// Persistence for the browser's cookie jar between runs.
pub trait CookieStore: Send {
    fn load(&self) -> Result<SavedCookies, StoreError>;
    fn save(&mut self, cookies: &[Cookie]) -> Result<(), StoreError>;
    /// Forget the persisted session. Clearing an empty store is not an error.
    fn clear(&mut self) -> Result<(), StoreError>;
}

/// Cookie jar stored as a pretty-printed JSON array.
pub struct JsonCookieStore {
    path: PathBuf,
}

impl JsonCookieStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CookieStore for JsonCookieStore {
    fn load(&self) -> Result<SavedCookies, StoreError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SavedCookies::Missing),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        match serde_json::from_str::<Vec<Cookie>>(&data) {
            Ok(cookies) => {
                tracing::trace!("loaded {} cookies from {}", cookies.len(), self.path.display());
                Ok(SavedCookies::Present(cookies))
            }
            Err(e) => Ok(SavedCookies::Corrupt(e.to_string())),
        }
    }

    fn save(&mut self, cookies: &[Cookie]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(cookies).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json).map_err(|e| StoreError::io(&self.path, e))?;
        tracing::trace!("saved {} cookies to {}", cookies.len(), self.path.display());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

/// In-memory cookie store.
#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    cookies: Option<Vec<Cookie>>,
    pub saves: usize,
    pub clears: usize,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(cookies: Vec<Cookie>) -> Self {
        Self {
            cookies: Some(cookies),
            ..Self::default()
        }
    }

    pub fn cookies(&self) -> Option<&[Cookie]> {
        self.cookies.as_deref()
    }
}

impl CookieStore for MemoryCookieStore {
    fn load(&self) -> Result<SavedCookies, StoreError> {
        Ok(match &self.cookies {
            Some(c) => SavedCookies::Present(c.clone()),
            None => SavedCookies::Missing,
        })
    }

    fn save(&mut self, cookies: &[Cookie]) -> Result<(), StoreError> {
        self.cookies = Some(cookies.to_vec());
        self.saves += 1;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.cookies = None;
        self.clears += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_means_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCookieStore::new(dir.path().join("cookies.json"));
        assert_eq!(store.load().unwrap(), SavedCookies::Missing);
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCookieStore::new(dir.path().join("cookies.json"));

        let cookies = vec![Cookie::new("sid", "abc").with_domain(".example.com")];
        store.save(&cookies).unwrap();
        assert_eq!(store.load().unwrap(), SavedCookies::Present(cookies));

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_garbage_file_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        fs::write(&path, "{not json").unwrap();

        let store = JsonCookieStore::new(&path);
        assert!(matches!(store.load().unwrap(), SavedCookies::Corrupt(_)));
    }
}
