//! Durable key→value files: the session cookie jar and the fund code cache.
//!
//! Both are small JSON documents rewritten in full on every change. Writes go
//! to a sibling temp file that is renamed into place, so a crash never leaves
//! a half-written file behind.

pub mod codes;
pub mod cookies;

pub use codes::{CodeStore, JsonCodeStore, MemoryCodeStore};
pub use cookies::{CookieStore, JsonCookieStore, MemoryCookieStore, SavedCookies};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Errors from the file-backed stores.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Replace `path` with `data` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, data)?;
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("nested").join("data.json.tmp").exists());
    }
}
