//! Run-level error and process exit codes.

use crate::driver::DriverError;
use crate::extract::ExtractError;
use crate::ledger::LedgerError;
use crate::session::SessionError;
use crate::store::StoreError;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_SESSION: i32 = 2;
pub const EXIT_EXTRACT: i32 = 3;
pub const EXIT_LEDGER: i32 = 4;

/// Why a run stopped.
///
/// Configuration errors are reported before a run starts and never reach here.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("failed to start the browser: {0}")]
    Browser(#[source] DriverError),

    #[error("session failed: {0}")]
    Session(#[from] SessionError),

    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("ledger update failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Session(_) => EXIT_SESSION,
            RunError::Extract(_) => EXIT_EXTRACT,
            RunError::Ledger(_) => EXIT_LEDGER,
            RunError::Browser(_) | RunError::Store(_) | RunError::Unexpected(_) => EXIT_CONFIG,
        }
    }

    /// Describe a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        RunError::Unexpected(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_codes_are_distinct_per_stage() {
        let session = RunError::Session(SessionError::LoginFormMissing {
            url: "https://example.com/login".into(),
            timeout: Duration::from_secs(30),
        });
        let extract = RunError::Extract(ExtractError::MissingColumns {
            url: "https://example.com/list".into(),
            missing: vec!["fund"],
        });
        let ledger = RunError::Ledger(LedgerError::Io {
            path: "price_data.csv".into(),
            source: std::io::Error::other("disk full"),
        });

        assert_eq!(session.exit_code(), EXIT_SESSION);
        assert_eq!(extract.exit_code(), EXIT_EXTRACT);
        assert_eq!(ledger.exit_code(), EXIT_LEDGER);
        assert_eq!(RunError::Unexpected("boom".into()).exit_code(), EXIT_CONFIG);
        assert_eq!(
            RunError::Browser(DriverError::Launch("no chromium".into())).exit_code(),
            EXIT_CONFIG
        );
        assert!(session.to_string().contains("within 30s"));
    }

    #[test]
    fn test_panic_payloads() {
        let err = RunError::from_panic(Box::new("static"));
        assert_eq!(err.to_string(), "unexpected failure: static");
        let err = RunError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "unexpected failure: owned");
    }
}
