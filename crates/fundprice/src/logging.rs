//! Console and log-file tracing setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

/// How much a log destination receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    None,
    Error,
    Warning,
    Summary,
    Detailed,
    Debug,
    All,
}

impl Verbosity {
    pub fn level(self) -> LevelFilter {
        match self {
            Verbosity::None => LevelFilter::OFF,
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warning => LevelFilter::WARN,
            Verbosity::Summary => LevelFilter::INFO,
            Verbosity::Detailed => LevelFilter::DEBUG,
            Verbosity::Debug | Verbosity::All => LevelFilter::TRACE,
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verbosity::None => "none",
            Verbosity::Error => "error",
            Verbosity::Warning => "warning",
            Verbosity::Summary => "summary",
            Verbosity::Detailed => "detailed",
            Verbosity::Debug => "debug",
            Verbosity::All => "all",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub verbosity: Verbosity,
    /// Lines kept when the file is trimmed at startup; 0 keeps everything.
    pub max_lines: usize,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub console: Verbosity,
    pub file: Option<LogFile>,
}

/// Install the global subscriber. `RUST_LOG` overrides the console level.
pub fn init(opts: &LogOptions) -> Result<()> {
    let console_filter = EnvFilter::builder()
        .with_default_directive(opts.console.level().into())
        .from_env_lossy();
    let console = tfmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = match &opts.file {
        Some(log) if log.verbosity != Verbosity::None => {
            trim_log_file(&log.path, log.max_lines)?;
            if let Some(parent) = log.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log.path)
                .with_context(|| format!("failed to open log file {}", log.path.display()))?;
            Some(
                tfmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(log.verbosity.level()),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("failed to install log subscriber")?;
    Ok(())
}

/// Keep only the last `max_lines` lines of an existing log file.
pub fn trim_log_file(path: &Path, max_lines: usize) -> Result<()> {
    if max_lines == 0 {
        return Ok(());
    }
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read log file {}", path.display()))
        }
    };

    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return Ok(());
    }
    let mut kept = lines[lines.len() - max_lines..].join("\n");
    kept.push('\n');
    fs::write(path, kept).with_context(|| format!("failed to trim log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(Verbosity::None.level(), LevelFilter::OFF);
        assert_eq!(Verbosity::Summary.level(), LevelFilter::INFO);
        assert_eq!(Verbosity::Detailed.level(), LevelFilter::DEBUG);
        assert_eq!(Verbosity::All.level(), LevelFilter::TRACE);
    }

    #[test]
    fn test_verbosity_names() {
        let v: Verbosity = serde_yaml::from_str("warning").unwrap();
        assert_eq!(v, Verbosity::Warning);
        assert_eq!(v.to_string(), "warning");
        assert!(serde_yaml::from_str::<Verbosity>("verbose").is_err());
    }

    #[test]
    fn test_trim_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let body: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, body).unwrap();

        trim_log_file(&path, 3).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "line 8\nline 9\nline 10\n");

        trim_log_file(&path, 0).unwrap();
        trim_log_file(&dir.path().join("absent.log"), 3).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);
    }
}
