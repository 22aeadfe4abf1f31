// Copyright 2026 Fundprice Contributors
// SPDX-License-Identifier: MIT

//! fundprice CLI entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use fundprice::config::{resolve_config_path, write_template, Settings};
use fundprice::driver::chromium::ChromiumDriver;
use fundprice::error::{RunError, EXIT_CONFIG, EXIT_OK};
use fundprice::logging;
use fundprice::notify::{report_failure, EmailNotifier, FatalMarker, LogNotifier, Notifier};
use fundprice::store::{CookieStore, JsonCodeStore, JsonCookieStore};
use fundprice::Runner;

#[derive(Parser)]
#[command(
    name = "fundprice",
    about = "Scrape fund unit prices from an InvestSmart watchlist into a rolling CSV ledger",
    version
)]
struct Cli {
    /// Path to config.yaml (default: $FUNDPRICE_CONFIG or ./config.yaml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run the browser headless regardless of HeadlessMode.
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in, extract today's prices and update the ledger (default).
    Run,

    /// Write a starter config file with placeholders to fill in.
    InitConfig,

    /// Forget the saved browser session so the next run logs in again.
    ClearSession,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   fundprice completions bash > ~/.local/share/bash-completion/completions/fundprice
    ///   fundprice completions zsh > ~/.zfunc/_fundprice
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config_path, cli.headless).await,

        Commands::InitConfig => {
            write_template(&config_path)?;
            println!(
                "Wrote {}. Fill in the placeholders before the first run.",
                config_path.display()
            );
            Ok(EXIT_OK)
        }

        Commands::ClearSession => {
            let settings = Settings::load(&config_path)?;
            let mut cookies = JsonCookieStore::new(settings.cookie_file());
            cookies.clear().context("failed to clear saved session")?;
            println!("Cleared saved session {}", cookies.path().display());
            Ok(EXIT_OK)
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "fundprice", &mut std::io::stdout());
            Ok(EXIT_OK)
        }
    }
}

async fn run(config_path: &std::path::Path, force_headless: bool) -> anyhow::Result<i32> {
    let settings = Settings::load(config_path)?;
    logging::init(&settings.log_options())?;
    tracing::info!("starting fundprice v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("config {}", config_path.display());

    let notifier: Box<dyn Notifier> = match EmailNotifier::from_settings(&settings.email)? {
        Some(email) => Box::new(email),
        None => Box::new(LogNotifier),
    };
    let marker = FatalMarker::new(settings.fatal_marker_file());

    let mut codes = match JsonCodeStore::open(settings.code_cache_file()) {
        Ok(c) => c,
        Err(e) => return Ok(abort(notifier.as_ref(), &marker, RunError::from(e)).await),
    };
    let mut cookies = JsonCookieStore::new(settings.cookie_file());

    let mut driver = match ChromiumDriver::launch(settings.browser_options(force_headless)).await {
        Ok(d) => d,
        Err(e) => return Ok(abort(notifier.as_ref(), &marker, RunError::Browser(e)).await),
    };

    let today = chrono::Local::now().date_naive();
    let result = Runner::new(
        &settings,
        &mut driver,
        &mut cookies,
        &mut codes,
        notifier.as_ref(),
    )
    .run(today)
    .await;

    Ok(match result {
        Ok(_) => EXIT_OK,
        Err(e) => e.exit_code(),
    })
}

/// Report a failure that happened before the runner took over.
async fn abort(notifier: &dyn Notifier, marker: &FatalMarker, err: RunError) -> i32 {
    report_failure(notifier, marker, &err.to_string()).await;
    err.exit_code()
}
