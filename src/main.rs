mod config;
mod database;
mod engine;
mod error;
mod market;
mod ml;
mod report;
mod risk;
mod types;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{AppConfig, SizingProfile};
use database::{SignalStore, SqliteSignalStore};
use engine::Analyzer;
use market::YahooClient;
use report::{CommentaryGenerator, TerminalSummary};

#[derive(Parser)]
#[command(name = "quant-signal")]
#[command(author = "Quant Signal")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Regime-aware ML trading signals with Kelly position sizing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "quant_signal.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Sizing preset (conservative, moderate, aggressive)
    #[arg(short, long)]
    profile: Option<SizingProfile>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one or more tickers, persist the signals and write reports
    Analyze {
        /// Ticker symbols (e.g. AAPL SPY)
        #[arg(required = true, num_args = 1..)]
        tickers: Vec<String>,
        /// Skip the HTML report
        #[arg(long)]
        no_report: bool,
        /// Skip commentary generation
        #[arg(long)]
        no_commentary: bool,
    },
    /// Show previously generated signals, newest first
    History {
        #[arg(short, long)]
        ticker: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: u32,
        /// Print the full signals as JSON
        #[arg(long)]
        json: bool,
    },
    /// List generated HTML reports
    ListReports,
    /// Print version information
    Version,
    /// Print the effective configuration as TOML
    ShowConfig,
}

/// Open `path` for appending, creating its directory if needed
fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Stdout logging plus, when `log_file` is set, a plain-text copy appended to that file
fn init_logging(verbose: bool, json: bool, log_file: Option<&Path>) -> Result<()> {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let file_layer = match log_file {
        Some(path) => {
            let file = open_log_file(path).map_err(|e| anyhow!("cannot open log file {}: {}", path.display(), e))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false).with_target(false))
        }
        None => None,
    };
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let installed = if json {
        registry.with(fmt::layer().json().with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load(Some(cli.config.as_path()))?;
    let log_file = config.logging.file_enabled.then(|| config.log_file());
    init_logging(cli.verbose, cli.json_logs, log_file.as_deref())?;
    info!("quant-signal {} starting", env!("CARGO_PKG_VERSION"));
    if let Some(profile) = cli.profile {
        info!("Using {} sizing profile: {}", profile.name(), profile.description());
        let assumed = config.sizing.assumed_payoff_ratio;
        config.sizing = profile.settings();
        config.sizing.assumed_payoff_ratio = assumed;
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        bail!("configuration has {} error(s)", errors.len());
    }

    match cli.command {
        Commands::Analyze {
            tickers,
            no_report,
            no_commentary,
        } => {
            run_analysis(&config, tickers, !no_report, !no_commentary).await?;
        }
        Commands::History { ticker, limit, json } => {
            show_history(&config, ticker, limit, json).await?;
        }
        Commands::ListReports => {
            show_reports(&config)?;
        }
        Commands::Version => {
            println!("quant-signal {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::ShowConfig => {
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_analysis(config: &AppConfig, tickers: Vec<String>, write_report: bool, with_commentary: bool) -> Result<()> {
    let tickers: Vec<String> = tickers.iter().map(|t| t.trim().to_uppercase()).collect();
    info!("Analyzing {} ticker(s): {}", tickers.len(), tickers.join(", "));

    let store = Arc::new(SqliteSignalStore::connect(&config.storage.database_url).await?);
    let source = Arc::new(YahooClient::new(&config.data)?);
    let analyzer = Analyzer::from_config(config, source, store)?;
    let commentary = CommentaryGenerator::new(config.commentary.clone())?;

    let mut results = analyzer.analyze_many(&tickers).await;
    results.sort_by_key(|(ticker, _)| tickers.iter().position(|t| t == ticker));

    let mut failures = 0;
    for (ticker, result) in results {
        let analysis = match result {
            Ok(analysis) => analysis,
            Err(e) => {
                failures += 1;
                println!("\n{}: analysis failed at {} stage: {}", ticker, e.stage(), e);
                continue;
            }
        };

        let text = if with_commentary {
            Some(commentary.generate(&analysis.signal).await)
        } else {
            None
        };
        let summary = TerminalSummary {
            signal: &analysis.signal,
            closes: &analysis.closes,
            commentary: text.as_deref(),
        };
        println!("\n{}", summary);

        if write_report {
            match report::write_html_report(
                &config.storage.reports_dir,
                &analysis.signal,
                &analysis.closes,
                text.as_deref().unwrap_or(""),
            ) {
                Ok(path) => println!("Report: {}", path.display()),
                Err(e) => warn!("{}: report not written: {}", ticker, e),
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} analyses failed", failures, tickers.len());
    }
    Ok(())
}

async fn show_history(config: &AppConfig, ticker: Option<String>, limit: u32, json: bool) -> Result<()> {
    let store = SqliteSignalStore::connect(&config.storage.database_url).await?;
    let signals = store.load_history(ticker, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&signals)?);
        return Ok(());
    }
    if signals.is_empty() {
        println!("No signals recorded yet.");
        return Ok(());
    }

    println!("\nShowing {} of {} stored signal(s)", signals.len(), store.count().await?);
    println!(
        "{:<10} {:<8} {:>10} {:<9} {:<6} {:>7} {:>8}",
        "DATE", "TICKER", "PRICE", "REGIME", "DIR", "WIN P", "SIZE"
    );
    for s in &signals {
        println!(
            "{:<10} {:<8} {:>10} {:<9} {:<6} {:>6.1}% {:>7.2}%",
            s.as_of().format("%Y-%m-%d"),
            s.ticker(),
            s.price().round_dp(2).to_string(),
            s.regime().label.as_str(),
            s.ensemble().direction.as_str(),
            s.ensemble().win_probability * 100.0,
            s.target_exposure() * 100.0
        );
    }
    Ok(())
}

fn show_reports(config: &AppConfig) -> Result<()> {
    let reports = report::list_reports(&config.storage.reports_dir)?;
    if reports.is_empty() {
        println!("No reports in {}", config.storage.reports_dir.display());
        return Ok(());
    }
    for r in reports {
        println!(
            "{}  {:>8} B  {}",
            r.modified.format("%Y-%m-%d %H:%M"),
            r.size_bytes,
            r.path.display()
        );
    }
    Ok(())
}
