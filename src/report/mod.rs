pub mod commentary;

pub use commentary::{fallback_commentary, CommentaryGenerator};

use askama::Template;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::types::{Direction, RegimeLabel, Signal};

const SPARK_CHARS: [char; 5] = ['_', '.', '-', '~', '^'];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("template rendering failed: {0}")]
    Render(#[from] askama::Error),

    #[error("report I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Map the last `width` values onto a five-level character ramp
pub fn sparkline(values: &[f64], width: usize) -> String {
    if values.len() < 2 {
        return "-".repeat(width);
    }
    let tail = &values[values.len().saturating_sub(width)..];
    let min = tail.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = tail.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == min {
        return "-".repeat(tail.len());
    }

    let top = (SPARK_CHARS.len() - 1) as f64;
    tail.iter()
        .map(|v| {
            let idx = (((v - min) / (max - min)) * top) as usize;
            SPARK_CHARS[idx.min(SPARK_CHARS.len() - 1)]
        })
        .collect()
}

pub fn horizontal_bar(value: f64, max_value: f64, width: usize) -> String {
    if max_value <= 0.0 || !value.is_finite() {
        return format!("[{}]", ".".repeat(width));
    }
    let filled = ((value / max_value) * width as f64).floor().clamp(0.0, width as f64) as usize;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

/// Percentage change over the last `days` closes
pub fn price_trend(closes: &[f64], days: usize) -> String {
    if days < 2 || closes.len() < days {
        return "N/A".to_string();
    }
    let recent = &closes[closes.len() - days..];
    let change = (recent[days - 1] - recent[0]) / recent[0] * 100.0;
    let (arrow, word) = if change > 1.0 {
        ("^", "UP")
    } else if change < -1.0 {
        ("v", "DOWN")
    } else {
        ("-", "FLAT")
    };
    format!("{} {} ({:+.2}%)", arrow, word, change)
}

fn pct(x: f64) -> String {
    format!("{:.2}%", x * 100.0)
}

/// Terminal rendering of one signal
pub struct TerminalSummary<'a> {
    pub signal: &'a Signal,
    pub closes: &'a [f64],
    pub commentary: Option<&'a str>,
}

impl fmt::Display for TerminalSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.signal;
        let line = "=".repeat(64);

        writeln!(f, "{}", line)?;
        writeln!(f, " {}  {}  {}", s.ticker(), s.price(), s.as_of().format("%Y-%m-%d"))?;
        writeln!(f, " {}  {}", sparkline(self.closes, 40), price_trend(self.closes, 5))?;
        writeln!(f, "{}", line)?;

        writeln!(f, " REGIME")?;
        for label in RegimeLabel::ALL {
            let p = s.regime().probability(label);
            let marker = if label == s.regime().label { "*" } else { " " };
            writeln!(f, " {} {:<9} {} {:>7}", marker, label.as_str(), horizontal_bar(p, 1.0, 20), pct(p))?;
        }

        writeln!(f, " MODELS")?;
        for m in s.predictions() {
            writeln!(
                f,
                "   {:<18} {:<5} conf {} acc {}",
                m.model_id,
                m.direction.as_str(),
                horizontal_bar(m.confidence, 1.0, 20),
                pct(m.historical_accuracy)
            )?;
        }
        let e = s.ensemble();
        writeln!(
            f,
            "   {:<18} {:<5} conf {:>7}  win p {:>7}",
            "ensemble",
            e.direction.as_str(),
            pct(e.confidence),
            pct(e.win_probability)
        )?;

        let z = s.sizing();
        writeln!(f, " SIZING")?;
        writeln!(f, "   full kelly {:>8}   payoff {:.2}", pct(z.full_kelly), z.payoff_ratio)?;
        writeln!(
            f,
            "   recommended {:>7}   regime x{:.2}   cap {}",
            pct(z.recommended),
            z.regime_multiplier,
            pct(z.max_allowed)
        )?;
        writeln!(f, "   exposure {:>+9.2}%", s.target_exposure() * 100.0)?;

        if let Some(text) = self.commentary {
            writeln!(f, "{}", line)?;
            writeln!(f, "{}", text.trim())?;
        }
        write!(f, "{}", line)
    }
}

struct RegimeRow {
    label: String,
    probability: String,
    bar: String,
    current: bool,
}

struct ModelRow {
    model_id: String,
    direction: String,
    confidence: String,
    accuracy: String,
}

#[derive(Template)]
#[template(path = "signal_report.html")]
struct SignalReportTemplate {
    ticker: String,
    as_of: String,
    price: String,
    signal_id: String,
    direction: String,
    direction_class: String,
    confidence: String,
    win_probability: String,
    regimes: Vec<RegimeRow>,
    models: Vec<ModelRow>,
    full_kelly: String,
    payoff_ratio: String,
    regime_multiplier: String,
    adjusted: String,
    recommended: String,
    max_allowed: String,
    exposure: String,
    sparkline: String,
    commentary: String,
}

impl SignalReportTemplate {
    fn new(signal: &Signal, closes: &[f64], commentary: &str) -> Self {
        let regime = signal.regime();
        let ensemble = signal.ensemble();
        let sizing = signal.sizing();

        Self {
            ticker: signal.ticker().to_string(),
            as_of: signal.as_of().format("%Y-%m-%d").to_string(),
            price: signal.price().to_string(),
            signal_id: signal.id().to_string(),
            direction: ensemble.direction.to_string(),
            direction_class: match ensemble.direction {
                Direction::Long => "long".to_string(),
                Direction::Short => "short".to_string(),
            },
            confidence: pct(ensemble.confidence),
            win_probability: pct(ensemble.win_probability),
            regimes: RegimeLabel::ALL
                .iter()
                .map(|&label| RegimeRow {
                    label: label.to_string(),
                    probability: pct(regime.probability(label)),
                    bar: horizontal_bar(regime.probability(label), 1.0, 20),
                    current: label == regime.label,
                })
                .collect(),
            models: signal
                .predictions()
                .iter()
                .map(|m| ModelRow {
                    model_id: m.model_id.clone(),
                    direction: m.direction.to_string(),
                    confidence: pct(m.confidence),
                    accuracy: pct(m.historical_accuracy),
                })
                .collect(),
            full_kelly: pct(sizing.full_kelly),
            payoff_ratio: format!("{:.3}", sizing.payoff_ratio),
            regime_multiplier: format!("{:.2}", sizing.regime_multiplier),
            adjusted: pct(sizing.adjusted),
            recommended: pct(sizing.recommended),
            max_allowed: pct(sizing.max_allowed),
            exposure: format!("{:+.2}%", signal.target_exposure() * 100.0),
            sparkline: sparkline(closes, 60),
            commentary: commentary.to_string(),
        }
    }
}

pub fn render_html(signal: &Signal, closes: &[f64], commentary: &str) -> Result<String, ReportError> {
    Ok(SignalReportTemplate::new(signal, closes, commentary).render()?)
}

/// Render and write `<TICKER>_<date>_<id>.html` into `dir`, creating it if needed
pub fn write_html_report(
    dir: &Path,
    signal: &Signal,
    closes: &[f64],
    commentary: &str,
) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(dir)?;
    let id = signal.id().simple().to_string();
    let name = format!(
        "{}_{}_{}.html",
        signal.ticker(),
        signal.as_of().format("%Y%m%d"),
        &id[..8]
    );
    let path = dir.join(name);
    fs::write(&path, render_html(signal, closes, commentary)?)?;
    info!("Report written to {}", path.display());
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// HTML reports in `dir`, newest first. A missing directory is an empty list.
pub fn list_reports(dir: &Path) -> Result<Vec<ReportEntry>, ReportError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("html") {
            continue;
        }
        let meta = entry.metadata()?;
        entries.push(ReportEntry {
            path,
            modified: DateTime::<Utc>::from(meta.modified()?),
            size_bytes: meta.len(),
        });
    }
    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(entries)
}
