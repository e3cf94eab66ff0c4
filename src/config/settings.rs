use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::ml::features::{FeatureConfig, FeatureKind};
use crate::ml::models::{ElasticNetParams, GbmParams};

const ENV_PREFIX: &str = "QUANTSIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data: DataSettings,
    pub features: FeatureSettings,
    pub regime: RegimeSettings,
    pub ensemble: EnsembleSettings,
    pub sizing: SizingSettings,
    pub storage: StorageSettings,
    pub commentary: CommentarySettings,
    pub analysis: AnalysisSettings,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Layered load: defaults, then the optional TOML file, then `QUANTSIG__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
        if cfg.commentary.api_key.is_none() {
            cfg.commentary.api_key = std::env::var("GROQ_API_KEY").ok().filter(|k| !k.is_empty());
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.data.lookback_days == 0 {
            errors.push("data.lookback_days must be > 0".to_string());
        }
        if self.data.requests_per_second == 0 {
            errors.push("data.requests_per_second must be > 0".to_string());
        }

        if self.features.windows.is_empty() || self.features.windows.contains(&0) {
            errors.push("features.windows must be non-empty and all > 0".to_string());
        }
        if self.features.kinds.is_empty() {
            errors.push("features.kinds must not be empty".to_string());
        }
        if self.features.min_rows_for_fit < 10 {
            errors.push("features.min_rows_for_fit must be >= 10".to_string());
        }

        // States are ordered by the first observation column, so it has to measure volatility
        match self.regime.observation_features.first() {
            None => errors.push("regime.observation_features must not be empty".to_string()),
            Some(first) if !is_volatility_feature(first) => errors.push(format!(
                "regime.observation_features: first entry '{}' must be a volatility_* or abs_return_1d column",
                first
            )),
            Some(_) => {}
        }
        let feature_names = self.features.feature_config().feature_names();
        for name in &self.regime.observation_features {
            if !feature_names.contains(name) {
                errors.push(format!("regime.observation_features: '{}' is not a configured feature", name));
            }
        }
        if self.regime.max_iter == 0 {
            errors.push("regime.max_iter must be > 0".to_string());
        }
        if self.regime.tolerance <= 0.0 {
            errors.push("regime.tolerance must be > 0".to_string());
        }

        if self.ensemble.evaluation_fraction <= 0.0 || self.ensemble.evaluation_fraction >= 1.0 {
            errors.push("ensemble.evaluation_fraction must be in (0, 1)".to_string());
        }
        if self.ensemble.walk_forward_folds == 0 {
            errors.push("ensemble.walk_forward_folds must be > 0".to_string());
        }
        let cal = &self.ensemble.calibration;
        if !(0.0 < cal.floor && cal.floor < 0.5 && 0.5 < cal.ceiling && cal.ceiling < 1.0) {
            errors.push("ensemble.calibration requires 0 < floor < 0.5 < ceiling < 1".to_string());
        }
        if cal.slope <= 0.0 {
            errors.push("ensemble.calibration.slope must be > 0".to_string());
        }
        if self.ensemble.max_payoff_ratio <= 0.0 {
            errors.push("ensemble.max_payoff_ratio must be > 0".to_string());
        }

        errors.extend(self.sizing.validate());

        if self.analysis.max_concurrency == 0 {
            errors.push("analysis.max_concurrency must be > 0".to_string());
        }
        if self.logging.file_enabled && self.logging.file_name.trim().is_empty() {
            errors.push("logging.file_name must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// File the persistent system log appends to
    pub fn log_file(&self) -> PathBuf {
        self.logging.logs_dir.join(&self.logging.file_name)
    }

    /// TOML rendering with secrets masked
    pub fn to_toml(&self) -> Result<String> {
        let mut redacted = self.clone();
        if redacted.commentary.api_key.is_some() {
            redacted.commentary.api_key = Some("********".to_string());
        }
        Ok(toml::to_string_pretty(&redacted)?)
    }
}

fn is_volatility_feature(name: &str) -> bool {
    name.starts_with("volatility_") || name == "abs_return_1d"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub lookback_days: u32,
    pub base_url: String,
    pub requests_per_second: u32,
    pub timeout_secs: u64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            lookback_days: 252,
            base_url: "https://query1.finance.yahoo.com".to_string(),
            requests_per_second: 2,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub windows: Vec<usize>,
    pub kinds: Vec<FeatureKind>,
    pub min_rows_for_fit: usize,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        let config = FeatureConfig::default();
        Self {
            windows: config.windows,
            kinds: config.kinds,
            min_rows_for_fit: config.min_rows_for_fit,
        }
    }
}

impl FeatureSettings {
    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig {
            windows: self.windows.clone(),
            kinds: self.kinds.clone(),
            min_rows_for_fit: self.min_rows_for_fit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeSettings {
    pub observation_features: Vec<String>,
    pub max_iter: usize,
    pub tolerance: f64,
    pub fit_timeout_secs: u64,
}

impl Default for RegimeSettings {
    fn default() -> Self {
        Self {
            observation_features: vec!["volatility_10d".to_string(), "abs_return_1d".to_string()],
            max_iter: 200,
            tolerance: 1e-4,
            fit_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub slope: f64,
    pub floor: f64,
    pub ceiling: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            slope: 4.0,
            floor: 0.05,
            ceiling: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleSettings {
    /// Trailing share of labelled rows used for walk-forward evaluation
    pub evaluation_fraction: f64,
    pub walk_forward_folds: usize,
    pub max_payoff_ratio: f64,
    pub calibration: CalibrationSettings,
    pub gradient_boosting: GbmParams,
    pub elastic_net: ElasticNetParams,
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            evaluation_fraction: 0.3,
            walk_forward_folds: 3,
            max_payoff_ratio: 10.0,
            calibration: CalibrationSettings::default(),
            gradient_boosting: GbmParams::default(),
            elastic_net: ElasticNetParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingSettings {
    pub half_kelly_factor: f64,
    pub low_vol_multiplier: f64,
    pub med_vol_multiplier: f64,
    pub high_vol_multiplier: f64,
    pub max_allowed: f64,
    /// Fixed payoff ratio b; when unset b is estimated from the evaluation window
    pub assumed_payoff_ratio: Option<f64>,
}

impl Default for SizingSettings {
    fn default() -> Self {
        Self {
            half_kelly_factor: 0.5,
            low_vol_multiplier: 1.0,
            med_vol_multiplier: 0.6,
            high_vol_multiplier: 0.3,
            max_allowed: 0.25,
            assumed_payoff_ratio: None,
        }
    }
}

impl SizingSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.half_kelly_factor <= 0.0 || self.half_kelly_factor > 1.0 {
            errors.push("sizing.half_kelly_factor must be in (0, 1]".to_string());
        }
        if !(1.0 >= self.low_vol_multiplier
            && self.low_vol_multiplier >= self.med_vol_multiplier
            && self.med_vol_multiplier >= self.high_vol_multiplier
            && self.high_vol_multiplier >= 0.0)
        {
            errors.push("sizing multipliers must satisfy 1 >= low >= med >= high >= 0".to_string());
        }
        if self.max_allowed <= 0.0 || self.max_allowed > 1.0 {
            errors.push("sizing.max_allowed must be in (0, 1]".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
    pub reports_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./trade_history.db".to_string(),
            reports_dir: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentarySettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for CommentarySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub max_concurrency: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Append logs to `logs_dir/file_name` in addition to stdout
    pub file_enabled: bool,
    pub logs_dir: PathBuf,
    pub file_name: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file_enabled: true,
            logs_dir: PathBuf::from("logs"),
            file_name: "system.log".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sizing.max_allowed, 0.25);
        assert_eq!(config.features.min_rows_for_fit, 60);
    }

    #[test]
    fn test_unknown_regime_feature_is_rejected() {
        let mut config = AppConfig::default();
        config.regime.observation_features = vec!["volatility_7d".to_string()];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("volatility_7d")));
    }

    #[test]
    fn test_first_regime_feature_must_measure_volatility() {
        let mut config = AppConfig::default();
        config.regime.observation_features = vec!["return_5d".to_string(), "volatility_10d".to_string()];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("first entry 'return_5d'")));

        config.regime.observation_features = vec!["abs_return_1d".to_string(), "return_5d".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_file_location() {
        let config: AppConfig = toml::from_str(
            r#"
            [logging]
            logs_dir = "/var/log/quant"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_file(), PathBuf::from("/var/log/quant/system.log"));
        assert!(config.logging.file_enabled);
        assert_eq!(AppConfig::default().log_file(), PathBuf::from("logs/system.log"));
    }

    #[test]
    fn test_non_monotone_multipliers_rejected() {
        let sizing = SizingSettings {
            med_vol_multiplier: 0.2,
            high_vol_multiplier: 0.5,
            ..SizingSettings::default()
        };
        assert!(!sizing.validate().is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [sizing]
            max_allowed = 0.1

            [features]
            min_rows_for_fit = 80
            "#,
        )
        .unwrap();
        assert_eq!(config.sizing.max_allowed, 0.1);
        assert_eq!(config.sizing.half_kelly_factor, 0.5);
        assert_eq!(config.features.min_rows_for_fit, 80);
        assert_eq!(config.features.windows, vec![5, 10, 20, 30]);
    }

    #[test]
    fn test_to_toml_masks_api_key() {
        let mut config = AppConfig::default();
        config.commentary.api_key = Some("gsk_secret".to_string());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("gsk_secret"));
        assert!(rendered.contains("[sizing]"));
    }
}
