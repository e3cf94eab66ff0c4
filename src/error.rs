use std::fmt;
use thiserror::Error;

/// Pipeline stage an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Data,
    Features,
    Regime,
    Ensemble,
    Sizing,
    Persistence,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Data => "data",
            Stage::Features => "features",
            Stage::Regime => "regime",
            Stage::Ensemble => "ensemble",
            Stage::Sizing => "sizing",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Every way a single analysis can fail. All variants are terminal for that analysis.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("[{stage}] insufficient history: {available} usable rows, need {required}")]
    InsufficientHistory {
        stage: Stage,
        available: usize,
        required: usize,
    },

    #[error("[{stage}] regime fit diverged: {reason}")]
    RegimeFitDivergence { stage: Stage, reason: String },

    #[error("[{stage}] insufficient models: {reason}")]
    InsufficientModels { stage: Stage, reason: String },

    #[error("[{stage}] invalid payoff ratio {ratio}: Kelly is undefined for b <= 0")]
    InvalidPayoffRatio { stage: Stage, ratio: f64 },

    #[error("[{stage}] data unavailable for {ticker}: {reason}")]
    DataUnavailable {
        stage: Stage,
        ticker: String,
        reason: String,
    },

    #[error("[{stage}] persistence failure: {reason}")]
    PersistenceFailure { stage: Stage, reason: String },
}

impl SignalError {
    pub fn stage(&self) -> Stage {
        match self {
            SignalError::InsufficientHistory { stage, .. }
            | SignalError::RegimeFitDivergence { stage, .. }
            | SignalError::InsufficientModels { stage, .. }
            | SignalError::InvalidPayoffRatio { stage, .. }
            | SignalError::DataUnavailable { stage, .. }
            | SignalError::PersistenceFailure { stage, .. } => *stage,
        }
    }

    pub fn insufficient_history(available: usize, required: usize) -> Self {
        SignalError::InsufficientHistory {
            stage: Stage::Features,
            available,
            required,
        }
    }

    pub fn regime_divergence(reason: impl Into<String>) -> Self {
        SignalError::RegimeFitDivergence {
            stage: Stage::Regime,
            reason: reason.into(),
        }
    }

    pub fn insufficient_models(reason: impl Into<String>) -> Self {
        SignalError::InsufficientModels {
            stage: Stage::Ensemble,
            reason: reason.into(),
        }
    }

    pub fn invalid_payoff(ratio: f64) -> Self {
        SignalError::InvalidPayoffRatio {
            stage: Stage::Sizing,
            ratio,
        }
    }

    pub fn data_unavailable(ticker: &str, reason: impl Into<String>) -> Self {
        SignalError::DataUnavailable {
            stage: Stage::Data,
            ticker: ticker.to_string(),
            reason: reason.into(),
        }
    }

    pub fn persistence(reason: impl Into<String>) -> Self {
        SignalError::PersistenceFailure {
            stage: Stage::Persistence,
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for SignalError {
    fn from(e: sqlx::Error) -> Self {
        SignalError::persistence(e.to_string())
    }
}

pub type SignalResult<T> = std::result::Result<T, SignalError>;
