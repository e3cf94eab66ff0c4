use thiserror::Error;
use tracing::debug;

use crate::config::SizingSettings;
use crate::error::{SignalError, SignalResult};
use crate::types::{PositionSizing, RegimeLabel};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingConfigError {
    #[error("regime multipliers must satisfy 1 >= low >= med >= high >= 0 (got {low}, {med}, {high})")]
    NonMonotoneMultipliers { low: f64, med: f64, high: f64 },

    #[error("half-Kelly factor must be in (0, 1], got {0}")]
    InvalidFraction(f64),

    #[error("max allowed position must be in (0, 1], got {0}")]
    InvalidCap(f64),
}

/// Position discount per volatility regime
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeMultipliers {
    low: f64,
    med: f64,
    high: f64,
}

impl RegimeMultipliers {
    pub fn new(low: f64, med: f64, high: f64) -> Result<Self, SizingConfigError> {
        if !(1.0 >= low && low >= med && med >= high && high >= 0.0) {
            return Err(SizingConfigError::NonMonotoneMultipliers { low, med, high });
        }
        Ok(Self { low, med, high })
    }

    pub fn for_regime(&self, label: RegimeLabel) -> f64 {
        match label {
            RegimeLabel::LowVol => self.low,
            RegimeLabel::MedVol => self.med,
            RegimeLabel::HighVol => self.high,
        }
    }
}

impl Default for RegimeMultipliers {
    fn default() -> Self {
        Self {
            low: 1.0,
            med: 0.6,
            high: 0.3,
        }
    }
}

/// Raw Kelly fraction `f* = p - (1 - p) / b`
pub fn kelly_fraction(win_probability: f64, payoff_ratio: f64) -> SignalResult<f64> {
    if !payoff_ratio.is_finite() || payoff_ratio <= 0.0 {
        return Err(SignalError::invalid_payoff(payoff_ratio));
    }
    Ok(win_probability - (1.0 - win_probability) / payoff_ratio)
}

/// Fractional-Kelly sizer with regime discounts and a hard cap.
///
/// The result is relative to the ensemble direction: a negative size means
/// the edge argues against taking the ensemble's side.
#[derive(Debug, Clone, PartialEq)]
pub struct KellySizer {
    half_kelly_factor: f64,
    multipliers: RegimeMultipliers,
    max_allowed: f64,
}

impl KellySizer {
    pub fn new(
        half_kelly_factor: f64,
        multipliers: RegimeMultipliers,
        max_allowed: f64,
    ) -> Result<Self, SizingConfigError> {
        if !(half_kelly_factor > 0.0 && half_kelly_factor <= 1.0) {
            return Err(SizingConfigError::InvalidFraction(half_kelly_factor));
        }
        if !(max_allowed > 0.0 && max_allowed <= 1.0) {
            return Err(SizingConfigError::InvalidCap(max_allowed));
        }
        Ok(Self {
            half_kelly_factor,
            multipliers,
            max_allowed,
        })
    }

    pub fn from_settings(settings: &SizingSettings) -> Result<Self, SizingConfigError> {
        let multipliers = RegimeMultipliers::new(
            settings.low_vol_multiplier,
            settings.med_vol_multiplier,
            settings.high_vol_multiplier,
        )?;
        Self::new(settings.half_kelly_factor, multipliers, settings.max_allowed)
    }

    pub fn size(&self, win_probability: f64, payoff_ratio: f64, regime: RegimeLabel) -> SignalResult<PositionSizing> {
        let full_kelly = kelly_fraction(win_probability, payoff_ratio)?.clamp(-1.0, 1.0);
        let regime_multiplier = self.multipliers.for_regime(regime);
        let adjusted = full_kelly * self.half_kelly_factor * regime_multiplier;
        let recommended = adjusted.clamp(-self.max_allowed, self.max_allowed);

        debug!(
            "Kelly: p={:.3} b={:.3} f*={:.4} regime={} -> {:.4}",
            win_probability, payoff_ratio, full_kelly, regime, recommended
        );

        Ok(PositionSizing {
            full_kelly,
            adjusted,
            recommended,
            max_allowed: self.max_allowed,
            payoff_ratio,
            regime_multiplier,
        })
    }
}

impl Default for KellySizer {
    fn default() -> Self {
        Self {
            half_kelly_factor: 0.5,
            multipliers: RegimeMultipliers::default(),
            max_allowed: 0.25,
        }
    }
}
