use serde::{Deserialize, Serialize};

use crate::config::CalibrationSettings;

/// Maps ensemble confidence to a win probability with a logistic curve
/// squeezed into `[floor, ceiling]`.
///
/// `p = floor + (ceiling - floor) * sigmoid(slope * (c - 0.5))`, so a coin-flip
/// confidence of 0.5 always maps to 0.5 when the bounds are symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub slope: f64,
    pub floor: f64,
    pub ceiling: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            slope: 4.0,
            floor: 0.05,
            ceiling: 0.95,
        }
    }
}

impl From<&CalibrationSettings> for Calibration {
    fn from(settings: &CalibrationSettings) -> Self {
        Self {
            slope: settings.slope,
            floor: settings.floor,
            ceiling: settings.ceiling,
        }
    }
}

impl Calibration {
    pub fn win_probability(&self, confidence: f64) -> f64 {
        let s = 1.0 / (1.0 + (-self.slope * (confidence - 0.5)).exp());
        self.floor + (self.ceiling - self.floor) * s
    }
}
