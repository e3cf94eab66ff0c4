pub mod aggregator;
pub mod calibration;

pub use aggregator::{combine, EnsembleOutcome, EnsemblePredictor};
pub use calibration::Calibration;
