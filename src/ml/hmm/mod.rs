pub mod gaussian_hmm;
pub mod regime_detector;

pub use gaussian_hmm::{FitOptions, FitReport, GaussianHmm, HmmError, N_STATES};
pub use regime_detector::RegimeDetector;
