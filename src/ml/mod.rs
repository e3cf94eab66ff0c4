pub mod ensemble;
pub mod features;
pub mod hmm;
pub mod models;

pub use ensemble::{EnsembleOutcome, EnsemblePredictor};
pub use features::{build_features, FeatureConfig, FeatureKind, FeatureSet, FeatureVector};
pub use hmm::{GaussianHmm, RegimeDetector};
pub use models::DirectionalModel;
