pub mod sizing;

pub use sizing::{kelly_fraction, KellySizer, RegimeMultipliers, SizingConfigError};
