pub mod profiles;
pub mod settings;

pub use profiles::*;
pub use settings::*;
