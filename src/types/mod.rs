pub mod bar;
pub mod signal;

pub use bar::*;
pub use signal::*;
