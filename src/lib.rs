pub mod aggregate;
pub mod batch;
pub mod constants;
pub mod covariance;
pub mod error;
pub mod galaxy;
pub mod kernel;
pub mod sfr;
pub mod spaxels;
pub mod utils;

pub use error::{Result, SfrError};

/// Row-major linear index of a spaxel, `row * side + col`
pub type PixelIndex = usize;
