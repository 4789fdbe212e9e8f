//! Dataset-side types: calibrated axes and hyperspectral datasets.

pub mod axis;
pub mod spectrum;

pub use axis::*;
pub use spectrum::*;
