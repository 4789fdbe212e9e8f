//! Built-in component shapes.
//!
//! A deliberately small library exercising every corner of the
//! `ComponentShape` contract: analytic gradients, parameter estimation,
//! and their absence.

pub mod gaussian;
pub mod offset;
pub mod power_law;

pub use gaussian::Gaussian;
pub use offset::Offset;
pub use power_law::PowerLaw;
