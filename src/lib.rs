//! `specfit` library crate.
//!
//! Curve fitting for multi-dimensional spectral datasets: models built
//! from parametric components are fitted per navigation position, with
//! optional low-loss convolution, per-pixel parameter maps, and a small
//! set of interchangeable optimizer backends.
//!
//! The binary (`specfit`) is a thin wrapper around this library so the
//! core logic is testable without spawning processes.

pub mod app;
pub mod cli;
pub mod components;
pub mod data;
pub mod error;
pub mod io;
pub mod math;
pub mod metadata;
pub mod model;
pub mod optim;
pub mod progress;
pub mod report;
pub mod signal;
