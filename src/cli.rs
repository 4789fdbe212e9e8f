//! Command-line parsing for the spectral fitting engine.
//!
//! Argument parsing and command dispatch stay separate from the
//! model/optimizer code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "specfit",
    version,
    about = "Curve fitting for multi-dimensional spectral datasets"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit the model at one navigation position of a synthetic scan.
    Fit(FitArgs),
    /// Fit every navigation position of a synthetic scan.
    Multifit(MultifitArgs),
}

/// Common options for single and scan-wide fits.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// Navigation rows of the generated scan.
    #[arg(long, default_value_t = 4)]
    pub rows: usize,

    /// Navigation columns of the generated scan.
    #[arg(long, default_value_t = 4)]
    pub cols: usize,

    /// Signal channels per spectrum.
    #[arg(long, default_value_t = 256)]
    pub channels: usize,

    /// Additive gaussian noise level.
    #[arg(long, default_value_t = 0.5)]
    pub noise: f64,

    /// Random seed for the generated scan.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Optimizer backend (leastsq, mpfit, fmin). Defaults to leastsq.
    #[arg(long)]
    pub fitter: Option<String>,

    /// Use analytic gradients where the components provide them.
    #[arg(long)]
    pub grad: bool,

    /// Enforce parameter bounds (requires the mpfit backend).
    #[arg(long)]
    pub bounded: bool,

    /// Poisson maximum-likelihood estimation (requires the fmin backend).
    #[arg(long)]
    pub ml: bool,

    /// Weight residuals by the inverse standard deviation from a Poisson
    /// variance estimate.
    #[arg(long = "weight-variance")]
    pub weight_variance: bool,

    /// Optimizer iteration cap.
    #[arg(long, default_value_t = 200)]
    pub max_iter: usize,

    /// Flat navigation index to fit (single-fit mode).
    #[arg(long, default_value_t = 0)]
    pub pixel: usize,

    /// Export the fitted parameter maps to a JSON archive.
    #[arg(long)]
    pub export: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
pub struct MultifitArgs {
    #[command(flatten)]
    pub fit: FitArgs,

    /// Snapshot parameters every N fitted pixels while scanning.
    #[arg(long)]
    pub autosave_every: Option<usize>,

    /// Warm-start free parameters from the previous pixel instead of the
    /// stored maps.
    #[arg(long)]
    pub warm_start: bool,
}
