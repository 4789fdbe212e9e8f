//! Optimizer backends behind a uniform adapter contract.
//!
//! Each backend consumes a flat free-parameter vector and either a
//! residual vector (least-squares family) or a scalar cost (general
//! family). Capabilities differ per backend and are queried by the fit
//! protocol:
//!
//! - `leastsq`: Levenberg–Marquardt, gradient-capable, unbounded,
//!   covariance output.
//! - `mpfit`: Levenberg–Marquardt with per-parameter box bounds; the only
//!   bounded backend.
//! - `fmin`: Nelder–Mead simplex over a scalar cost; gradient-free and
//!   the only backend supporting maximum-likelihood estimation.

pub mod lm;
pub mod nelder;

pub use lm::{
    levenberg_marquardt, numeric_hessian, Bound, JacobianFn, LmOptions, LmOutput, ResidualFn,
};
pub use nelder::{nelder_mead, NelderOptions, NelderOutput};

use crate::error::EngineError;

/// The fixed set of optimizer backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fitter {
    Leastsq,
    Mpfit,
    Fmin,
}

impl Fitter {
    pub const NAMES: [&'static str; 3] = ["leastsq", "mpfit", "fmin"];

    /// Resolve a fitter by name, failing fast with the list of valid
    /// names. Nothing else in the model is touched on failure.
    pub fn from_name(name: &str) -> Result<Self, EngineError> {
        match name {
            "leastsq" => Ok(Fitter::Leastsq),
            "mpfit" => Ok(Fitter::Mpfit),
            "fmin" => Ok(Fitter::Fmin),
            other => Err(EngineError::usage(format!(
                "The '{other}' optimizer is not available. Available optimizers: {}.",
                Self::NAMES.join(", ")
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Fitter::Leastsq => "leastsq",
            Fitter::Mpfit => "mpfit",
            Fitter::Fmin => "fmin",
        }
    }

    pub fn supports_bounds(&self) -> bool {
        matches!(self, Fitter::Mpfit)
    }

    pub fn supports_ml(&self) -> bool {
        matches!(self, Fitter::Fmin)
    }

    pub fn is_least_squares(&self) -> bool {
        matches!(self, Fitter::Leastsq | Fitter::Mpfit)
    }
}

impl std::str::FromStr for Fitter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fitter_lists_valid_names() {
        let err = Fitter::from_name("not_a_real_fitter").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not_a_real_fitter"));
        for name in Fitter::NAMES {
            assert!(msg.contains(name));
        }
    }

    #[test]
    fn capability_matrix() {
        assert!(!Fitter::Leastsq.supports_bounds());
        assert!(Fitter::Mpfit.supports_bounds());
        assert!(!Fitter::Mpfit.supports_ml());
        assert!(Fitter::Fmin.supports_ml());
        assert!(!Fitter::Fmin.is_least_squares());
    }
}
