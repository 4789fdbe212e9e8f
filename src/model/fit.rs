//! Fit protocol: single-pixel fits, navigation-wide multifit, and
//! component-focused fitting.
//!
//! The protocol is capability-driven. Requests the selected backend
//! cannot honour are either hard errors (maximum likelihood on a
//! least-squares backend) or logged downgrades (bounds on an unbounded
//! backend, analytic gradients when a component lacks them).

use std::fs;
use std::path::PathBuf;

use chrono::Local;
use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::error::EngineError;
use crate::io::save_parameters_to_file;
use crate::model::Model;
use crate::optim::{
    levenberg_marquardt, nelder_mead, numeric_hessian, Bound, Fitter, JacobianFn, LmOptions,
    NelderOptions,
};
use crate::progress::Progress;
use crate::signal::NavMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMethod {
    /// Least squares on weighted residuals.
    #[default]
    Ls,
    /// Poisson maximum likelihood; only the `fmin` backend supports it.
    Ml,
}

/// Residual weighting policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Weights {
    /// Unweighted residuals.
    #[default]
    None,
    /// Inverse standard-deviation weights from the dataset variance,
    /// estimating a Poisson variance first when none is attached.
    FromVariance,
    /// Caller-supplied per-channel weights over the full signal axis.
    Manual(Vec<f64>),
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Backend to use; None falls back to the model's default fitter.
    pub fitter: Option<Fitter>,
    pub method: FitMethod,
    /// Request analytic gradients. Downgraded to numeric differentiation
    /// with a warning when any active component lacks them.
    pub grad: bool,
    pub weights: Weights,
    /// Request box bounds. Downgraded with a warning on backends that
    /// cannot bound.
    pub bounded: bool,
    /// Clamp parameters to their bounds for the duration of the fit, so
    /// every objective evaluation sees in-bounds values even on unbounded
    /// backends. The final solution is clamped and reported too.
    pub ext_bounding: bool,
    pub max_iter: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            fitter: None,
            method: FitMethod::Ls,
            grad: false,
            weights: Weights::None,
            bounded: false,
            ext_bounding: false,
            max_iter: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitOutput {
    pub fitter: Fitter,
    pub method: FitMethod,
    /// Solution in packing order.
    pub p: Vec<f64>,
    /// Per-element standard errors, when the backend produced any.
    pub p_std: Option<Vec<f64>>,
    /// Sum of squared weighted residuals (`Ls`) or the negative Poisson
    /// log-likelihood (`Ml`) at the solution.
    pub residual_sum: f64,
    pub iterations: usize,
    /// `component.parameter` names clamped by ext-bounding.
    pub clamped: Vec<String>,
}

/// Periodic parameter snapshotting during multifit.
#[derive(Debug, Clone)]
pub struct Autosave {
    /// Snapshot after every `every` fitted pixels.
    pub every: usize,
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MultifitOutput {
    pub fitted: usize,
    pub skipped: usize,
    /// Flat navigation index and error message of every failed pixel.
    pub failures: Vec<(usize, String)>,
    /// Autosave artifact, kept only when failures occurred.
    pub autosave_path: Option<PathBuf>,
}

impl Model {
    /// Fit the active components to the current-position spectrum.
    ///
    /// On success the solution is charged back into the parameters,
    /// stored into the per-pixel maps at the current coordinate, and
    /// recorded in `fit_output`. On failure the parameters keep their
    /// pre-fit working values.
    pub fn fit(&mut self, options: &FitOptions) -> Result<FitOutput, EngineError> {
        let fitter = options.fitter.unwrap_or(self.default_fitter);

        if options.method == FitMethod::Ml && !fitter.supports_ml() {
            return Err(EngineError::usage(format!(
                "Maximum-likelihood estimation requires the fmin optimizer, not '{}'.",
                fitter.name()
            )));
        }
        let bounded = if options.bounded && !fitter.supports_bounds() {
            warn!(
                "Bounds requested but the '{}' optimizer cannot bound; fitting unbounded.",
                fitter.name()
            );
            false
        } else {
            options.bounded
        };

        let weights_masked = self.resolve_weights(options)?;
        let y = self.masked_slice(self.spectrum().current_data());
        if y.is_empty() {
            return Err(EngineError::usage("The signal range excludes every channel."));
        }

        self.set_p0();
        let p0 = self.p0().to_vec();
        if p0.is_empty() {
            return Err(EngineError::fit("Nothing to fit: no free parameters."));
        }

        let use_grad = if options.grad && fitter.is_least_squares() {
            if self.has_analytic_gradients() {
                true
            } else {
                warn!("An active component has no analytic gradient; using numeric differentiation.");
                false
            }
        } else {
            false
        };

        let bounds = if bounded {
            Some(self.pack_bounds())
        } else {
            None
        };

        if options.ext_bounding {
            self.set_ext_bounding(true);
        }
        let mut observer_box = self.take_iteration_observer();
        let observer: Option<&mut dyn FnMut(&[f64])> = observer_box
            .as_mut()
            .map(|b| &mut **b as &mut dyn FnMut(&[f64]));

        let w = weights_masked.as_deref();
        let model = &*self;
        let residuals = |p: &[f64]| -> Result<DVector<f64>, EngineError> {
            Ok(DVector::from_vec(model.errfunc(p, &y, w)?))
        };
        let jac = |p: &[f64]| -> Result<DMatrix<f64>, EngineError> {
            Ok(model.jacobian(p, w)?.transpose())
        };
        let jacobian: Option<JacobianFn<'_>> = if use_grad { Some(&jac) } else { None };

        let outcome = match fitter {
            Fitter::Leastsq | Fitter::Mpfit => {
                let lm_options = LmOptions {
                    max_iter: options.max_iter,
                    ..LmOptions::default()
                };
                levenberg_marquardt(
                    &residuals,
                    jacobian,
                    &p0,
                    bounds.as_deref(),
                    &lm_options,
                    observer,
                )
                .map(|out| {
                    let p_std = out.covariance.as_ref().map(|cov| {
                        (0..out.p.len())
                            .map(|k| cov[(k, k)].max(0.0).sqrt())
                            .collect::<Vec<f64>>()
                    });
                    (out.p, p_std, out.sse, out.iterations)
                })
            }
            Fitter::Fmin => {
                let cost = |p: &[f64]| -> Result<f64, EngineError> {
                    match options.method {
                        FitMethod::Ls => model.least_squares_cost(p, &y, w),
                        FitMethod::Ml => model.poisson_likelihood(p, &y),
                    }
                };
                let nelder_options = NelderOptions {
                    max_iter: options.max_iter.max(NelderOptions::default().max_iter),
                    ..NelderOptions::default()
                };
                nelder_mead(&cost, &p0, &nelder_options, observer).map(|out| {
                    let p_std = match options.method {
                        FitMethod::Ml => ml_standard_errors(&cost, &out.p),
                        FitMethod::Ls => None,
                    };
                    (out.p, p_std, out.cost, out.iterations)
                })
            }
        };
        self.restore_iteration_observer(observer_box);
        if options.ext_bounding {
            self.set_ext_bounding(false);
        }
        let (mut p, p_std, residual_sum, iterations) = outcome?;

        let clamped = if options.ext_bounding {
            self.clamp_packed(&mut p)
        } else {
            Vec::new()
        };

        self.charge_p0(&p, p_std.as_deref())?;
        self.set();

        let output = FitOutput {
            fitter,
            method: options.method,
            p,
            p_std,
            residual_sum,
            iterations,
            clamped,
        };
        self.fit_output = Some(output.clone());
        Ok(output)
    }

    /// Fit with the backend resolved by name. Unknown names fail before
    /// any model state is touched.
    pub fn fit_named(
        &mut self,
        fitter_name: &str,
        options: &FitOptions,
    ) -> Result<FitOutput, EngineError> {
        let fitter = Fitter::from_name(fitter_name)?;
        let options = FitOptions {
            fitter: Some(fitter),
            ..options.clone()
        };
        self.fit(&options)
    }

    /// Fit every navigation position in row-major scan order.
    ///
    /// Masked pixels are skipped. A failing pixel is recorded and the
    /// scan continues; its map entry keeps whatever was stored before.
    /// With `charge_only_fixed`, free parameters warm-start from the
    /// previous pixel's solution instead of the stored map values.
    pub fn multifit(
        &mut self,
        mask: Option<&NavMask>,
        charge_only_fixed: bool,
        autosave: Option<&Autosave>,
        options: &FitOptions,
        progress: &mut dyn Progress,
    ) -> Result<MultifitOutput, EngineError> {
        let nav_size = self.spectrum().nav_size();
        if let Some(mask) = mask {
            if mask.shape() != self.spectrum().nav_shape() {
                return Err(EngineError::usage(format!(
                    "Mask shape {:?} does not match the navigation shape {:?}.",
                    mask.shape(),
                    self.spectrum().nav_shape()
                )));
            }
        }
        // Resolve capability conflicts before fitting anything.
        let fitter = options.fitter.unwrap_or(self.default_fitter);
        if options.method == FitMethod::Ml && !fitter.supports_ml() {
            return Err(EngineError::usage(format!(
                "Maximum-likelihood estimation requires the fmin optimizer, not '{}'.",
                fitter.name()
            )));
        }

        let autosave_path = autosave.map(|a| {
            a.directory.join(format!(
                "specfit_autosave-{}.json",
                Local::now().format("%Y%m%d-%H%M%S")
            ))
        });

        let mut fitted = 0usize;
        let mut skipped = 0usize;
        let mut failures: Vec<(usize, String)> = Vec::new();
        let mut since_save = 0usize;
        let mut saved = false;

        for index in 0..nav_size {
            if mask.is_some_and(|m| !m.selected(index)) {
                skipped += 1;
                progress.update(index + 1);
                continue;
            }
            self.set_index(index)?;
            self.charge(charge_only_fixed);
            match self.fit(options) {
                Ok(_) => {
                    fitted += 1;
                    since_save += 1;
                }
                Err(e) => {
                    warn!("Fit failed at navigation index {index}: {e}");
                    failures.push((index, e.to_string()));
                }
            }
            if let (Some(a), Some(path)) = (autosave, autosave_path.as_ref()) {
                if since_save >= a.every.max(1) {
                    save_parameters_to_file(self, path)?;
                    saved = true;
                    since_save = 0;
                }
            }
            progress.update(index + 1);
        }
        progress.finish();

        let autosave_path = match (autosave_path, saved) {
            (Some(path), true) if failures.is_empty() => {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Could not remove autosave file {}: {e}", path.display());
                }
                None
            }
            (Some(path), true) => Some(path),
            _ => None,
        };

        Ok(MultifitOutput {
            fitted,
            skipped,
            failures,
            autosave_path,
        })
    }

    /// Fit a single component, optionally over a restricted range and
    /// with estimator-based starting values.
    ///
    /// Unless `fit_independent`, every other component is deactivated for
    /// the duration. The signal range and activity flags are restored
    /// afterwards whether the fit succeeds or not.
    pub fn fit_component(
        &mut self,
        ci: usize,
        signal_range: Option<(f64, f64)>,
        estimate: bool,
        fit_independent: bool,
        options: &FitOptions,
    ) -> Result<FitOutput, EngineError> {
        if ci >= self.len() {
            return Err(EngineError::usage(format!(
                "Component index {ci} out of range ({} components).",
                self.len()
            )));
        }
        let saved_switches = self.channel_switches().to_vec();
        let saved_active: Vec<bool> = self.components().iter().map(|c| c.active).collect();

        let result = self.fit_component_inner(ci, signal_range, estimate, fit_independent, options);

        for (component, &active) in self.components_mut().iter_mut().zip(&saved_active) {
            component.active = active;
        }
        self.set_channel_switches(saved_switches);
        result
    }

    fn fit_component_inner(
        &mut self,
        ci: usize,
        signal_range: Option<(f64, f64)>,
        estimate: bool,
        fit_independent: bool,
        options: &FitOptions,
    ) -> Result<FitOutput, EngineError> {
        let axis = self.spectrum().axis().clone();
        let (i1, i2) = match signal_range {
            Some((x1, x2)) => {
                self.set_signal_range(x1, x2)?;
                (
                    axis.value_to_index(x1.min(x2))?,
                    axis.value_to_index(x1.max(x2))?,
                )
            }
            None => (0, axis.size - 1),
        };

        if estimate {
            let data = self.spectrum().current_data().to_vec();
            let grid = axis.values();
            let estimated = self
                .component(ci)
                .shape()
                .estimate_parameters(&data, &grid, i1, i2);
            if let Some(values) = estimated {
                self.component_mut(ci).charge(&values, None, false)?;
            } else {
                warn!(
                    "Parameter estimation produced nothing for component '{}'.",
                    self.component(ci).name
                );
            }
        }

        if !fit_independent {
            for (k, component) in self.components_mut().iter_mut().enumerate() {
                if k != ci {
                    component.active = false;
                }
            }
        }
        self.fit(options)
    }

    fn resolve_weights(&mut self, options: &FitOptions) -> Result<Option<Vec<f64>>, EngineError> {
        if options.method == FitMethod::Ml {
            if options.weights != Weights::None {
                warn!("Weights are ignored by maximum-likelihood estimation.");
            }
            return Ok(None);
        }
        match &options.weights {
            Weights::None => Ok(None),
            Weights::FromVariance => {
                if !self.spectrum().has_variance() {
                    self.spectrum_mut().estimate_variance(1.0, 0.0);
                }
                let variance = self
                    .spectrum()
                    .current_variance()
                    .ok_or_else(|| EngineError::usage("No variance available for weighting."))?;
                let masked = self.masked_slice(variance);
                Ok(Some(masked.iter().map(|&v| 1.0 / v.sqrt()).collect()))
            }
            Weights::Manual(weights) => {
                if weights.len() != self.spectrum().axis().size {
                    return Err(EngineError::usage(format!(
                        "Manual weights length {} does not match the {} signal channels.",
                        weights.len(),
                        self.spectrum().axis().size
                    )));
                }
                Ok(Some(self.masked_slice(weights)))
            }
        }
    }

    /// Per-element box bounds in packing order.
    fn pack_bounds(&self) -> Vec<Bound> {
        let mut bounds = Vec::new();
        for entry in self.packing_table() {
            let parameter = &self.component(entry.ci).parameters()[entry.pi];
            for _ in 0..entry.n {
                bounds.push(Bound {
                    lower: parameter.bmin,
                    upper: parameter.bmax,
                });
            }
        }
        bounds
    }

    /// Clamp a packed solution to parameter bounds, returning the
    /// `component.parameter` names that were clamped.
    fn clamp_packed(&self, p: &mut [f64]) -> Vec<String> {
        let mut clamped = Vec::new();
        let mut row = 0;
        for entry in self.packing_table() {
            let component = self.component(entry.ci);
            let parameter = &component.parameters()[entry.pi];
            let mut touched = false;
            for _ in 0..entry.n {
                let mut v = p[row];
                if let Some(lo) = parameter.bmin {
                    v = v.max(lo);
                }
                if let Some(hi) = parameter.bmax {
                    v = v.min(hi);
                }
                if v != p[row] {
                    p[row] = v;
                    touched = true;
                }
                row += 1;
            }
            if touched {
                clamped.push(format!("{}.{}", component.name, parameter.name));
            }
        }
        clamped
    }
}

/// Standard errors from the inverse Hessian of the likelihood cost.
/// None when the Hessian is singular or not positive on the diagonal.
fn ml_standard_errors(
    cost: &(dyn Fn(&[f64]) -> Result<f64, EngineError> + Sync),
    p: &[f64],
) -> Option<Vec<f64>> {
    let hessian = numeric_hessian(cost, p).ok()?;
    let inverse = hessian.try_inverse()?;
    let mut std = Vec::with_capacity(p.len());
    for k in 0..p.len() {
        let v = inverse[(k, k)];
        if !(v.is_finite() && v >= 0.0) {
            return None;
        }
        std.push(v.sqrt());
    }
    Some(std)
}
