//! Levenberg–Marquardt least squares with optional box bounds.
//!
//! Solves `min Σ r_i(p)^2` by damped normal equations
//! `(JᵀJ + λ diag(JᵀJ)) δ = -Jᵀr`, accepting steps that reduce the cost.
//! When no analytic jacobian is supplied, central finite differences are
//! used with the columns evaluated in parallel.
//!
//! Bounds are enforced by projecting each trial point onto the box; the
//! unbounded path is identical with no projection.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::EngineError;

/// Per-parameter box bound (inclusive, either side optional).
#[derive(Debug, Clone, Copy, Default)]
pub struct Bound {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Bound {
    fn project(&self, v: f64) -> f64 {
        let mut w = v;
        if let Some(lo) = self.lower {
            w = w.max(lo);
        }
        if let Some(hi) = self.upper {
            w = w.min(hi);
        }
        w
    }
}

#[derive(Debug, Clone)]
pub struct LmOptions {
    pub max_iter: usize,
    /// Relative cost-improvement convergence criterion.
    pub ftol: f64,
    /// Step-size convergence criterion.
    pub xtol: f64,
    pub lambda0: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iter: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            lambda0: 1e-3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmOutput {
    pub p: Vec<f64>,
    /// Covariance of the solution, scaled by the reduced chi-square.
    /// None when the normal matrix is singular; callers must treat a
    /// missing covariance as unknown uncertainty, never zero.
    pub covariance: Option<DMatrix<f64>>,
    pub sse: f64,
    pub iterations: usize,
}

pub type ResidualFn<'a> = &'a (dyn Fn(&[f64]) -> Result<DVector<f64>, EngineError> + Sync);
pub type JacobianFn<'a> = &'a (dyn Fn(&[f64]) -> Result<DMatrix<f64>, EngineError> + Sync);

/// Fit `p` starting from `p0`. `jacobian`, when given, must return the
/// `m x n` matrix of ∂r_i/∂p_j. `observer` is invoked after each accepted
/// parameter update.
pub fn levenberg_marquardt(
    residuals: ResidualFn<'_>,
    jacobian: Option<JacobianFn<'_>>,
    p0: &[f64],
    bounds: Option<&[Bound]>,
    options: &LmOptions,
    mut observer: Option<&mut dyn FnMut(&[f64])>,
) -> Result<LmOutput, EngineError> {
    let n = p0.len();
    if n == 0 {
        return Err(EngineError::fit("Nothing to fit: no free parameters."));
    }
    if let Some(b) = bounds {
        if b.len() != n {
            return Err(EngineError::fit(format!(
                "Bounds length {} does not match parameter count {n}.",
                b.len()
            )));
        }
    }

    let mut p: Vec<f64> = p0.to_vec();
    if let Some(b) = bounds {
        for (v, bound) in p.iter_mut().zip(b) {
            *v = bound.project(*v);
        }
    }

    let mut r = residuals(&p)?;
    let mut cost = r.norm_squared();
    if !cost.is_finite() {
        return Err(EngineError::fit(
            "Residuals are not finite at the starting point.",
        ));
    }
    let m = r.len();
    let mut lambda = options.lambda0;
    let mut iterations = 0;
    let mut jtj = DMatrix::zeros(n, n);

    for _ in 0..options.max_iter {
        iterations += 1;
        let j = match jacobian {
            Some(jac) => jac(&p)?,
            None => numeric_jacobian(residuals, &p, &r)?,
        };
        if j.nrows() != m || j.ncols() != n {
            return Err(EngineError::fit(format!(
                "Jacobian shape {}x{} does not match {m} residuals x {n} parameters.",
                j.nrows(),
                j.ncols()
            )));
        }
        jtj = j.transpose() * &j;
        let jtr = j.transpose() * &r;

        let mut improved = false;
        // Inner damping loop: grow lambda until a step is accepted.
        for _ in 0..16 {
            let mut damped = jtj.clone();
            for k in 0..n {
                let d = jtj[(k, k)];
                damped[(k, k)] = d + lambda * d.max(1e-30);
            }
            let Some(delta) = damped.lu().solve(&(-&jtr)) else {
                lambda *= 10.0;
                continue;
            };
            let mut trial: Vec<f64> = p
                .iter()
                .zip(delta.iter())
                .map(|(&pi, &di)| pi + di)
                .collect();
            if let Some(b) = bounds {
                for (v, bound) in trial.iter_mut().zip(b) {
                    *v = bound.project(*v);
                }
            }
            let trial_r = residuals(&trial)?;
            let trial_cost = trial_r.norm_squared();
            if trial_cost.is_finite() && trial_cost < cost {
                let step: f64 = trial
                    .iter()
                    .zip(&p)
                    .map(|(&a, &b)| (a - b).abs())
                    .fold(0.0, f64::max);
                let rel_gain = (cost - trial_cost) / cost.max(1e-300);
                p = trial;
                r = trial_r;
                cost = trial_cost;
                lambda = (lambda * 0.1).max(1e-12);
                if let Some(obs) = observer.as_deref_mut() {
                    obs(&p);
                }
                improved = true;
                if rel_gain < options.ftol || step < options.xtol {
                    return finish(p, cost, iterations, &jtj, m);
                }
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            // Stuck: either converged or the damping loop failed to find
            // a downhill step.
            return finish(p, cost, iterations, &jtj, m);
        }
    }
    finish(p, cost, iterations, &jtj, m)
}

fn finish(
    p: Vec<f64>,
    sse: f64,
    iterations: usize,
    jtj: &DMatrix<f64>,
    m: usize,
) -> Result<LmOutput, EngineError> {
    let n = p.len();
    let covariance = jtj.clone().try_inverse().map(|inv| {
        let dof = m.saturating_sub(n).max(1) as f64;
        inv * (sse / dof)
    });
    Ok(LmOutput {
        p,
        covariance,
        sse,
        iterations,
    })
}

/// Central-difference jacobian, one column per parameter, in parallel.
fn numeric_jacobian(
    residuals: ResidualFn<'_>,
    p: &[f64],
    r0: &DVector<f64>,
) -> Result<DMatrix<f64>, EngineError> {
    let n = p.len();
    let m = r0.len();
    let columns: Vec<Result<DVector<f64>, EngineError>> = (0..n)
        .into_par_iter()
        .map(|k| {
            let h = (p[k].abs().max(1.0)) * 1e-7;
            let mut hi = p.to_vec();
            let mut lo = p.to_vec();
            hi[k] += h;
            lo[k] -= h;
            let r_hi = residuals(&hi)?;
            let r_lo = residuals(&lo)?;
            Ok((r_hi - r_lo) / (2.0 * h))
        })
        .collect();

    let mut j = DMatrix::zeros(m, n);
    for (k, column) in columns.into_iter().enumerate() {
        j.set_column(k, &column?);
    }
    Ok(j)
}

/// Central-difference Hessian of a scalar function, used for
/// maximum-likelihood standard errors.
pub fn numeric_hessian(
    f: &(dyn Fn(&[f64]) -> Result<f64, EngineError> + Sync),
    p: &[f64],
) -> Result<DMatrix<f64>, EngineError> {
    let n = p.len();
    let mut h = DMatrix::zeros(n, n);
    let steps: Vec<f64> = p.iter().map(|&v| v.abs().max(1.0) * 1e-4).collect();
    let f0 = f(p)?;
    for i in 0..n {
        for j in i..n {
            let (hi, hj) = (steps[i], steps[j]);
            let value = if i == j {
                let mut up = p.to_vec();
                let mut dn = p.to_vec();
                up[i] += hi;
                dn[i] -= hi;
                (f(&up)? - 2.0 * f0 + f(&dn)?) / (hi * hi)
            } else {
                let mut pp = p.to_vec();
                let mut pm = p.to_vec();
                let mut mp = p.to_vec();
                let mut mm = p.to_vec();
                pp[i] += hi;
                pp[j] += hj;
                pm[i] += hi;
                pm[j] -= hj;
                mp[i] -= hi;
                mp[j] += hj;
                mm[i] -= hi;
                mm[j] -= hj;
                (f(&pp)? - f(&pm)? - f(&mp)? + f(&mm)?) / (4.0 * hi * hj)
            };
            h[(i, j)] = value;
            h[(j, i)] = value;
        }
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp_decay_residuals(p: &[f64], x: &[f64], y: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            x.len(),
            x.iter()
                .zip(y)
                .map(|(&xi, &yi)| p[0] * (-xi / p[1]).exp() - yi),
        )
    }

    #[test]
    fn recovers_exponential_parameters_without_jacobian() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 3.0 * (-xi / 1.5).exp()).collect();
        let res = move |p: &[f64]| -> Result<DVector<f64>, EngineError> {
            Ok(exp_decay_residuals(p, &x, &y))
        };

        let out = levenberg_marquardt(
            &res,
            None,
            &[1.0, 1.0],
            None,
            &LmOptions::default(),
            None,
        )
        .unwrap();
        assert!((out.p[0] - 3.0).abs() < 1e-5, "a = {}", out.p[0]);
        assert!((out.p[1] - 1.5).abs() < 1e-5, "tau = {}", out.p[1]);
        assert!(out.sse < 1e-10);
        assert!(out.covariance.is_some());
    }

    #[test]
    fn bounds_are_respected() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 5.0 * xi).collect();
        let res = move |p: &[f64]| -> Result<DVector<f64>, EngineError> {
            Ok(DVector::from_iterator(
                x.len(),
                x.iter().zip(&y).map(|(&xi, &yi)| p[0] * xi - yi),
            ))
        };
        let bounds = [Bound {
            lower: None,
            upper: Some(4.0),
        }];
        let out = levenberg_marquardt(
            &res,
            None,
            &[1.0],
            Some(&bounds),
            &LmOptions::default(),
            None,
        )
        .unwrap();
        assert!((out.p[0] - 4.0).abs() < 1e-8, "slope = {}", out.p[0]);
    }

    #[test]
    fn observer_sees_accepted_updates() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.0 * xi + 1.0).collect();
        let res = move |p: &[f64]| -> Result<DVector<f64>, EngineError> {
            Ok(DVector::from_iterator(
                x.len(),
                x.iter().zip(&y).map(|(&xi, &yi)| p[0] * xi + p[1] - yi),
            ))
        };
        let mut seen = 0usize;
        let mut observer = |_p: &[f64]| seen += 1;
        levenberg_marquardt(
            &res,
            None,
            &[0.0, 0.0],
            None,
            &LmOptions::default(),
            Some(&mut observer),
        )
        .unwrap();
        assert!(seen > 0);
    }

    #[test]
    fn hessian_of_quadratic_is_exact() {
        let f = |p: &[f64]| Ok(2.0 * p[0] * p[0] + 3.0 * p[1] * p[1] + p[0] * p[1]);
        let h = numeric_hessian(&f, &[0.3, -0.2]).unwrap();
        assert!((h[(0, 0)] - 4.0).abs() < 1e-3);
        assert!((h[(1, 1)] - 6.0).abs() < 1e-3);
        assert!((h[(0, 1)] - 1.0).abs() < 1e-3);
    }
}
