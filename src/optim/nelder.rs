//! Nelder–Mead downhill simplex.
//!
//! Gradient-free minimization of a scalar cost; the backend behind the
//! `fmin` fitter and the only path supporting the Poisson
//! maximum-likelihood objective.

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct NelderOptions {
    pub max_iter: usize,
    /// Convergence on the spread of cost values across the simplex.
    pub ftol: f64,
    /// Convergence on the simplex extent.
    pub xtol: f64,
}

impl Default for NelderOptions {
    fn default() -> Self {
        Self {
            max_iter: 2000,
            ftol: 1e-10,
            xtol: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NelderOutput {
    pub p: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
}

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;

pub fn nelder_mead(
    cost: &(dyn Fn(&[f64]) -> Result<f64, EngineError> + Sync),
    p0: &[f64],
    options: &NelderOptions,
    mut observer: Option<&mut dyn FnMut(&[f64])>,
) -> Result<NelderOutput, EngineError> {
    let n = p0.len();
    if n == 0 {
        return Err(EngineError::fit("Nothing to fit: no free parameters."));
    }

    // Initial simplex: p0 plus one vertex perturbed along each dimension.
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(p0.to_vec());
    for k in 0..n {
        let mut v = p0.to_vec();
        v[k] += if v[k] != 0.0 { 0.05 * v[k] } else { 0.00025 };
        simplex.push(v);
    }
    let mut costs: Vec<f64> = simplex
        .iter()
        .map(|v| cost(v))
        .collect::<Result<_, _>>()?;
    if costs.iter().any(|c| !c.is_finite()) {
        return Err(EngineError::fit(
            "Cost is not finite at the starting simplex.",
        ));
    }

    let mut iterations = 0;
    for _ in 0..options.max_iter {
        iterations += 1;

        // Order vertices by cost.
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| costs[a].total_cmp(&costs[b]));
        let best = order[0];
        let worst = order[n];
        let second_worst = order[n - 1];

        let spread = costs[worst] - costs[best];
        let extent: f64 = (0..n)
            .map(|k| {
                simplex
                    .iter()
                    .map(|v| v[k])
                    .fold(f64::NEG_INFINITY, f64::max)
                    - simplex.iter().map(|v| v[k]).fold(f64::INFINITY, f64::min)
            })
            .fold(0.0, f64::max);
        if spread.abs() < options.ftol && extent < options.xtol {
            break;
        }

        // Centroid of all vertices but the worst.
        let mut centroid = vec![0.0; n];
        for (i, v) in simplex.iter().enumerate() {
            if i == worst {
                continue;
            }
            for k in 0..n {
                centroid[k] += v[k] / n as f64;
            }
        }

        let point_at = |coef: f64| -> Vec<f64> {
            (0..n)
                .map(|k| centroid[k] + coef * (centroid[k] - simplex[worst][k]))
                .collect()
        };

        let reflected = point_at(REFLECT);
        let f_reflected = cost(&reflected)?;

        if f_reflected < costs[best] {
            let expanded = point_at(EXPAND);
            let f_expanded = cost(&expanded)?;
            if f_expanded < f_reflected {
                simplex[worst] = expanded;
                costs[worst] = f_expanded;
            } else {
                simplex[worst] = reflected;
                costs[worst] = f_reflected;
            }
            if let Some(obs) = observer.as_deref_mut() {
                obs(&simplex[worst]);
            }
            continue;
        }

        if f_reflected < costs[second_worst] {
            simplex[worst] = reflected;
            costs[worst] = f_reflected;
            if let Some(obs) = observer.as_deref_mut() {
                obs(&simplex[worst]);
            }
            continue;
        }

        let contracted = point_at(-CONTRACT);
        let f_contracted = cost(&contracted)?;
        if f_contracted < costs[worst] {
            simplex[worst] = contracted;
            costs[worst] = f_contracted;
            if let Some(obs) = observer.as_deref_mut() {
                obs(&simplex[worst]);
            }
            continue;
        }

        // Shrink towards the best vertex.
        let best_vertex = simplex[best].clone();
        for (i, v) in simplex.iter_mut().enumerate() {
            if i == best {
                continue;
            }
            for k in 0..n {
                v[k] = best_vertex[k] + SHRINK * (v[k] - best_vertex[k]);
            }
            costs[i] = cost(v)?;
        }
    }

    let (best, &best_cost) = costs
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .expect("simplex is non-empty");
    Ok(NelderOutput {
        p: simplex[best].clone(),
        cost: best_cost,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimizes_rosenbrock() {
        let f = |p: &[f64]| -> Result<f64, EngineError> {
            Ok((1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2))
        };
        let out = nelder_mead(&f, &[-1.2, 1.0], &NelderOptions::default(), None).unwrap();
        assert!((out.p[0] - 1.0).abs() < 1e-3, "x = {}", out.p[0]);
        assert!((out.p[1] - 1.0).abs() < 1e-3, "y = {}", out.p[1]);
    }

    #[test]
    fn minimizes_quadratic_bowl() {
        let f = |p: &[f64]| -> Result<f64, EngineError> {
            Ok((p[0] - 3.0).powi(2) + (p[1] + 2.0).powi(2) + 1.0)
        };
        let out = nelder_mead(&f, &[0.0, 0.0], &NelderOptions::default(), None).unwrap();
        assert!((out.p[0] - 3.0).abs() < 1e-4);
        assert!((out.p[1] + 2.0).abs() < 1e-4);
        assert!((out.cost - 1.0).abs() < 1e-8);
    }
}
