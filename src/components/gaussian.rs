//! Gaussian peak shape.
//!
//! `f(x) = A * exp(-(x - centre)^2 / (2 sigma^2))`

use crate::model::component::ComponentShape;
use crate::model::parameter::Parameter;

pub struct Gaussian {
    pub a: f64,
    pub centre: f64,
    pub sigma: f64,
}

impl Default for Gaussian {
    fn default() -> Self {
        Self {
            a: 1.0,
            centre: 0.0,
            sigma: 1.0,
        }
    }
}

impl Gaussian {
    pub fn new(a: f64, centre: f64, sigma: f64) -> Self {
        Self { a, centre, sigma }
    }
}

impl ComponentShape for Gaussian {
    fn id_name(&self) -> &'static str {
        "gaussian"
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut a = Parameter::new("a", self.a);
        a.bmin = Some(0.0);
        let centre = Parameter::new("centre", self.centre);
        let mut sigma = Parameter::new("sigma", self.sigma);
        sigma.bmin = Some(0.0);
        vec![a, centre, sigma]
    }

    fn function(&self, params: &[f64], axis: &[f64], out: &mut [f64]) {
        let (a, centre, sigma) = (params[0], params[1], params[2]);
        let denom = 2.0 * sigma * sigma;
        for (o, &x) in out.iter_mut().zip(axis) {
            let d = x - centre;
            *o = a * (-d * d / denom).exp();
        }
    }

    fn has_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, params: &[f64], axis: &[f64], k: usize) -> Option<Vec<f64>> {
        let (a, centre, sigma) = (params[0], params[1], params[2]);
        let denom = 2.0 * sigma * sigma;
        let grad = axis
            .iter()
            .map(|&x| {
                let d = x - centre;
                let e = (-d * d / denom).exp();
                match k {
                    0 => e,
                    1 => a * d / (sigma * sigma) * e,
                    2 => a * d * d / (sigma * sigma * sigma) * e,
                    _ => unreachable!("gaussian has 3 parameter elements"),
                }
            })
            .collect();
        Some(grad)
    }

    /// Moment-based estimate over `i1..=i2`: centroid for the centre,
    /// second moment for sigma, data maximum for the amplitude.
    fn estimate_parameters(
        &self,
        data: &[f64],
        axis: &[f64],
        i1: usize,
        i2: usize,
    ) -> Option<Vec<f64>> {
        if i2 >= axis.len() || i1 > i2 {
            return None;
        }
        let d = &data[i1..=i2];
        let x = &axis[i1..=i2];
        let total: f64 = d.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return None;
        }
        let centre: f64 = d.iter().zip(x).map(|(&w, &xi)| w * xi).sum::<f64>() / total;
        let var: f64 = d
            .iter()
            .zip(x)
            .map(|(&w, &xi)| w * (xi - centre) * (xi - centre))
            .sum::<f64>()
            / total;
        if !(var.is_finite() && var > 0.0) {
            return None;
        }
        let a = d.iter().cloned().fold(f64::MIN, f64::max);
        Some(vec![a, centre, var.sqrt()])
    }
}
