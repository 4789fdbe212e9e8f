//! Constant offset shape.
//!
//! Carries no analytic gradient on purpose: fits that request `grad` with
//! an offset in the model exercise the numeric-jacobian fallback.

use crate::model::component::ComponentShape;
use crate::model::parameter::Parameter;

pub struct Offset {
    pub offset: f64,
}

impl Default for Offset {
    fn default() -> Self {
        Self { offset: 0.0 }
    }
}

impl ComponentShape for Offset {
    fn id_name(&self) -> &'static str {
        "offset"
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![Parameter::new("offset", self.offset)]
    }

    fn function(&self, params: &[f64], _axis: &[f64], out: &mut [f64]) {
        out.fill(params[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_everywhere() {
        let o = Offset { offset: 3.5 };
        let mut out = vec![0.0; 4];
        o.function(&[3.5], &[0.0, 1.0, 2.0, 3.0], &mut out);
        assert_eq!(out, vec![3.5; 4]);
        assert!(!o.has_gradient());
        assert!(o.gradient(&[3.5], &[0.0], 0).is_none());
    }
}
