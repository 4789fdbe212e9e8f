//! Model components: a parametric shape plus its owned parameters.
//!
//! The shape contract is deliberately small: a pure function over a flat
//! parameter-element vector, an optional analytic gradient per element, and
//! an optional parameter estimator. The fit engine tolerates absent
//! capabilities by falling back to numeric gradients or skipping
//! estimation.

use crate::error::EngineError;
use crate::model::parameter::Parameter;

/// Pure evaluation contract every component shape satisfies.
///
/// `params` is the component's parameters flattened in declaration order
/// (array-valued parameters contribute their elements in place), matching
/// the packing the model performs.
pub trait ComponentShape: Send + Sync {
    /// Stable shape identifier used in reports and persistence.
    fn id_name(&self) -> &'static str;

    /// Declaration-ordered parameters with their default values, bounds
    /// and free/fixed flags.
    fn parameters(&self) -> Vec<Parameter>;

    /// Evaluate the shape on `axis` into `out` (`out.len() == axis.len()`).
    fn function(&self, params: &[f64], axis: &[f64], out: &mut [f64]);

    /// Analytic partial derivative with respect to flat parameter element
    /// `k`, or None when no analytic gradient is available.
    fn gradient(&self, _params: &[f64], _axis: &[f64], _k: usize) -> Option<Vec<f64>> {
        None
    }

    fn has_gradient(&self) -> bool {
        false
    }

    /// Estimate starting parameter values from `data` over the channel
    /// range `i1..=i2`. None when the shape has no estimator.
    fn estimate_parameters(
        &self,
        _data: &[f64],
        _axis: &[f64],
        _i1: usize,
        _i2: usize,
    ) -> Option<Vec<f64>> {
        None
    }
}

/// One named, additive contribution to a model.
pub struct Component {
    pub name: String,
    shape: Box<dyn ComponentShape>,
    parameters: Vec<Parameter>,
    pub active: bool,
    pub convolved: bool,
}

impl Component {
    pub fn new(name: impl Into<String>, shape: Box<dyn ComponentShape>) -> Self {
        let parameters = shape.parameters();
        Self {
            name: name.into(),
            shape,
            parameters,
            active: true,
            convolved: false,
        }
    }

    pub fn shape(&self) -> &dyn ComponentShape {
        self.shape.as_ref()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// Total flat parameter elements of this component.
    pub fn n_elements(&self) -> usize {
        self.parameters.iter().map(|p| p.n_elements()).sum()
    }

    /// Flat elements contributed by free (non-twinned) parameters; the
    /// width of this component's slice in the packed vector.
    pub fn n_free_elements(&self) -> usize {
        self.parameters
            .iter()
            .filter(|p| p.is_free_for_fit())
            .map(|p| p.n_elements())
            .sum()
    }

    /// Offset of parameter `pi` within the flat element vector.
    pub fn flat_offset(&self, pi: usize) -> usize {
        self.parameters[..pi].iter().map(|p| p.n_elements()).sum()
    }

    /// Raw flat element values in declaration order. Twin relations are
    /// resolved by the model, not here.
    pub fn flat_values(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.n_elements());
        for p in &self.parameters {
            out.extend_from_slice(p.value());
        }
        out
    }

    /// Bulk-assign a flat slice of values (the inverse of packing).
    ///
    /// With `only_free`, values map onto free parameters in declaration
    /// order; otherwise onto every parameter. `std` follows the same
    /// layout when present.
    pub fn charge(
        &mut self,
        values: &[f64],
        std: Option<&[f64]>,
        only_free: bool,
    ) -> Result<(), EngineError> {
        let expected: usize = if only_free {
            self.n_free_elements()
        } else {
            self.n_elements()
        };
        if values.len() != expected {
            return Err(EngineError::usage(format!(
                "Component '{}' charge expected {} values, got {}.",
                self.name,
                expected,
                values.len()
            )));
        }
        let mut cursor = 0;
        for p in &mut self.parameters {
            if only_free && !p.is_free_for_fit() {
                continue;
            }
            let n = p.n_elements();
            p.assign(&values[cursor..cursor + n]);
            p.set_std(std.map(|s| s[cursor..cursor + n].to_vec()));
            cursor += n;
        }
        Ok(())
    }

    /// Allocate per-pixel maps for every parameter. Called by the model at
    /// append time, once the navigation shape is known.
    pub fn create_arrays(&mut self, nav_size: usize) {
        for p in &mut self.parameters {
            p.create_map(nav_size);
        }
    }

    pub fn store_current_parameters_in_map(&mut self, nav_size: usize, index: usize) {
        for p in &mut self.parameters {
            p.store_current_parameters_in_map(nav_size, index);
        }
    }

    pub fn charge_value_from_map(&mut self, index: usize, only_fixed: bool) {
        for p in &mut self.parameters {
            p.charge_value_from_map(index, only_fixed);
        }
    }

    pub fn set_ext_bounded(&mut self, enabled: bool) {
        for p in &mut self.parameters {
            p.set_ext_bounded(enabled);
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("shape", &self.shape.id_name())
            .field("active", &self.active)
            .field("convolved", &self.convolved)
            .field("parameters", &self.parameters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Line;

    impl ComponentShape for Line {
        fn id_name(&self) -> &'static str {
            "line"
        }

        fn parameters(&self) -> Vec<Parameter> {
            vec![Parameter::new("slope", 1.0), Parameter::new("intercept", 0.0)]
        }

        fn function(&self, params: &[f64], axis: &[f64], out: &mut [f64]) {
            for (o, &x) in out.iter_mut().zip(axis) {
                *o = params[0] * x + params[1];
            }
        }
    }

    #[test]
    fn charge_only_free_skips_fixed_parameters() {
        let mut c = Component::new("l", Box::new(Line));
        c.parameter_mut("intercept").unwrap().free = false;
        assert_eq!(c.n_free_elements(), 1);

        c.charge(&[3.0], None, true).unwrap();
        assert_eq!(c.parameter("slope").unwrap().scalar(), 3.0);
        assert_eq!(c.parameter("intercept").unwrap().scalar(), 0.0);

        assert!(c.charge(&[1.0, 2.0], None, true).is_err());
        c.charge(&[4.0, 5.0], None, false).unwrap();
        assert_eq!(c.parameter("intercept").unwrap().scalar(), 5.0);
    }

    #[test]
    fn flat_values_follow_declaration_order() {
        let mut c = Component::new("l", Box::new(Line));
        c.parameter_mut("slope").unwrap().set_scalar(2.5);
        assert_eq!(c.flat_values(), vec![2.5, 0.0]);
        assert_eq!(c.flat_offset(1), 1);
    }
}
