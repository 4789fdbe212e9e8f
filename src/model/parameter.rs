//! Tunable parameters: value, bounds, twin relation, per-pixel map.
//!
//! A parameter is owned by exactly one component. Twins are a non-owning,
//! id-based relation resolved through the model, so two parameters can
//! reference each other without forming an ownership cycle.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

static NEXT_PARAMETER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, stable parameter identity used for twin relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterId(u64);

impl ParameterId {
    fn fresh() -> Self {
        ParameterId(NEXT_PARAMETER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Affine twin relation: `value = scale * source + offset`.
///
/// The gradient chain rule multiplies the twinned parameter's gradient
/// contribution by `scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwinRelation {
    pub scale: f64,
    pub offset: f64,
}

impl Default for TwinRelation {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
        }
    }
}

impl TwinRelation {
    pub fn apply(&self, source: f64) -> f64 {
        self.scale * source + self.offset
    }
}

/// Per-pixel storage for one parameter.
///
/// Three lanes per pixel: the stored values (`n_elements` each), the
/// corresponding standard errors (None = unknown), and an is-set flag so
/// never-fitted pixels are distinguishable from fitted ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMap {
    n_elements: usize,
    values: Vec<f64>,
    std: Vec<Option<f64>>,
    is_set: Vec<bool>,
}

impl ParameterMap {
    pub fn new(nav_size: usize, n_elements: usize) -> Self {
        Self {
            n_elements,
            values: vec![0.0; nav_size * n_elements],
            std: vec![None; nav_size * n_elements],
            is_set: vec![false; nav_size],
        }
    }

    pub fn nav_size(&self) -> usize {
        self.is_set.len()
    }

    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.is_set[index]
    }

    pub fn values_at(&self, index: usize) -> &[f64] {
        &self.values[index * self.n_elements..(index + 1) * self.n_elements]
    }

    pub fn std_at(&self, index: usize) -> &[Option<f64>] {
        &self.std[index * self.n_elements..(index + 1) * self.n_elements]
    }

    pub fn store(&mut self, index: usize, values: &[f64], std: Option<&[f64]>) {
        let n = self.n_elements;
        self.values[index * n..(index + 1) * n].copy_from_slice(values);
        for k in 0..n {
            self.std[index * n + k] = std.map(|s| s[k]);
        }
        self.is_set[index] = true;
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    id: ParameterId,
    pub name: String,
    value: Vec<f64>,
    pub free: bool,
    pub bmin: Option<f64>,
    pub bmax: Option<f64>,
    twin: Option<(ParameterId, TwinRelation)>,
    std: Option<Vec<f64>>,
    ext_bounded: bool,
    map: Option<ParameterMap>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self::new_array(name, vec![value])
    }

    /// Array-valued parameter; the element count is fixed for its lifetime.
    pub fn new_array(name: impl Into<String>, value: Vec<f64>) -> Self {
        assert!(!value.is_empty(), "a parameter holds at least one element");
        Self {
            id: ParameterId::fresh(),
            name: name.into(),
            value,
            free: true,
            bmin: None,
            bmax: None,
            twin: None,
            std: None,
            ext_bounded: false,
            map: None,
        }
    }

    pub fn id(&self) -> ParameterId {
        self.id
    }

    pub fn n_elements(&self) -> usize {
        self.value.len()
    }

    /// Raw stored value. Twin resolution happens in the model; use
    /// `Model::parameter_value` to read through twin relations.
    pub fn value(&self) -> &[f64] {
        &self.value
    }

    pub fn scalar(&self) -> f64 {
        self.value[0]
    }

    pub fn set_scalar(&mut self, value: f64) {
        self.assign(&[value]);
    }

    /// Assign new values, clamping to bounds when ext-bounding is enabled.
    pub fn assign(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.value.len());
        for (slot, &v) in self.value.iter_mut().zip(values) {
            *slot = v;
        }
        if self.ext_bounded {
            self.clamp_to_bounds();
        }
    }

    pub fn clamp_to_bounds(&mut self) -> bool {
        let (bmin, bmax) = (self.bmin, self.bmax);
        let mut clamped = false;
        for v in &mut self.value {
            let mut w = *v;
            if let Some(lo) = bmin {
                w = w.max(lo);
            }
            if let Some(hi) = bmax {
                w = w.min(hi);
            }
            if w != *v {
                *v = w;
                clamped = true;
            }
        }
        clamped
    }

    pub fn ext_bounded(&self) -> bool {
        self.ext_bounded
    }

    pub fn set_ext_bounded(&mut self, enabled: bool) {
        self.ext_bounded = enabled;
    }

    pub fn twin(&self) -> Option<(ParameterId, TwinRelation)> {
        self.twin
    }

    pub fn set_twin(&mut self, source: ParameterId, relation: TwinRelation) {
        self.twin = Some((source, relation));
    }

    pub fn clear_twin(&mut self) {
        self.twin = None;
    }

    /// Free for fitting: free and not twinned. Twinned parameters are
    /// always derived, never packed.
    pub fn is_free_for_fit(&self) -> bool {
        self.free && self.twin.is_none()
    }

    /// Standard errors from the last fit, if the backend produced any.
    pub fn std(&self) -> Option<&[f64]> {
        self.std.as_deref()
    }

    pub fn set_std(&mut self, std: Option<Vec<f64>>) {
        if let Some(s) = &std {
            debug_assert_eq!(s.len(), self.value.len());
        }
        self.std = std;
    }

    pub fn map(&self) -> Option<&ParameterMap> {
        self.map.as_ref()
    }

    /// Allocate (or reallocate to a new navigation size) the per-pixel map.
    pub fn create_map(&mut self, nav_size: usize) {
        let needs_new = match &self.map {
            Some(map) => map.nav_size() != nav_size || map.n_elements() != self.value.len(),
            None => true,
        };
        if needs_new {
            self.map = Some(ParameterMap::new(nav_size, self.value.len()));
        }
    }

    /// Replace the map wholesale (persistence load path).
    pub fn set_map(&mut self, map: ParameterMap) -> Result<(), EngineError> {
        if map.n_elements() != self.value.len() {
            return Err(EngineError::usage(format!(
                "Loaded map for parameter '{}' has {} elements per pixel, expected {}.",
                self.name,
                map.n_elements(),
                self.value.len()
            )));
        }
        self.map = Some(map);
        Ok(())
    }

    /// Write the working value (and current std) into the map at `index`,
    /// allocating on first use.
    pub fn store_current_parameters_in_map(&mut self, nav_size: usize, index: usize) {
        self.create_map(nav_size);
        let std = self.std.clone();
        let values = self.value.clone();
        if let Some(map) = self.map.as_mut() {
            map.store(index, &values, std.as_deref());
        }
    }

    /// Load the working value from the map at `index`.
    ///
    /// Pixels never stored are left untouched. With `only_fixed`, a free
    /// parameter keeps its working value so warm starts survive navigation
    /// steps.
    pub fn charge_value_from_map(&mut self, index: usize, only_fixed: bool) {
        if only_fixed && self.free {
            return;
        }
        let Some(map) = &self.map else {
            return;
        };
        if !map.is_set(index) {
            return;
        }
        let values = map.values_at(index).to_vec();
        let std: Option<Vec<f64>> = map.std_at(index)
            .iter()
            .copied()
            .collect::<Option<Vec<f64>>>();
        self.value.copy_from_slice(&values);
        self.std = std;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Parameter::new("a", 0.0);
        let b = Parameter::new("b", 0.0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn ext_bounding_clamps_on_assign() {
        let mut p = Parameter::new("a", 0.0);
        p.bmin = Some(-1.0);
        p.bmax = Some(2.0);
        p.assign(&[5.0]);
        assert_eq!(p.scalar(), 5.0);
        p.set_ext_bounded(true);
        p.assign(&[5.0]);
        assert_eq!(p.scalar(), 2.0);
        p.assign(&[-3.0]);
        assert_eq!(p.scalar(), -1.0);
    }

    #[test]
    fn twinned_parameter_is_not_free_for_fit() {
        let source = Parameter::new("src", 1.0);
        let mut p = Parameter::new("a", 0.0);
        assert!(p.is_free_for_fit());
        p.set_twin(source.id(), TwinRelation::default());
        assert!(!p.is_free_for_fit());
    }

    #[test]
    fn map_store_and_charge_round_trip() {
        let mut p = Parameter::new("a", 1.5);
        p.set_std(Some(vec![0.1]));
        p.store_current_parameters_in_map(4, 2);

        p.assign(&[9.0]);
        p.set_std(None);
        p.charge_value_from_map(2, false);
        assert_eq!(p.scalar(), 1.5);
        assert_eq!(p.std(), Some(&[0.1][..]));

        // Unset pixels leave the working value alone.
        p.assign(&[9.0]);
        p.charge_value_from_map(3, false);
        assert_eq!(p.scalar(), 9.0);
    }

    #[test]
    fn only_fixed_charge_preserves_free_parameters() {
        let mut p = Parameter::new("a", 1.0);
        p.store_current_parameters_in_map(2, 0);
        p.assign(&[7.0]);
        p.charge_value_from_map(0, true);
        assert_eq!(p.scalar(), 7.0);
        p.free = false;
        p.charge_value_from_map(0, true);
        assert_eq!(p.scalar(), 1.0);
    }
}
