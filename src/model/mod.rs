//! Model: an ordered sequence of components bound to one dataset.
//!
//! The model owns the component list (insertion order defines both the
//! summation order and the packed parameter-vector order), the signal-range
//! mask, the optional low-loss spectrum driving convolved mode, and the
//! packing/unpacking protocol every optimizer adapter consumes.

pub mod component;
pub mod fit;
pub mod parameter;

pub use component::{Component, ComponentShape};
pub use fit::{Autosave, FitMethod, FitOptions, FitOutput, MultifitOutput, Weights};
pub use parameter::{Parameter, ParameterId, ParameterMap, TwinRelation};

use std::sync::Mutex;

use nalgebra::DMatrix;

use crate::error::EngineError;
use crate::math::valid_convolve;
use crate::optim::Fitter;
use crate::progress::Progress;
use crate::signal::{generate_axis, Spectrum};

/// Fitter used when a fit request does not name one. Held per model
/// instance, never a process-global.
pub const DEFAULT_FITTER: Fitter = Fitter::Leastsq;

/// Interactive range-selection collaborator. `select` blocks until the
/// user confirms a `(left, right)` range in axis units; None means the
/// selection was cancelled.
pub trait RangeSelector {
    fn select(&mut self) -> Option<(f64, f64)>;
}

type IterationObserver = Box<dyn FnMut(&[f64]) + Send>;
type StructureObserver = Box<dyn FnMut() + Send>;

/// One free parameter's slice of the packed vector.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PackEntry {
    /// Component index in the model.
    pub ci: usize,
    /// Parameter index within the component.
    pub pi: usize,
    /// Element offset of the parameter within the component's flat vector.
    pub flat_offset: usize,
    /// Flat element count of the parameter.
    pub n: usize,
}

pub struct Model {
    spectrum: Spectrum,
    low_loss: Option<Spectrum>,
    convolution_axis: Option<Vec<f64>>,
    convolved: bool,
    components: Vec<Component>,
    channel_switches: Vec<bool>,
    backup_channel_switches: Option<Vec<bool>>,
    pub default_fitter: Fitter,
    p0: Vec<f64>,
    p_std: Option<Vec<f64>>,
    pub fit_output: Option<FitOutput>,
    structure_observer: Option<Mutex<StructureObserver>>,
    iteration_observer: Option<Mutex<IterationObserver>>,
}

impl Model {
    pub fn new(spectrum: Spectrum) -> Self {
        let n = spectrum.axis().size;
        Self {
            spectrum,
            low_loss: None,
            convolution_axis: None,
            convolved: false,
            components: Vec::new(),
            channel_switches: vec![true; n],
            backup_channel_switches: None,
            default_fitter: DEFAULT_FITTER,
            p0: Vec::new(),
            p_std: None,
            fit_output: None,
            structure_observer: None,
            iteration_observer: None,
        }
    }

    pub fn spectrum(&self) -> &Spectrum {
        &self.spectrum
    }

    pub fn spectrum_mut(&mut self) -> &mut Spectrum {
        &mut self.spectrum
    }

    pub fn low_loss(&self) -> Option<&Spectrum> {
        self.low_loss.as_ref()
    }

    pub fn is_convolved(&self) -> bool {
        self.convolved
    }

    pub fn convolution_axis(&self) -> Option<&[f64]> {
        self.convolution_axis.as_deref()
    }

    /// Bind (or clear) the low-loss spectrum. Binding validates the
    /// navigation shape at assignment time and switches the model into
    /// convolved mode by deriving the convolution axis.
    pub fn set_low_loss(&mut self, low_loss: Option<Spectrum>) -> Result<(), EngineError> {
        match low_loss {
            Some(ll) => {
                if ll.nav_shape() != self.spectrum.nav_shape() {
                    return Err(EngineError::usage(format!(
                        "The low-loss navigation shape {:?} does not match the spectrum navigation shape {:?}.",
                        ll.nav_shape(),
                        self.spectrum.nav_shape()
                    )));
                }
                self.convolution_axis = Some(self.derive_convolution_axis(&ll)?);
                self.low_loss = Some(ll);
                self.convolved = true;
            }
            None => {
                self.low_loss = None;
                self.convolution_axis = None;
                self.convolved = false;
            }
        }
        Ok(())
    }

    /// Extended axis over which convolved components are evaluated.
    ///
    /// Length = signal size + low-loss size - 1, positioned so the signal
    /// origin survives a "valid" convolution with the low-loss vector:
    /// the origin channel sits where the low-loss zero-energy channel
    /// will align it.
    fn derive_convolution_axis(&self, low_loss: &Spectrum) -> Result<Vec<f64>, EngineError> {
        let axis = self.spectrum.axis();
        let ll_axis = low_loss.axis();
        let zero = ll_axis.value_to_index(0.0).map_err(|_| {
            EngineError::usage(
                "The low-loss axis does not contain the zero-energy channel; cannot align the convolution axis.",
            )
        })?;
        let size = axis.size + ll_axis.size - 1;
        let origin_index = ll_axis.size - zero - 1;
        Ok(generate_axis(axis.offset, axis.scale, size, origin_index))
    }

    // Component container --------------------------------------------------

    /// Append a component. Appending takes ownership (a component belongs
    /// to exactly one model), allocates its per-pixel maps to this
    /// model's navigation shape, and fires the structure hook.
    pub fn append(&mut self, mut component: Component) {
        component.create_arrays(self.spectrum.nav_size());
        self.components.push(component);
        self.notify_structure_changed();
    }

    pub fn insert(&mut self, index: usize, mut component: Component) {
        component.create_arrays(self.spectrum.nav_size());
        self.components.insert(index, component);
        self.notify_structure_changed();
    }

    pub fn remove(&mut self, index: usize) -> Component {
        let component = self.components.remove(index);
        self.notify_structure_changed();
        component
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn component(&self, index: usize) -> &Component {
        &self.components[index]
    }

    pub fn component_mut(&mut self, index: usize) -> &mut Component {
        &mut self.components[index]
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub(crate) fn components_mut(&mut self) -> &mut [Component] {
        &mut self.components
    }

    pub fn component_by_name(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name == name)
    }

    /// Hook fired after every structural mutation of the component list.
    pub fn set_structure_observer(&mut self, observer: StructureObserver) {
        self.structure_observer = Some(Mutex::new(observer));
    }

    fn notify_structure_changed(&mut self) {
        if let Some(observer) = &self.structure_observer {
            if let Ok(mut f) = observer.lock() {
                f();
            }
        }
    }

    /// Observer invoked after each accepted parameter update during a
    /// fit. Opt-in; the default is no callback.
    pub fn set_iteration_observer(&mut self, observer: IterationObserver) {
        self.iteration_observer = Some(Mutex::new(observer));
    }

    pub fn clear_iteration_observer(&mut self) {
        self.iteration_observer = None;
    }

    pub(crate) fn take_iteration_observer(&mut self) -> Option<IterationObserver> {
        self.iteration_observer
            .take()
            .and_then(|m| m.into_inner().ok())
    }

    pub(crate) fn restore_iteration_observer(&mut self, observer: Option<IterationObserver>) {
        self.iteration_observer = observer.map(Mutex::new);
    }

    // Navigation ------------------------------------------------------------

    /// Move the current navigation coordinate, keeping the low-loss
    /// position in lock-step with the main spectrum.
    pub fn set_index(&mut self, index: usize) -> Result<(), EngineError> {
        self.spectrum.set_index(index)?;
        if let Some(ll) = &mut self.low_loss {
            ll.set_index(index)?;
        }
        Ok(())
    }

    /// Store every parameter's current value into its map at the current
    /// navigation coordinate. Twinned parameters store their resolved
    /// value, not the raw working value; a twin whose source cannot be
    /// resolved keeps its raw value.
    pub fn set(&mut self) {
        let nav_size = self.spectrum.nav_size();
        let index = self.spectrum.index();
        let mut resolved: Vec<(usize, usize, Vec<f64>)> = Vec::new();
        for (ci, component) in self.components.iter().enumerate() {
            for (pi, parameter) in component.parameters().iter().enumerate() {
                if parameter.twin().is_none() {
                    continue;
                }
                if let Ok(values) = self.resolve_value(ci, pi, 0) {
                    resolved.push((ci, pi, values));
                }
            }
        }
        for (ci, pi, values) in resolved {
            self.components[ci].parameters_mut()[pi].assign(&values);
        }
        for component in &mut self.components {
            component.store_current_parameters_in_map(nav_size, index);
        }
    }

    /// Enable or disable ext-bounding on every parameter. While enabled,
    /// assignments and trial evaluations clamp to the parameter bounds,
    /// so the optimizer's objective only ever sees in-bounds values.
    pub fn set_ext_bounding(&mut self, enabled: bool) {
        for component in &mut self.components {
            component.set_ext_bounded(enabled);
        }
    }

    /// Load parameter working values from the maps at the current
    /// navigation coordinate.
    pub fn charge(&mut self, only_fixed: bool) {
        let index = self.spectrum.index();
        for component in &mut self.components {
            component.charge_value_from_map(index, only_fixed);
        }
    }

    // Signal range ----------------------------------------------------------

    pub fn channel_switches(&self) -> &[bool] {
        &self.channel_switches
    }

    pub fn masked_channel_count(&self) -> usize {
        self.channel_switches.iter().filter(|&&s| s).count()
    }

    pub(crate) fn set_channel_switches(&mut self, switches: Vec<bool>) {
        debug_assert_eq!(switches.len(), self.channel_switches.len());
        self.channel_switches = switches;
    }

    /// Restrict fitting to the inclusive value range `[x1, x2]`. The
    /// previous mask is backed up and restorable.
    pub fn set_signal_range(&mut self, x1: f64, x2: f64) -> Result<(), EngineError> {
        let (i1, i2) = self.range_to_indices(x1, x2)?;
        self.backup_channel_switches = Some(self.channel_switches.clone());
        self.channel_switches.fill(false);
        self.channel_switches[i1..=i2].fill(true);
        Ok(())
    }

    /// Add the inclusive value range `[x1, x2]` to the fit range.
    pub fn add_signal_range(&mut self, x1: f64, x2: f64) -> Result<(), EngineError> {
        let (i1, i2) = self.range_to_indices(x1, x2)?;
        self.channel_switches[i1..=i2].fill(true);
        Ok(())
    }

    /// Exclude the inclusive value range `[x1, x2]` from the fit range.
    pub fn remove_signal_range(&mut self, x1: f64, x2: f64) -> Result<(), EngineError> {
        let (i1, i2) = self.range_to_indices(x1, x2)?;
        self.channel_switches[i1..=i2].fill(false);
        Ok(())
    }

    /// Use the full signal range again.
    pub fn reset_signal_range(&mut self) {
        self.channel_switches.fill(true);
    }

    /// Restore the mask backed up by the last `set_signal_range`.
    pub fn restore_signal_range(&mut self) {
        if let Some(backup) = self.backup_channel_switches.take() {
            self.channel_switches = backup;
        }
    }

    /// Drive the range selection through an interactive collaborator.
    /// Cancelled or empty (left == right) selections leave the model
    /// untouched.
    pub fn set_signal_range_interactive(
        &mut self,
        selector: &mut dyn RangeSelector,
    ) -> Result<(), EngineError> {
        let Some((left, right)) = selector.select() else {
            return Ok(());
        };
        if left == right {
            return Ok(());
        }
        self.set_signal_range(left, right)
    }

    fn range_to_indices(&self, x1: f64, x2: f64) -> Result<(usize, usize), EngineError> {
        let axis = self.spectrum.axis();
        let i1 = axis.value_to_index(x1.min(x2))?;
        let i2 = axis.value_to_index(x1.max(x2))?;
        // On a descending axis the smaller value maps to the larger index.
        Ok((i1.min(i2), i1.max(i2)))
    }

    fn masked_axis(&self) -> Vec<f64> {
        let axis = self.spectrum.axis();
        self.channel_switches
            .iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(i, _)| axis.value(i))
            .collect()
    }

    pub(crate) fn masked_slice(&self, full: &[f64]) -> Vec<f64> {
        full.iter()
            .zip(&self.channel_switches)
            .filter(|(_, &s)| s)
            .map(|(&v, _)| v)
            .collect()
    }

    // Parameter packing ------------------------------------------------------

    /// Packing table: the ordered free-parameter slices of every active
    /// component. This ordering is the single source of truth shared by
    /// `set_p0`, `charge_p0` and the jacobian builder.
    pub(crate) fn packing_table(&self) -> Vec<PackEntry> {
        let mut table = Vec::new();
        for (ci, component) in self.components.iter().enumerate() {
            if !component.active {
                continue;
            }
            for (pi, parameter) in component.parameters().iter().enumerate() {
                if !parameter.is_free_for_fit() {
                    continue;
                }
                table.push(PackEntry {
                    ci,
                    pi,
                    flat_offset: component.flat_offset(pi),
                    n: parameter.n_elements(),
                });
            }
        }
        table
    }

    /// Snapshot the packed free-parameter vector from the current values.
    pub fn set_p0(&mut self) {
        let mut p0 = Vec::new();
        for entry in self.packing_table() {
            let parameter = &self.components[entry.ci].parameters()[entry.pi];
            p0.extend_from_slice(parameter.value());
        }
        self.p0 = p0;
    }

    pub fn p0(&self) -> &[f64] {
        &self.p0
    }

    pub fn p_std(&self) -> Option<&[f64]> {
        self.p_std.as_deref()
    }

    /// Unpack `p` (and optional per-element standard errors) back into
    /// the free parameters of every active component, in packing order.
    pub fn charge_p0(&mut self, p: &[f64], p_std: Option<&[f64]>) -> Result<(), EngineError> {
        let expected: usize = self
            .components
            .iter()
            .filter(|c| c.active)
            .map(|c| c.n_free_elements())
            .sum();
        if p.len() != expected {
            return Err(EngineError::usage(format!(
                "Parameter vector length {} does not match the {} free elements of the active components.",
                p.len(),
                expected
            )));
        }
        let mut counter = 0;
        for component in &mut self.components {
            if !component.active {
                continue;
            }
            let n = component.n_free_elements();
            component.charge(
                &p[counter..counter + n],
                p_std.map(|s| &s[counter..counter + n]),
                true,
            )?;
            counter += n;
        }
        self.p0 = p.to_vec();
        self.p_std = p_std.map(|s| s.to_vec());
        Ok(())
    }

    // Twin resolution --------------------------------------------------------

    /// Locate a parameter by its stable id.
    pub fn find_parameter(&self, id: ParameterId) -> Option<(usize, usize)> {
        for (ci, component) in self.components.iter().enumerate() {
            for (pi, parameter) in component.parameters().iter().enumerate() {
                if parameter.id() == id {
                    return Some((ci, pi));
                }
            }
        }
        None
    }

    /// Twin `target` to `source`: the target's value becomes derived and
    /// the target leaves the free-parameter vector.
    pub fn set_twin(
        &mut self,
        target: (usize, usize),
        source: (usize, usize),
        relation: TwinRelation,
    ) -> Result<(), EngineError> {
        if target == source {
            return Err(EngineError::usage("A parameter cannot twin itself."));
        }
        let source_id = self.components[source.0].parameters()[source.1].id();
        self.components[target.0].parameters_mut()[target.1].set_twin(source_id, relation);
        Ok(())
    }

    /// Read a parameter's value through its twin relation, following
    /// chains. Cycles and dangling twin sources are errors.
    pub fn parameter_value(&self, ci: usize, pi: usize) -> Result<Vec<f64>, EngineError> {
        self.resolve_value(ci, pi, 0)
    }

    fn resolve_value(&self, ci: usize, pi: usize, depth: usize) -> Result<Vec<f64>, EngineError> {
        const MAX_TWIN_DEPTH: usize = 64;
        if depth > MAX_TWIN_DEPTH {
            return Err(EngineError::usage(
                "Twin relations form a cycle or an overly deep chain.",
            ));
        }
        let parameter = &self.components[ci].parameters()[pi];
        match parameter.twin() {
            None => Ok(parameter.value().to_vec()),
            Some((source_id, relation)) => {
                let (sci, spi) = self.find_parameter(source_id).ok_or_else(|| {
                    EngineError::usage(format!(
                        "Twin source of parameter '{}' is not in this model.",
                        parameter.name
                    ))
                })?;
                let source = self.resolve_value(sci, spi, depth + 1)?;
                Ok(source.iter().map(|&v| relation.apply(v)).collect())
            }
        }
    }

    // Evaluation -------------------------------------------------------------

    /// Flat per-component parameter-element vectors for one evaluation.
    ///
    /// When `p` is given, free elements of active components are overridden
    /// by their packed slices first; twin relations are then resolved
    /// against those trial values, so twins track in-flight optimizer
    /// trials, not stale stored values.
    fn trial_values(&self, p: Option<&[f64]>) -> Result<Vec<Vec<f64>>, EngineError> {
        let mut trial: Vec<Vec<f64>> = self.components.iter().map(|c| c.flat_values()).collect();

        if let Some(p) = p {
            let mut counter = 0;
            for (ci, component) in self.components.iter().enumerate() {
                if !component.active {
                    continue;
                }
                for (pi, parameter) in component.parameters().iter().enumerate() {
                    if !parameter.is_free_for_fit() {
                        continue;
                    }
                    let offset = component.flat_offset(pi);
                    let n = parameter.n_elements();
                    if counter + n > p.len() {
                        return Err(EngineError::usage(format!(
                            "Parameter vector too short: needed more than {} elements.",
                            p.len()
                        )));
                    }
                    trial[ci][offset..offset + n].copy_from_slice(&p[counter..counter + n]);
                    if parameter.ext_bounded() {
                        for v in &mut trial[ci][offset..offset + n] {
                            if let Some(lo) = parameter.bmin {
                                *v = v.max(lo);
                            }
                            if let Some(hi) = parameter.bmax {
                                *v = v.min(hi);
                            }
                        }
                    }
                    counter += n;
                }
            }
        }

        // Resolve twins against the trial values.
        for ci in 0..self.components.len() {
            for (pi, parameter) in self.components[ci].parameters().iter().enumerate() {
                if parameter.twin().is_none() {
                    continue;
                }
                let resolved = self.resolve_trial(&trial, ci, pi, 0)?;
                let offset = self.components[ci].flat_offset(pi);
                let slot = &mut trial[ci];
                // One borrow at a time: copy out, then write.
                for (k, v) in resolved.into_iter().enumerate() {
                    slot[offset + k] = v;
                }
            }
        }
        Ok(trial)
    }

    fn resolve_trial(
        &self,
        trial: &[Vec<f64>],
        ci: usize,
        pi: usize,
        depth: usize,
    ) -> Result<Vec<f64>, EngineError> {
        const MAX_TWIN_DEPTH: usize = 64;
        if depth > MAX_TWIN_DEPTH {
            return Err(EngineError::usage(
                "Twin relations form a cycle or an overly deep chain.",
            ));
        }
        let component = &self.components[ci];
        let parameter = &component.parameters()[pi];
        let offset = component.flat_offset(pi);
        let n = parameter.n_elements();
        match parameter.twin() {
            None => Ok(trial[ci][offset..offset + n].to_vec()),
            Some((source_id, relation)) => {
                let (sci, spi) = self.find_parameter(source_id).ok_or_else(|| {
                    EngineError::usage(format!(
                        "Twin source of parameter '{}' is not in this model.",
                        parameter.name
                    ))
                })?;
                let source = self.resolve_trial(trial, sci, spi, depth + 1)?;
                Ok(source.iter().map(|&v| relation.apply(v)).collect())
            }
        }
    }

    /// Evaluate the model at the current navigation coordinate over the
    /// masked signal axis.
    ///
    /// In convolved mode (unless `non_convolved`), components flagged
    /// `convolved` are summed over the convolution axis and convolved
    /// with the low-loss spectrum before being added to the rest.
    pub fn evaluate(&self, non_convolved: bool, only_active: bool) -> Result<Vec<f64>, EngineError> {
        let trial = self.trial_values(None)?;
        self.eval_with(&trial, non_convolved, only_active)
    }

    /// Evaluation over a flat packed parameter vector, the objective
    /// target for optimizers that never mutate parameters directly.
    pub fn model_function(&self, p: &[f64]) -> Result<Vec<f64>, EngineError> {
        let trial = self.trial_values(Some(p))?;
        self.eval_with(&trial, false, true)
    }

    fn eval_with(
        &self,
        trial: &[Vec<f64>],
        non_convolved: bool,
        only_active: bool,
    ) -> Result<Vec<f64>, EngineError> {
        let selected = |c: &Component| !only_active || c.active;

        if !self.convolved || non_convolved {
            let axis = self.masked_axis();
            let mut sum = vec![0.0; axis.len()];
            let mut buffer = vec![0.0; axis.len()];
            for (ci, component) in self.components.iter().enumerate() {
                if !selected(component) {
                    continue;
                }
                component.shape().function(&trial[ci], &axis, &mut buffer);
                for (s, &b) in sum.iter_mut().zip(&buffer) {
                    *s += b;
                }
            }
            return Ok(sum);
        }

        let conv_axis = self
            .convolution_axis
            .as_deref()
            .ok_or_else(|| EngineError::usage("Convolved mode without a convolution axis."))?;
        let low_loss = self
            .low_loss
            .as_ref()
            .ok_or_else(|| EngineError::usage("Convolved mode without a low-loss spectrum."))?;
        let full_axis = self.spectrum.axis().values();

        let mut sum_convolved = vec![0.0; conv_axis.len()];
        let mut sum = vec![0.0; full_axis.len()];
        for (ci, component) in self.components.iter().enumerate() {
            if !selected(component) {
                continue;
            }
            if component.convolved {
                let mut buffer = vec![0.0; conv_axis.len()];
                component
                    .shape()
                    .function(&trial[ci], conv_axis, &mut buffer);
                for (s, &b) in sum_convolved.iter_mut().zip(&buffer) {
                    *s += b;
                }
            } else {
                let mut buffer = vec![0.0; full_axis.len()];
                component
                    .shape()
                    .function(&trial[ci], &full_axis, &mut buffer);
                for (s, &b) in sum.iter_mut().zip(&buffer) {
                    *s += b;
                }
            }
        }

        let convolved = valid_convolve(&sum_convolved, low_loss.current_data());
        debug_assert_eq!(convolved.len(), sum.len());
        let combined: Vec<f64> = sum.iter().zip(&convolved).map(|(&a, &b)| a + b).collect();
        Ok(self.masked_slice(&combined))
    }

    // Objective helpers ------------------------------------------------------

    /// Weighted residuals `(model(p) - y) * w` over the masked channels.
    pub fn errfunc(
        &self,
        p: &[f64],
        y: &[f64],
        weights: Option<&[f64]>,
    ) -> Result<Vec<f64>, EngineError> {
        let m = self.model_function(p)?;
        if m.len() != y.len() {
            return Err(EngineError::usage(format!(
                "Model length {} does not match data length {}.",
                m.len(),
                y.len()
            )));
        }
        let mut r: Vec<f64> = m.iter().zip(y).map(|(&mi, &yi)| mi - yi).collect();
        if let Some(w) = weights {
            for (ri, &wi) in r.iter_mut().zip(w) {
                *ri *= wi;
            }
        }
        Ok(r)
    }

    /// Scalar least-squares cost `sum((w r)^2)`.
    pub fn least_squares_cost(
        &self,
        p: &[f64],
        y: &[f64],
        weights: Option<&[f64]>,
    ) -> Result<f64, EngineError> {
        let r = self.errfunc(p, y, weights)?;
        Ok(r.iter().map(|&ri| ri * ri).sum())
    }

    /// Negative Poisson log-likelihood `-sum(y ln m - m)`.
    ///
    /// The model is clamped at a tiny positive floor inside the logarithm
    /// so trial parameters driving it non-positive yield a large finite
    /// cost instead of NaN.
    pub fn poisson_likelihood(&self, p: &[f64], y: &[f64]) -> Result<f64, EngineError> {
        const FLOOR: f64 = 1e-12;
        let m = self.model_function(p)?;
        Ok(-m
            .iter()
            .zip(y)
            .map(|(&mi, &yi)| yi * mi.max(FLOOR).ln() - mi)
            .sum::<f64>())
    }

    /// Jacobian with one row per packed free element, columns over the
    /// masked channels, rows in exactly the `set_p0` order.
    ///
    /// Convolved components' rows are evaluated on the convolution axis
    /// and passed through the same "valid" convolution as the model.
    /// Twinned parameters contribute their chain-rule gradient to their
    /// source parameter's row.
    pub fn jacobian(
        &self,
        p: &[f64],
        weights: Option<&[f64]>,
    ) -> Result<DMatrix<f64>, EngineError> {
        let trial = self.trial_values(Some(p))?;
        let table = self.packing_table();
        let n_rows: usize = table.iter().map(|e| e.n).sum();
        let masked_axis = self.masked_axis();
        let n_cols = masked_axis.len();
        let mut jac = DMatrix::zeros(n_rows, n_cols);

        let mut row = 0;
        for entry in &table {
            let source_id = self.components[entry.ci].parameters()[entry.pi].id();
            for k in 0..entry.n {
                let mut grad =
                    self.gradient_row(&trial, entry.ci, entry.flat_offset + k)?;

                // Chain rule for twins of this parameter element.
                for (cj, component) in self.components.iter().enumerate() {
                    if !component.active {
                        continue;
                    }
                    for (pj, parameter) in component.parameters().iter().enumerate() {
                        let Some((twin_id, relation)) = parameter.twin() else {
                            continue;
                        };
                        if twin_id != source_id {
                            continue;
                        }
                        let twin_offset = component.flat_offset(pj);
                        let twin_grad =
                            self.gradient_row(&trial, cj, twin_offset + k)?;
                        for (g, &t) in grad.iter_mut().zip(&twin_grad) {
                            *g += relation.scale * t;
                        }
                    }
                }

                for (col, &g) in grad.iter().enumerate() {
                    let w = weights.map_or(1.0, |w| w[col]);
                    jac[(row, col)] = g * w;
                }
                row += 1;
            }
        }
        Ok(jac)
    }

    /// One masked-channel gradient row for flat element `k` of component
    /// `ci`, with the convolved-mode handling applied.
    fn gradient_row(
        &self,
        trial: &[Vec<f64>],
        ci: usize,
        k: usize,
    ) -> Result<Vec<f64>, EngineError> {
        let component = &self.components[ci];
        let shape = component.shape();
        let missing = || {
            EngineError::fit(format!(
                "Component '{}' provides no analytic gradient.",
                component.name
            ))
        };

        if !self.convolved {
            let axis = self.masked_axis();
            return shape.gradient(&trial[ci], &axis, k).ok_or_else(missing);
        }

        if component.convolved {
            let conv_axis = self
                .convolution_axis
                .as_deref()
                .ok_or_else(|| EngineError::usage("Convolved mode without a convolution axis."))?;
            let low_loss = self
                .low_loss
                .as_ref()
                .ok_or_else(|| EngineError::usage("Convolved mode without a low-loss spectrum."))?;
            let grad = shape
                .gradient(&trial[ci], conv_axis, k)
                .ok_or_else(missing)?;
            let grad = valid_convolve(&grad, low_loss.current_data());
            Ok(self.masked_slice(&grad))
        } else {
            let full_axis = self.spectrum.axis().values();
            let grad = shape
                .gradient(&trial[ci], &full_axis, k)
                .ok_or_else(missing)?;
            Ok(self.masked_slice(&grad))
        }
    }

    /// Whether every active component can supply analytic gradients.
    pub fn has_analytic_gradients(&self) -> bool {
        self.components
            .iter()
            .filter(|c| c.active)
            .all(|c| c.shape().has_gradient())
    }

    /// Generate the full model cube: one evaluated model per navigation
    /// coordinate, with channels outside the fit range set to NaN.
    pub fn generate_data_from_model(
        &mut self,
        progress: &mut dyn Progress,
    ) -> Result<Vec<f64>, EngineError> {
        let nav_size = self.spectrum.nav_size();
        let n = self.spectrum.axis().size;
        let saved_index = self.spectrum.index();
        let mut cube = vec![f64::NAN; nav_size * n];

        for index in 0..nav_size {
            self.set_index(index)?;
            self.charge(false);
            let values = self.evaluate(!self.convolved, true)?;
            let mut cursor = values.iter();
            for (ch, &switched) in self.channel_switches.iter().enumerate() {
                if switched {
                    // masked_slice and evaluate agree on length
                    if let Some(&v) = cursor.next() {
                        cube[index * n + ch] = v;
                    }
                }
            }
            progress.update(index + 1);
        }
        progress.finish();
        self.set_index(saved_index)?;
        self.charge(false);
        Ok(cube)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Gaussian, Offset};
    use crate::signal::Axis;

    fn spectrum(n: usize) -> Spectrum {
        let axis = Axis::new("energy", "eV", 0.0, 1.0, n).unwrap();
        Spectrum::single("s", axis, vec![0.0; n]).unwrap()
    }

    fn gaussian_component(name: &str, a: f64, centre: f64, sigma: f64) -> Component {
        Component::new(name, Box::new(Gaussian::new(a, centre, sigma)))
    }

    #[test]
    fn inactive_components_evaluate_to_zero() {
        let mut model = Model::new(spectrum(50));
        let mut g = gaussian_component("g", 5.0, 25.0, 3.0);
        g.active = false;
        model.append(g);
        model.set_signal_range(10.0, 39.0).unwrap();

        let out = model.evaluate(true, true).unwrap();
        assert_eq!(out.len(), model.masked_channel_count());
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn pack_unpack_round_trip_preserves_values() {
        let mut model = Model::new(spectrum(50));
        model.append(gaussian_component("g1", 5.0, 25.0, 3.0));
        let mut g2 = gaussian_component("g2", 2.0, 10.0, 1.5);
        g2.parameter_mut("sigma").unwrap().free = false;
        model.append(g2);

        model.set_p0();
        let p0 = model.p0().to_vec();
        assert_eq!(p0, vec![5.0, 25.0, 3.0, 2.0, 10.0]);

        model.charge_p0(&p0.clone(), None).unwrap();
        model.set_p0();
        assert_eq!(model.p0(), &p0[..]);
    }

    #[test]
    fn twinned_parameters_track_their_source() {
        let mut model = Model::new(spectrum(50));
        model.append(gaussian_component("g1", 5.0, 25.0, 3.0));
        model.append(gaussian_component("g2", 2.0, 10.0, 1.5));
        // g2.sigma mirrors g1.sigma.
        model
            .set_twin((1, 2), (0, 2), TwinRelation::default())
            .unwrap();

        // The twin leaves the packed vector: 3 + 2 free parameters.
        model.set_p0();
        assert_eq!(model.p0().len(), 5);

        // Mutating the source is reflected through the twin.
        model.component_mut(0).parameter_mut("sigma").unwrap().set_scalar(4.5);
        assert_eq!(model.parameter_value(1, 2).unwrap(), vec![4.5]);

        // Direct mutation of the twinned parameter is not observable.
        model.component_mut(1).parameter_mut("sigma").unwrap().set_scalar(9.9);
        assert_eq!(model.parameter_value(1, 2).unwrap(), vec![4.5]);
    }

    #[test]
    fn twin_relation_applies_affine_transform() {
        let mut model = Model::new(spectrum(50));
        model.append(gaussian_component("g1", 5.0, 25.0, 3.0));
        model.append(gaussian_component("g2", 2.0, 10.0, 1.5));
        model
            .set_twin(
                (1, 1),
                (0, 1),
                TwinRelation {
                    scale: 2.0,
                    offset: 1.0,
                },
            )
            .unwrap();
        assert_eq!(model.parameter_value(1, 1).unwrap(), vec![51.0]);
    }

    #[test]
    fn signal_range_set_and_reset() {
        let mut model = Model::new(spectrum(100));
        model.set_signal_range(20.0, 40.0).unwrap();
        assert_eq!(model.masked_channel_count(), 21);
        assert!(!model.channel_switches()[19]);
        assert!(model.channel_switches()[20]);
        assert!(model.channel_switches()[40]);
        assert!(!model.channel_switches()[41]);

        model.remove_signal_range(30.0, 35.0).unwrap();
        assert_eq!(model.masked_channel_count(), 15);
        model.add_signal_range(30.0, 35.0).unwrap();
        assert_eq!(model.masked_channel_count(), 21);

        model.reset_signal_range();
        assert!(model.channel_switches().iter().all(|&s| s));
    }

    #[test]
    fn restore_signal_range_brings_back_the_backup() {
        let mut model = Model::new(spectrum(100));
        model.remove_signal_range(0.0, 9.0).unwrap();
        let before = model.channel_switches().to_vec();
        model.set_signal_range(50.0, 60.0).unwrap();
        model.restore_signal_range();
        assert_eq!(model.channel_switches(), &before[..]);
    }

    #[test]
    fn signal_range_works_on_descending_axes() {
        let axis = Axis::new("energy", "eV", 100.0, -1.0, 50).unwrap();
        let s = Spectrum::single("s", axis, vec![0.0; 50]).unwrap();
        let mut model = Model::new(s);

        // 90.0 sits at index 10 and 60.0 at index 40 on this axis.
        model.set_signal_range(60.0, 90.0).unwrap();
        assert_eq!(model.masked_channel_count(), 31);
        assert!(!model.channel_switches()[9]);
        assert!(model.channel_switches()[10]);
        assert!(model.channel_switches()[40]);
        assert!(!model.channel_switches()[41]);

        model.remove_signal_range(70.0, 80.0).unwrap();
        assert_eq!(model.masked_channel_count(), 20);
        model.add_signal_range(70.0, 80.0).unwrap();
        assert_eq!(model.masked_channel_count(), 31);
    }

    #[test]
    fn ext_bounding_clamps_trial_evaluations() {
        let mut model = Model::new(spectrum(80));
        model.append(gaussian_component("g", 7.0, 40.0, 4.0));
        model.component_mut(0).parameter_mut("a").unwrap().bmax = Some(9.0);

        model.set_ext_bounding(true);
        let over = model.model_function(&[12.0, 40.0, 4.0]).unwrap();
        let at_bound = model.model_function(&[9.0, 40.0, 4.0]).unwrap();
        assert_eq!(over, at_bound);

        model.set_ext_bounding(false);
        let free = model.model_function(&[12.0, 40.0, 4.0]).unwrap();
        assert!(free != at_bound);
    }

    #[test]
    fn set_stores_twin_resolved_values() {
        let mut model = Model::new(spectrum(50));
        model.append(gaussian_component("g1", 5.0, 20.0, 3.0));
        model.append(gaussian_component("g2", 2.0, 40.0, 9.9));
        model
            .set_twin(
                (1, 2),
                (0, 2),
                TwinRelation {
                    scale: 2.0,
                    offset: 1.0,
                },
            )
            .unwrap();

        model.set();
        let map = model.component(1).parameter("sigma").unwrap().map().unwrap();
        assert_eq!(map.values_at(0), &[7.0]);
        // The working value is synced to the resolved one as well.
        assert_eq!(model.component(1).parameter("sigma").unwrap().scalar(), 7.0);
    }

    struct FixedSelector(Option<(f64, f64)>);

    impl RangeSelector for FixedSelector {
        fn select(&mut self) -> Option<(f64, f64)> {
            self.0
        }
    }

    #[test]
    fn interactive_selection_ignores_empty_and_cancelled() {
        let mut model = Model::new(spectrum(100));
        model
            .set_signal_range_interactive(&mut FixedSelector(None))
            .unwrap();
        assert_eq!(model.masked_channel_count(), 100);
        model
            .set_signal_range_interactive(&mut FixedSelector(Some((30.0, 30.0))))
            .unwrap();
        assert_eq!(model.masked_channel_count(), 100);
        model
            .set_signal_range_interactive(&mut FixedSelector(Some((30.0, 50.0))))
            .unwrap();
        assert_eq!(model.masked_channel_count(), 21);
    }

    #[test]
    fn low_loss_shape_mismatch_is_rejected_at_assignment() {
        let axis = Axis::new("energy", "eV", 0.0, 1.0, 10).unwrap();
        let data: Vec<f64> = vec![0.0; 40];
        let s = Spectrum::new("core", axis.clone(), vec![4], data).unwrap();
        let mut model = Model::new(s);

        let ll_axis = Axis::new("energy", "eV", -2.0, 1.0, 5).unwrap();
        let ll = Spectrum::new("ll", ll_axis, vec![3], vec![0.0; 15]).unwrap();
        let err = model.set_low_loss(Some(ll)).unwrap_err();
        assert!(err.to_string().contains("navigation shape"));
        assert!(!model.is_convolved());
    }

    #[test]
    fn convolution_axis_has_derived_length_and_alignment() {
        let axis = Axis::new("energy", "eV", 100.0, 0.5, 64).unwrap();
        let s = Spectrum::single("core", axis, vec![0.0; 64]).unwrap();
        let mut model = Model::new(s);

        // Low-loss axis with the zero-energy channel at index 4.
        let ll_axis = Axis::new("energy", "eV", -2.0, 0.5, 16).unwrap();
        let mut ll_data = vec![0.0; 16];
        ll_data[4] = 1.0; // delta at zero energy
        let ll = Spectrum::single("ll", ll_axis, ll_data).unwrap();
        model.set_low_loss(Some(ll)).unwrap();

        let conv_axis = model.convolution_axis().unwrap();
        assert_eq!(conv_axis.len(), 64 + 16 - 1);
        // Origin alignment: channel (16 - 4 - 1) carries the signal offset.
        assert!((conv_axis[11] - 100.0).abs() < 1e-12);

        // A delta low-loss at zero energy must make convolved evaluation
        // match the plain one.
        let mut model2 = model;
        let mut g = Component::new("g", Box::new(Gaussian::new(10.0, 115.0, 2.0)));
        g.convolved = true;
        model2.append(g);

        let convolved = model2.evaluate(false, true).unwrap();
        let plain = model2.evaluate(true, true).unwrap();
        assert_eq!(convolved.len(), plain.len());
        for (a, b) in convolved.iter().zip(&plain) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn model_function_matches_evaluate_at_packed_values() {
        let mut model = Model::new(spectrum(80));
        model.append(gaussian_component("g", 7.0, 40.0, 4.0));
        model.append(Component::new("bg", Box::new(Offset { offset: 1.0 })));
        model.set_signal_range(10.0, 69.0).unwrap();

        model.set_p0();
        let p0 = model.p0().to_vec();
        let from_packed = model.model_function(&p0).unwrap();
        let direct = model.evaluate(true, true).unwrap();
        assert_eq!(from_packed.len(), direct.len());
        for (a, b) in from_packed.iter().zip(&direct) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn jacobian_rows_follow_packing_order() {
        let mut model = Model::new(spectrum(60));
        model.append(gaussian_component("g", 7.0, 30.0, 4.0));
        model.set_p0();
        let p0 = model.p0().to_vec();

        let jac = model.jacobian(&p0, None).unwrap();
        assert_eq!(jac.nrows(), 3);
        assert_eq!(jac.ncols(), 60);

        // Row 0 is d/dA: at the centre channel the gradient is exp(0) = 1.
        assert!((jac[(0, 30)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn twin_gradient_is_added_to_the_source_row() {
        let mut model = Model::new(spectrum(60));
        model.append(gaussian_component("g1", 5.0, 20.0, 3.0));
        model.append(gaussian_component("g2", 5.0, 40.0, 3.0));
        model
            .set_twin((1, 2), (0, 2), TwinRelation::default())
            .unwrap();
        model.set_p0();
        let p0 = model.p0().to_vec();
        // 3 free in g1, 2 free in g2 (sigma twinned away).
        assert_eq!(p0.len(), 5);

        let jac = model.jacobian(&p0, None).unwrap();
        assert_eq!(jac.nrows(), 5);
        // The sigma row (index 2) must carry gradient mass near both
        // centres, because g2's sigma contribution folds into it.
        assert!(jac[(2, 20)].abs() > 0.0 || jac[(2, 21)].abs() > 0.0);
        assert!(jac[(2, 40)].abs() > 0.0 || jac[(2, 41)].abs() > 0.0);
    }

    #[test]
    fn generated_cube_follows_the_stored_maps() {
        use crate::progress::NoProgress;

        let axis = Axis::new("energy", "eV", 0.0, 1.0, 20).unwrap();
        let s = Spectrum::new("cube", axis, vec![2], vec![0.0; 40]).unwrap();
        let mut model = Model::new(s);
        model.append(Component::new("bg", Box::new(Offset { offset: 0.0 })));

        // Different stored offset per pixel.
        for (index, value) in [(0usize, 1.5), (1usize, -2.0)] {
            model.set_index(index).unwrap();
            model
                .component_mut(0)
                .parameter_mut("offset")
                .unwrap()
                .set_scalar(value);
            model.set();
        }
        model.remove_signal_range(0.0, 4.0).unwrap();

        let cube = model.generate_data_from_model(&mut NoProgress).unwrap();
        assert_eq!(cube.len(), 40);
        // Out-of-range channels are NaN, in-range ones carry the model.
        assert!(cube[0].is_nan());
        assert_eq!(cube[5], 1.5);
        assert_eq!(cube[20 + 5], -2.0);
    }

    #[test]
    fn structure_observer_fires_on_mutation() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut model = Model::new(spectrum(10));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        model.set_structure_observer(Box::new(move || {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        model.append(gaussian_component("g1", 1.0, 5.0, 1.0));
        model.insert(0, gaussian_component("g0", 1.0, 2.0, 1.0));
        model.remove(0);
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }
}
