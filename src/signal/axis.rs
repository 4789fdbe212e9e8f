//! Calibrated signal axis.
//!
//! An axis is a uniformly spaced grid `value(i) = offset + scale * i`.
//! Value-to-index mapping uses nearest-channel rounding and fails for
//! values that land outside the grid; this is the single definition used
//! by every signal-range operation.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub units: String,
    pub offset: f64,
    pub scale: f64,
    pub size: usize,
}

impl Axis {
    pub fn new(
        name: impl Into<String>,
        units: impl Into<String>,
        offset: f64,
        scale: f64,
        size: usize,
    ) -> Result<Self, EngineError> {
        if size == 0 {
            return Err(EngineError::usage("Axis size must be > 0."));
        }
        if !(offset.is_finite() && scale.is_finite()) || scale == 0.0 {
            return Err(EngineError::usage(
                "Axis offset/scale must be finite and scale non-zero.",
            ));
        }
        Ok(Self {
            name: name.into(),
            units: units.into(),
            offset,
            scale,
            size,
        })
    }

    pub fn value(&self, index: usize) -> f64 {
        self.offset + self.scale * index as f64
    }

    /// Full coordinate grid.
    pub fn values(&self) -> Vec<f64> {
        (0..self.size).map(|i| self.value(i)).collect()
    }

    /// Nearest-channel index for a value.
    ///
    /// Rounds to the closest channel centre; values that round outside
    /// `0..size` are an error rather than being clamped, so range
    /// selections cannot silently grow past the data.
    pub fn value_to_index(&self, value: f64) -> Result<usize, EngineError> {
        if !value.is_finite() {
            return Err(EngineError::usage("Axis value must be finite."));
        }
        let fractional = (value - self.offset) / self.scale;
        let index = fractional.round();
        if index < 0.0 || index >= self.size as f64 {
            return Err(EngineError::usage(format!(
                "Value {value} ({}) is outside the axis range {}..{}.",
                self.units,
                self.value(0),
                self.value(self.size - 1),
            )));
        }
        Ok(index as usize)
    }

    /// Recalibrate offset/scale from two (index, value) pairs.
    pub fn calibrate(
        &mut self,
        i1: usize,
        i2: usize,
        v1: f64,
        v2: f64,
    ) -> Result<(), EngineError> {
        if i1 == i2 {
            return Err(EngineError::usage(
                "Calibration requires two distinct channel indices.",
            ));
        }
        if i1 >= self.size || i2 >= self.size {
            return Err(EngineError::usage(format!(
                "Calibration indices must be < axis size {}.",
                self.size
            )));
        }
        let scale = (v2 - v1) / (i2 as f64 - i1 as f64);
        if !scale.is_finite() || scale == 0.0 {
            return Err(EngineError::usage("Calibration produces a degenerate scale."));
        }
        self.scale = scale;
        self.offset = v1 - scale * i1 as f64;
        Ok(())
    }
}

/// Uniform grid of `n` points with `origin` placed at channel `origin_index`.
///
/// Used to build the extended convolution axis so that the origin of the
/// signal axis stays aligned after a "valid" convolution.
pub fn generate_axis(origin: f64, step: f64, n: usize, origin_index: usize) -> Vec<f64> {
    (0..n)
        .map(|i| origin + step * (i as f64 - origin_index as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_index_round_trip() {
        let axis = Axis::new("energy", "eV", 100.0, 0.5, 200).unwrap();
        assert_eq!(axis.value(0), 100.0);
        assert_eq!(axis.value_to_index(100.0).unwrap(), 0);
        assert_eq!(axis.value_to_index(149.9).unwrap(), 100);
        // Nearest rounding, not floor.
        assert_eq!(axis.value_to_index(100.3).unwrap(), 1);
        assert!(axis.value_to_index(99.0).is_err());
        assert!(axis.value_to_index(100.0 + 0.5 * 200.0).is_err());
    }

    #[test]
    fn calibrate_remaps_offset_and_scale() {
        let mut axis = Axis::new("energy", "eV", 0.0, 1.0, 100).unwrap();
        axis.calibrate(10, 30, 5.0, 15.0).unwrap();
        assert!((axis.scale - 0.5).abs() < 1e-12);
        assert!((axis.value(10) - 5.0).abs() < 1e-12);
        assert!((axis.value(30) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn generated_axis_places_origin_at_requested_channel() {
        let axis = generate_axis(2.0, 0.5, 5, 2);
        assert_eq!(axis, vec![1.0, 1.5, 2.0, 2.5, 3.0]);
    }
}
