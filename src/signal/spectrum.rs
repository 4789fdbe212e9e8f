//! Hyperspectral dataset: a cube of 1-D spectra indexed by navigation
//! coordinates.
//!
//! Data is stored flat with the signal axis contiguous per pixel, so the
//! current-position spectrum is always a plain slice. Navigation order is
//! row-major over the navigation shape and is the scan order used by
//! `Model::multifit`.

use crate::error::EngineError;
use crate::metadata::MetadataNode;
use crate::signal::Axis;

#[derive(Debug, Clone)]
pub struct Spectrum {
    pub name: String,
    axis: Axis,
    nav_shape: Vec<usize>,
    data: Vec<f64>,
    variance: Option<Vec<f64>>,
    pub metadata: MetadataNode,
    current: usize,
}

impl Spectrum {
    /// Build a dataset over `nav_shape` pixels of `axis.size` channels each.
    ///
    /// An empty `nav_shape` means a single spectrum.
    pub fn new(
        name: impl Into<String>,
        axis: Axis,
        nav_shape: Vec<usize>,
        data: Vec<f64>,
    ) -> Result<Self, EngineError> {
        if nav_shape.iter().any(|&d| d == 0) {
            return Err(EngineError::usage(
                "Navigation shape dimensions must be > 0.",
            ));
        }
        let nav_size: usize = nav_shape.iter().product();
        let expected = nav_size * axis.size;
        if data.len() != expected {
            return Err(EngineError::usage(format!(
                "Data length {} does not match navigation shape {:?} x {} signal channels (expected {}).",
                data.len(),
                nav_shape,
                axis.size,
                expected,
            )));
        }
        Ok(Self {
            name: name.into(),
            axis,
            nav_shape,
            data,
            variance: None,
            metadata: MetadataNode::default(),
            current: 0,
        })
    }

    /// Single spectrum with no navigation dimensions.
    pub fn single(
        name: impl Into<String>,
        axis: Axis,
        data: Vec<f64>,
    ) -> Result<Self, EngineError> {
        Self::new(name, axis, Vec::new(), data)
    }

    pub fn axis(&self) -> &Axis {
        &self.axis
    }

    pub fn nav_shape(&self) -> &[usize] {
        &self.nav_shape
    }

    pub fn nav_size(&self) -> usize {
        self.nav_shape.iter().product()
    }

    /// Current navigation coordinate as a flat row-major index.
    pub fn index(&self) -> usize {
        self.current
    }

    pub fn set_index(&mut self, index: usize) -> Result<(), EngineError> {
        if index >= self.nav_size() {
            return Err(EngineError::usage(format!(
                "Navigation index {index} out of range (navigation size {}).",
                self.nav_size()
            )));
        }
        self.current = index;
        Ok(())
    }

    pub fn data_at(&self, index: usize) -> &[f64] {
        let n = self.axis.size;
        &self.data[index * n..(index + 1) * n]
    }

    /// The spectrum at the current navigation coordinate.
    pub fn current_data(&self) -> &[f64] {
        self.data_at(self.current)
    }

    pub fn variance_at(&self, index: usize) -> Option<&[f64]> {
        let n = self.axis.size;
        self.variance
            .as_ref()
            .map(|v| &v[index * n..(index + 1) * n])
    }

    pub fn current_variance(&self) -> Option<&[f64]> {
        self.variance_at(self.current)
    }

    pub fn has_variance(&self) -> bool {
        self.variance.is_some()
    }

    /// Estimate per-channel variance with an affine Poisson model:
    /// `variance = gain_factor * data + gain_offset`, clamped at a small
    /// positive floor so inverse-variance weights stay finite.
    pub fn estimate_variance(&mut self, gain_factor: f64, gain_offset: f64) {
        const FLOOR: f64 = 1e-12;
        self.variance = Some(
            self.data
                .iter()
                .map(|&d| (gain_factor * d + gain_offset).max(FLOOR))
                .collect(),
        );
    }

    pub fn set_variance(&mut self, variance: Vec<f64>) -> Result<(), EngineError> {
        if variance.len() != self.data.len() {
            return Err(EngineError::usage(format!(
                "Variance length {} does not match data length {}.",
                variance.len(),
                self.data.len()
            )));
        }
        self.variance = Some(variance);
        Ok(())
    }
}

/// Boolean navigation mask with an explicit shape, validated against a
/// dataset before use. `true` selects pixels to fit.
#[derive(Debug, Clone)]
pub struct NavMask {
    shape: Vec<usize>,
    values: Vec<bool>,
}

impl NavMask {
    pub fn new(shape: Vec<usize>, values: Vec<bool>) -> Result<Self, EngineError> {
        let size: usize = shape.iter().product();
        if values.len() != size {
            return Err(EngineError::usage(format!(
                "Mask values length {} does not match shape {:?} (expected {}).",
                values.len(),
                shape,
                size
            )));
        }
        Ok(Self { shape, values })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn selected(&self, index: usize) -> bool {
        self.values[index]
    }

    pub fn selected_count(&self) -> usize {
        self.values.iter().filter(|&&m| m).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(n: usize) -> Axis {
        Axis::new("energy", "eV", 0.0, 1.0, n).unwrap()
    }

    #[test]
    fn rejects_inconsistent_data_length() {
        let err = Spectrum::new("s", axis(10), vec![2, 3], vec![0.0; 59]).unwrap_err();
        assert!(err.to_string().contains("expected 60"));
    }

    #[test]
    fn navigation_indexing_selects_pixel_slices() {
        let data: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let mut s = Spectrum::new("s", axis(3), vec![2, 2], data).unwrap();
        assert_eq!(s.nav_size(), 4);
        s.set_index(2).unwrap();
        assert_eq!(s.current_data(), &[6.0, 7.0, 8.0]);
        assert!(s.set_index(4).is_err());
    }

    #[test]
    fn variance_estimate_is_clamped_positive() {
        let mut s = Spectrum::single("s", axis(3), vec![4.0, 0.0, -2.0]).unwrap();
        s.estimate_variance(1.0, 0.0);
        let v = s.current_variance().unwrap();
        assert_eq!(v[0], 4.0);
        assert!(v[1] > 0.0 && v[2] > 0.0);
    }

    #[test]
    fn mask_shape_is_validated() {
        assert!(NavMask::new(vec![2, 3], vec![false; 5]).is_err());
        let mask = NavMask::new(vec![2, 3], vec![false, true, false, false, true, false]).unwrap();
        assert_eq!(mask.selected_count(), 2);
        assert!(mask.selected(1));
        assert!(!mask.selected(0));
    }
}
