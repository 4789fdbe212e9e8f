//! Numeric helpers shared by the model evaluation and jacobian paths.

/// "Valid"-mode discrete convolution.
///
/// `long` must be at least as long as `kernel`; the output has
/// `long.len() - kernel.len() + 1` samples, the subset of the full
/// convolution where the kernel fully overlaps `long`. This is the
/// operation that maps a convolution-axis evaluation (signal size +
/// kernel size - 1 samples) back onto the signal axis.
pub fn valid_convolve(long: &[f64], kernel: &[f64]) -> Vec<f64> {
    debug_assert!(long.len() >= kernel.len());
    let k = kernel.len();
    let out_len = long.len() - k + 1;
    let mut out = vec![0.0; out_len];
    for (i, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (j, &w) in kernel.iter().enumerate() {
            acc += w * long[i + k - 1 - j];
        }
        *o = acc;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_convolution_length_and_values() {
        // Full convolution of [1,2,3,4] with [1,1] is [1,3,5,7,4];
        // the valid part drops the partial-overlap ends.
        let out = valid_convolve(&[1.0, 2.0, 3.0, 4.0], &[1.0, 1.0]);
        assert_eq!(out, vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn identity_kernel_is_a_no_op() {
        let out = valid_convolve(&[5.0, -1.0, 2.0], &[1.0]);
        assert_eq!(out, vec![5.0, -1.0, 2.0]);
    }

    #[test]
    fn delta_kernel_shifts() {
        // Kernel [0,1] (delta at index 1) shifts by one sample.
        let out = valid_convolve(&[1.0, 2.0, 3.0, 4.0], &[0.0, 1.0]);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }
}
