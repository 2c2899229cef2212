use ndarray::{Array1, ArrayView1};

use super::clock::AffineMap;
use super::error::SpikesError;

/// Put spike sample indices on the common clock.
///
/// Indices are converted to seconds at the device sample rate, shifted by the
/// device's fixed delay and then mapped through the fitted transform.
pub fn resync_spike_times(
    sample_indices: &[u64],
    sample_rate: f64,
    transform: &AffineMap,
    fixed_delay: f64,
) -> Result<Array1<f64>, SpikesError> {
    if sample_rate.is_nan() || sample_rate <= 0.0 {
        return Err(SpikesError::BadSampleRate(sample_rate));
    }
    let transform = *transform;
    Ok(ArrayView1::from(sample_indices)
        .mapv(|idx| transform.apply(idx as f64 / sample_rate + fixed_delay)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_resync() {
        let map = AffineMap {
            slope: 1.001,
            intercept: -2.0,
        };
        let times = resync_spike_times(&[0, 30_000, 60_000], 30_000.0, &map, 0.5).unwrap();
        assert_abs_diff_eq!(times[0], 1.001 * 0.5 - 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(times[1], 1.001 * 1.5 - 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(times[2], 1.001 * 2.5 - 2.0, epsilon = 1e-12);
        assert!(resync_spike_times(&[1], 0.0, &map, 0.0).is_err());
    }
}
