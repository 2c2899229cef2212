//! Photodiode flash detection and per-trial display delays.
//!
//! The task raises a trial-start sync variable for ~50 ms at the beginning of every
//! trial and a photodiode patch on the display follows it. The offset of that sync step
//! is the nominal trial start; the offset of the matching photodiode flash is the
//! actual display change. Their difference is the per-trial display delay.
//!
//! Flash detection:
//! 1. Normalize with a robust mean and std (extreme 0.1% quantiles excluded) and smooth
//!    with a short moving average.
//! 2. Infer polarity from the upper vs lower 0.2% quantiles; some rigs invert the signal.
//! 3. Slide a black/bright/black step template over the signal and compute the MSE.
//! 4. Each run of MSE below half the mean MSE is one flash, located at the MSE minimum
//!    in a short lookahead.
use ndarray::{s, Array1, ArrayView1};

use super::constants::*;
use super::error::{PhotodiodeError, SignalError};
use super::stats::{is_close, quantile, quantile_sorted};

/// Parameters of the flash template and the delay matching.
///
/// Durations are in samples at the nominal 1 ms sample interval.
#[derive(Debug, Clone)]
pub struct PhotodiodeLocator {
    pub flash_duration: usize,
    pub guard: usize,
    pub smooth_window: usize,
    pub lookahead: usize,
    pub match_window: f64,
    pub failure_fraction: f64,
}

impl Default for PhotodiodeLocator {
    fn default() -> Self {
        Self {
            flash_duration: FLASH_DURATION,
            guard: FLASH_GUARD,
            smooth_window: PHOTODIODE_SMOOTH_WINDOW,
            lookahead: FLASH_LOOKAHEAD,
            match_window: PHOTODIODE_MATCH_WINDOW,
            failure_fraction: PHOTODIODE_FAILURE_FRACTION,
        }
    }
}

impl PhotodiodeLocator {
    pub fn new(match_window: f64, failure_fraction: f64) -> Self {
        Self {
            match_window,
            failure_fraction,
            ..Default::default()
        }
    }

    fn template_len(&self) -> usize {
        2 * self.guard + self.flash_duration
    }

    /// Find the times at which flashes end (bright to black).
    ///
    /// Flashes at or before `session_start` are discarded; they are typically rig
    /// lights before the task began.
    pub fn find_flashes(
        &self,
        values: &[f64],
        times: &[f64],
        session_start: f64,
    ) -> Result<Vec<f64>, PhotodiodeError> {
        if values.len() != times.len() {
            return Err(SignalError::LengthMismatch(values.len(), times.len()).into());
        }
        if values.len() < self.template_len() + 1 {
            return Err(PhotodiodeError::TooShort(values.len(), self.template_len()));
        }
        check_sample_interval(times)?;

        let normalized = robust_normalize(ArrayView1::from(values));
        let smoothed = moving_average(normalized.view(), self.smooth_window);
        let bright = infer_bright_value(smoothed.view());
        let mse = self.template_mse(smoothed.view(), bright);

        let finite: Vec<f64> = mse.iter().copied().filter(|v| v.is_finite()).collect();
        let mean_mse = finite.iter().sum::<f64>() / finite.len() as f64;
        let threshold = 0.5 * mean_mse;

        let mut flashes = Vec::new();
        let mut was_below = false;
        for idx in 0..mse.len() {
            let below = mse[idx] < threshold;
            if below && !was_below && idx > 0 {
                let end = (idx + self.lookahead).min(mse.len());
                let peak = idx + argmin(mse.slice(s![idx..end]));
                let t = times[peak];
                if t > session_start {
                    flashes.push(t);
                }
            }
            was_below = below;
        }
        log::info!(
            "Found {} photodiode flashes (bright value {:.3}, mse threshold {:.4})",
            flashes.len(),
            bright,
            threshold
        );
        Ok(flashes)
    }

    /// Mean squared error between the smoothed signal and the step template.
    ///
    /// Entry `i` scores the window whose bright segment ends at sample `i`; entries
    /// that have no complete window are infinite.
    fn template_mse(&self, smoothed: ArrayView1<f64>, bright: f64) -> Array1<f64> {
        let n = smoothed.len();
        let len = self.template_len();
        let lead = self.guard + self.flash_duration;

        let mut sum = vec![0.0; n + 1];
        let mut sum_sq = vec![0.0; n + 1];
        for (idx, v) in smoothed.iter().enumerate() {
            sum[idx + 1] = sum[idx] + v;
            sum_sq[idx + 1] = sum_sq[idx] + v * v;
        }

        let n_windows = n + 1 - len;
        let mut mse = Array1::from_elem(lead + n_windows, f64::INFINITY);
        let bright_energy = self.flash_duration as f64 * bright * bright;
        for start in 0..n_windows {
            let total_sq = sum_sq[start + len] - sum_sq[start];
            let bright_sum =
                sum[start + self.guard + self.flash_duration] - sum[start + self.guard];
            let sse = total_sq - 2.0 * bright * bright_sum + bright_energy;
            mse[lead + start] = sse.max(0.0) / len as f64;
        }
        mse
    }

    /// Per-trial delay between each trial-start sync offset and its photodiode flash.
    ///
    /// Trials whose nearest flash is further than the match window get None. If more
    /// than the failure fraction of trials fail, the photodiode is presumed
    /// disconnected and every delay is None.
    pub fn delays(
        &self,
        values: &[f64],
        times: &[f64],
        trial_start_on: &[f64],
        trial_start_off: &[f64],
    ) -> Result<Vec<Option<f64>>, PhotodiodeError> {
        let session_start = trial_start_on.first().copied().unwrap_or(f64::NEG_INFINITY);
        let flashes = self.find_flashes(values, times, session_start)?;
        Ok(self.match_flashes(&flashes, trial_start_off))
    }

    /// Match each sync offset to its nearest flash
    pub fn match_flashes(&self, flashes: &[f64], trial_start_off: &[f64]) -> Vec<Option<f64>> {
        if flashes.is_empty() {
            log::warn!("No photodiode flashes found. Using no photodiode delays.");
            return vec![None; trial_start_off.len()];
        }

        let delays: Vec<Option<f64>> = trial_start_off
            .iter()
            .map(|&t| {
                let nearest = nearest_value(flashes, t);
                if (nearest - t).abs() > self.match_window {
                    None
                } else {
                    Some(nearest - t)
                }
            })
            .collect();

        let failures = delays.iter().filter(|d| d.is_none()).count();
        let failure_rate = failures as f64 / delays.len().max(1) as f64;
        if failure_rate > self.failure_fraction {
            log::warn!(
                "Photodiode did not work ({} of {} trials unmatched). Using no photodiode delays.",
                failures,
                delays.len()
            );
            return vec![None; trial_start_off.len()];
        }
        delays
    }
}

fn check_sample_interval(times: &[f64]) -> Result<(), PhotodiodeError> {
    let interval = (times[times.len() - 1] - times[0]) / (times.len() - 1) as f64;
    if !is_close(interval, PHOTODIODE_SAMPLE_INTERVAL, PHOTODIODE_SAMPLE_RTOL) {
        return Err(PhotodiodeError::BadSampleInterval(
            interval,
            PHOTODIODE_SAMPLE_INTERVAL,
        ));
    }
    Ok(())
}

/// Subtract the mean and divide by the std of the samples strictly inside the
/// (0.1%, 99.9%) quantile range
fn robust_normalize(values: ArrayView1<f64>) -> Array1<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let lo = quantile_sorted(&sorted, NORMALIZE_QUANTILE);
    let hi = quantile_sorted(&sorted, 1.0 - NORMALIZE_QUANTILE);
    let inliers: Vec<f64> = values
        .iter()
        .copied()
        .filter(|&v| v > lo && v < hi)
        .collect();
    if inliers.is_empty() {
        return values.to_owned();
    }
    let n = inliers.len() as f64;
    let mean = inliers.iter().sum::<f64>() / n;
    let std = (inliers.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std > 0.0 {
        values.mapv(|v| (v - mean) / std)
    } else {
        values.mapv(|v| v - mean)
    }
}

/// Centered moving average with zero padding (same-length convolution with a box)
fn moving_average(values: ArrayView1<f64>, window: usize) -> Array1<f64> {
    let n = values.len();
    let window = window.max(1);
    let center = (window - 1) / 2;
    let mut cumulative = vec![0.0; n + 1];
    for (idx, v) in values.iter().enumerate() {
        cumulative[idx + 1] = cumulative[idx] + v;
    }
    Array1::from_shape_fn(n, |idx| {
        let hi = (idx + center + 1).min(n);
        let lo = (idx + center + 1).saturating_sub(window);
        (cumulative[hi] - cumulative[lo]) / window as f64
    })
}

/// The bright value is whichever tail quantile is further from zero
fn infer_bright_value(smoothed: ArrayView1<f64>) -> f64 {
    let values = smoothed.to_vec();
    let up = quantile(&values, 1.0 - POLARITY_QUANTILE).unwrap_or(0.0);
    let down = quantile(&values, POLARITY_QUANTILE).unwrap_or(0.0);
    if up > -down {
        up
    } else {
        down
    }
}

fn argmin(values: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (idx, v) in values.iter().enumerate() {
        if *v < values[best] {
            best = idx;
        }
    }
    best
}

/// Nearest element of a sorted, non-empty slice. Ties go to the earlier element.
fn nearest_value(sorted: &[f64], t: f64) -> f64 {
    let idx = sorted.partition_point(|&v| v < t);
    if idx == 0 {
        sorted[0]
    } else if idx == sorted.len() {
        sorted[idx - 1]
    } else if (t - sorted[idx - 1]) <= (sorted[idx] - t) {
        sorted[idx - 1]
    } else {
        sorted[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gaussian(rng: &mut StdRng) -> f64 {
        let u1: f64 = rng.random::<f64>().max(1e-12);
        let u2: f64 = rng.random::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Flash offsets every ~2 s, bright for 60 samples, with Gaussian noise
    fn synthetic_trace(inverted: bool, noise: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 120_000;
        let times: Vec<f64> = (0..n).map(|i| i as f64 * 0.001).collect();
        let mut values: Vec<f64> = (0..n).map(|_| noise * gaussian(&mut rng)).collect();
        let mut offsets = Vec::new();
        let mut t = 1000;
        let mut k = 0;
        while t + 200 < n {
            for v in values[t - 60..t].iter_mut() {
                *v += if inverted { -1.0 } else { 1.0 };
            }
            offsets.push(times[t]);
            t += 1900 + (k * 137) % 400;
            k += 1;
        }
        (values, times, offsets)
    }

    #[test]
    fn test_flashes_recovered() {
        for inverted in [false, true] {
            let (values, times, offsets) = synthetic_trace(inverted, 0.1);
            let locator = PhotodiodeLocator::default();
            let flashes = locator.find_flashes(&values, &times, 0.0).unwrap();
            let within = offsets
                .iter()
                .filter(|&&t| (nearest_value(&flashes, t) - t).abs() < 0.1)
                .count();
            assert!(
                within as f64 >= 0.95 * offsets.len() as f64,
                "{within} of {} flashes recovered (inverted {inverted})",
                offsets.len()
            );
        }
    }

    #[test]
    fn test_delays_match_sync_offsets() {
        let (values, times, offsets) = synthetic_trace(false, 0.1);
        let sync_off: Vec<f64> = offsets.iter().map(|t| t - 0.03).collect();
        let sync_on: Vec<f64> = sync_off.iter().map(|t| t - 0.05).collect();
        let locator = PhotodiodeLocator::default();
        let delays = locator.delays(&values, &times, &sync_on, &sync_off).unwrap();
        assert_eq!(delays.len(), sync_off.len());
        let found: Vec<f64> = delays.iter().flatten().copied().collect();
        assert!(found.len() as f64 >= 0.95 * delays.len() as f64);
        for d in found {
            approx::assert_abs_diff_eq!(d, 0.03, epsilon = 0.01);
        }
    }

    #[test]
    fn test_noise_only_reports_not_found() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 60_000;
        let times: Vec<f64> = (0..n).map(|i| i as f64 * 0.001).collect();
        let values: Vec<f64> = (0..n).map(|_| gaussian(&mut rng)).collect();
        let sync_off: Vec<f64> = (1..25).map(|k| k as f64 * 2.3).collect();
        let sync_on: Vec<f64> = sync_off.iter().map(|t| t - 0.05).collect();
        let locator = PhotodiodeLocator::default();
        let delays = locator.delays(&values, &times, &sync_on, &sync_off).unwrap();
        assert_eq!(delays.len(), sync_off.len());
        assert!(delays.iter().all(|d| d.is_none()));
    }

    #[test]
    fn test_bad_sample_interval() {
        let times: Vec<f64> = (0..1000).map(|i| i as f64 * 0.01).collect();
        let values = vec![0.0; 1000];
        let locator = PhotodiodeLocator::default();
        assert!(matches!(
            locator.find_flashes(&values, &times, 0.0),
            Err(PhotodiodeError::BadSampleInterval(_, _))
        ));
    }

    #[test]
    fn test_match_failure_discards_all() {
        let locator = PhotodiodeLocator::default();
        let flashes = [1.02, 5.0];
        let delays = locator.match_flashes(&flashes, &[1.0, 2.0, 3.0]);
        assert!(delays.iter().all(|d| d.is_none()));
        let delays = locator.match_flashes(&flashes, &[1.0, 4.95, 3.0]);
        approx::assert_abs_diff_eq!(delays[0].unwrap(), 0.02, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(delays[1].unwrap(), 0.05, epsilon = 1e-12);
        assert!(delays[2].is_none());
    }
}
