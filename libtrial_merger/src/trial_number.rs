use bitvec::prelude::*;

use super::constants::{
    ENVELOPE_OFF_QUANTILE, ENVELOPE_ON_QUANTILE, LOST_ONES_MEAN_PULSES, TIME_UNIT_QUANTILE,
    TRIAL_NUMBER_BIT_SLOTS,
};
use super::device_trials::TrialWindow;
use super::edges::EdgeTimes;
use super::error::TrialNumberError;
use super::stats::{is_close, quantile};

/// Session-wide calibration of the binary trial number code.
///
/// The trial number is sent on two channels after every trial start: the "zero"
/// channel is high for every run of 0 bits and the "one" channel for every run of 1
/// bits, each bit lasting one display frame (the time unit). Bits go least
/// significant first, so the number is read by expanding the alternating run lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialNumberDecoder {
    /// Duration of one bit (s)
    pub time_unit: f64,
    /// Typical onset of the pulse envelope relative to the window start (s)
    pub envelope_on: f64,
    /// Typical offset of the pulse envelope relative to the window start (s)
    pub envelope_off: f64,
    /// The ones channel is missing and run lengths are rebuilt from the zeros channel
    pub lost_ones: bool,
}

impl TrialNumberDecoder {
    /// Estimate the time unit and pulse envelope from all windows of a device.
    ///
    /// The time unit is the 65th percentile of the per-window shortest phase pulse. It
    /// must agree within `unit_rtol` with the envelope duration divided by the number of
    /// bit slots, otherwise every decoded number would be silently wrong.
    pub fn calibrate(windows: &[TrialWindow], unit_rtol: f64) -> Result<Self, TrialNumberError> {
        let shortest_phase: Vec<f64> = windows
            .iter()
            .filter(|w| w.phase.on.len() == w.phase.off.len() && !w.phase.on.is_empty())
            .map(|w| {
                w.phase
                    .off
                    .iter()
                    .zip(w.phase.on.iter())
                    .map(|(off, on)| off - on)
                    .fold(f64::INFINITY, f64::min)
            })
            .filter(|d| *d > 0.0)
            .collect();
        let time_unit =
            quantile(&shortest_phase, TIME_UNIT_QUANTILE).ok_or(TrialNumberError::NoPhasePulses)?;

        let first_on: Vec<f64> = windows
            .iter()
            .filter_map(|w| w.zero.on.iter().copied().reduce(f64::min))
            .collect();
        let last_off: Vec<f64> = windows
            .iter()
            .filter_map(|w| w.zero.off.iter().copied().reduce(f64::max))
            .collect();
        let envelope_on = quantile(&first_on, ENVELOPE_ON_QUANTILE)
            .ok_or(TrialNumberError::NoTrialNumberPulses)?;
        let envelope_off = quantile(&last_off, ENVELOPE_OFF_QUANTILE)
            .ok_or(TrialNumberError::NoTrialNumberPulses)?;

        let expected = (envelope_off - envelope_on) / TRIAL_NUMBER_BIT_SLOTS;
        log::info!("Expected time unit {expected:.5} s, estimated time unit {time_unit:.5} s");
        if !is_close(time_unit, expected, unit_rtol) {
            return Err(TrialNumberError::UnitMismatch {
                expected,
                estimated: time_unit,
                rtol: unit_rtol,
            });
        }

        let mean_ones = windows.iter().map(|w| w.one.on.len()).sum::<usize>() as f64
            / windows.len().max(1) as f64;
        let lost_ones = mean_ones < LOST_ONES_MEAN_PULSES;
        if lost_ones {
            log::warn!(
                "Trial number ones channel appears lost ({mean_ones:.2} pulses per trial). Inferring ones from zeros."
            );
        }

        Ok(Self {
            time_unit,
            envelope_on,
            envelope_off,
            lost_ones,
        })
    }

    /// Decode the trial number of one window. None if the pulses are inconsistent.
    pub fn decode(&self, zero: &EdgeTimes, one: &EdgeTimes) -> Option<i64> {
        let (zeros, ones) = if self.lost_ones {
            infer_other_intervals(
                zero,
                self.time_unit,
                self.envelope_on,
                self.envelope_off,
            )
        } else {
            trial_num_intervals(zero, one, self.time_unit)?
        };
        decode_trial_number(&zeros, &ones)
    }
}

fn to_units(duration: f64, time_unit: f64) -> u32 {
    (duration / time_unit).round_ties_even().max(0.0) as u32
}

/// Run lengths (in time units) of the zero and one channels.
///
/// None if either channel has unpaired edges. A window without any one pulse gets a
/// single zero-length one run.
pub fn trial_num_intervals(
    zero: &EdgeTimes,
    one: &EdgeTimes,
    time_unit: f64,
) -> Option<(Vec<u32>, Vec<u32>)> {
    if zero.on.len() != zero.off.len() || one.on.len() != one.off.len() {
        return None;
    }
    let run_lengths = |edges: &EdgeTimes| -> Vec<u32> {
        edges
            .on
            .iter()
            .zip(edges.off.iter())
            .map(|(on, off)| to_units(off - on, time_unit))
            .collect()
    };
    let zeros = run_lengths(zero);
    let mut ones = run_lengths(one);
    if ones.is_empty() {
        ones.push(0);
    }
    Some((zeros, ones))
}

/// Rebuild both channels' run lengths from the zero channel alone.
///
/// All zero-channel edges, padded with the session envelope onset and offset, are
/// sorted; the gaps between consecutive events alternate between zero runs (channel
/// high) and one runs (channel low). Gaps under half a unit are jitter at the envelope
/// boundaries and are dropped. If the first gap is a real run, the window starts with a
/// one run.
pub fn infer_other_intervals(
    zero: &EdgeTimes,
    time_unit: f64,
    envelope_on: f64,
    envelope_off: f64,
) -> (Vec<u32>, Vec<u32>) {
    let mut events: Vec<f64> = zero.on.iter().chain(zero.off.iter()).copied().collect();
    events.sort_by(|a, b| a.total_cmp(b));
    events.insert(0, envelope_on);
    events.push(envelope_off);

    let gaps: Vec<f64> = events.windows(2).map(|w| w[1] - w[0]).collect();
    let starts_with_one = gaps.first().is_some_and(|g| *g > 0.5 * time_unit);
    let intervals: Vec<u32> = gaps
        .iter()
        .filter(|g| **g > 0.5 * time_unit)
        .map(|g| to_units(*g, time_unit))
        .collect();

    let even: Vec<u32> = intervals.iter().step_by(2).copied().collect();
    let odd: Vec<u32> = intervals.iter().skip(1).step_by(2).copied().collect();
    if starts_with_one {
        (odd, even)
    } else {
        (even, odd)
    }
}

/// Read a trial number from alternating run lengths, least significant bit first.
///
/// The runs pair up as (ones, zeros). If there is one fewer one run than zero runs,
/// the code started with zeros and an empty leading one run is implied. Any other
/// mismatch, or a number too wide for an i64, is undecodable.
pub fn decode_trial_number(zero_intervals: &[u32], one_intervals: &[u32]) -> Option<i64> {
    let leading: &[u32] = if one_intervals.len() + 1 == zero_intervals.len() {
        &[0]
    } else {
        &[]
    };
    if leading.len() + one_intervals.len() != zero_intervals.len() {
        return None;
    }

    let mut bits: BitVec<u64, Lsb0> = BitVec::new();
    for (&ones, &zeros) in leading
        .iter()
        .chain(one_intervals.iter())
        .zip(zero_intervals.iter())
    {
        bits.extend(std::iter::repeat(true).take(ones as usize));
        bits.extend(std::iter::repeat(false).take(zeros as usize));
    }
    // Trailing zeros do not change the value
    let significant = bits.last_one().map_or(0, |idx| idx + 1);
    if significant > 63 {
        return None;
    }
    if significant == 0 {
        return Some(0);
    }
    Some(bits[..significant].load_le::<u64>() as i64)
}

/// Fraction of consecutive trial pairs whose numbers do not increase by exactly one.
/// Undecoded numbers count as errors.
pub fn increment_error_rate(trial_nums: &[Option<i64>]) -> f64 {
    if trial_nums.len() < 2 {
        return 0.0;
    }
    let errors = trial_nums
        .windows(2)
        .filter(|w| match (w[0], w[1]) {
            (Some(a), Some(b)) => b - a != 1,
            _ => true,
        })
        .count();
    errors as f64 / (trial_nums.len() - 1) as f64
}

/// Abort if trial numbers do not generally increment or too many failed to decode
pub fn check_trial_numbers(
    trial_nums: &[Option<i64>],
    increment_threshold: f64,
    failure_fraction: f64,
) -> Result<(), TrialNumberError> {
    let rate = increment_error_rate(trial_nums);
    log::info!("Trial number increment error rate = {rate:.3}");
    if rate > increment_threshold {
        return Err(TrialNumberError::IncrementRate {
            rate,
            threshold: increment_threshold,
        });
    }
    let failures = trial_nums.iter().filter(|n| n.is_none()).count();
    log::info!("Trial number decode failures: {failures}");
    if failures as f64 > failure_fraction * trial_nums.len() as f64 {
        return Err(TrialNumberError::TooManyFailures {
            failures,
            total: trial_nums.len(),
            threshold: failure_fraction,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Bits of `n` over 12 slots plus a terminating zero, as (is_one, run_length) runs
    fn runs(n: u32) -> Vec<(bool, usize)> {
        let mut runs: Vec<(bool, usize)> = Vec::new();
        for slot in 0..13 {
            let bit = slot < 12 && (n >> slot) & 1 == 1;
            match runs.last_mut() {
                Some((b, len)) if *b == bit => *len += 1,
                _ => runs.push((bit, 1)),
            }
        }
        runs
    }

    /// Zero and one channel edge times for `n`, starting at `onset` with `unit` per bit
    pub(crate) fn encode(n: u32, onset: f64, unit: f64) -> (EdgeTimes, EdgeTimes) {
        let mut zero = EdgeTimes::default();
        let mut one = EdgeTimes::default();
        let mut t = onset;
        for (is_one, len) in runs(n) {
            let channel = if is_one { &mut one } else { &mut zero };
            channel.on.push(t);
            t += len as f64 * unit;
            channel.off.push(t);
        }
        (zero, one)
    }

    #[test]
    fn test_every_number_decodes() {
        let unit = 1.0 / 60.0;
        for n in 0..4096u32 {
            let (zero, one) = encode(n, 0.1, unit);
            let (zeros, ones) = trial_num_intervals(&zero, &one, unit).unwrap();
            assert_eq!(decode_trial_number(&zeros, &ones), Some(n as i64), "n = {n}");
        }
    }

    #[test]
    fn test_inferred_ones_decode() {
        let unit = 1.0 / 60.0;
        let onset = 0.1;
        let envelope_off = onset + 13.0 * unit;
        let mut recovered = 0;
        for n in 0..4096u32 {
            let (zero, _) = encode(n, onset, unit);
            let (zeros, ones) = infer_other_intervals(&zero, unit, onset, envelope_off);
            if decode_trial_number(&zeros, &ones) == Some(n as i64) {
                recovered += 1;
            }
        }
        assert!(recovered as f64 > 0.95 * 4096.0, "recovered {recovered}");
    }

    #[test]
    fn test_mismatched_runs_undecodable() {
        assert_eq!(decode_trial_number(&[1, 2], &[1, 1, 1]), None);
        assert_eq!(decode_trial_number(&[2], &[]), Some(0));
        // 0b0110 read LSB first: zero, one, one, zero
        assert_eq!(decode_trial_number(&[1, 1], &[2]), Some(6));
        let unpaired = EdgeTimes {
            on: vec![0.1, 0.2],
            off: vec![0.15],
        };
        assert!(trial_num_intervals(&unpaired, &EdgeTimes::default(), 0.01).is_none());
    }

    #[test]
    fn test_sanity_checks() {
        let good: Vec<Option<i64>> = (0..100).map(Some).collect();
        assert!(check_trial_numbers(&good, 0.4, 0.25).is_ok());

        let mut noisy = good.clone();
        for n in noisy.iter_mut().step_by(2) {
            *n = None;
        }
        assert!(matches!(
            check_trial_numbers(&noisy, 0.4, 0.25),
            Err(TrialNumberError::IncrementRate { .. })
        ));
        assert!(matches!(
            check_trial_numbers(&noisy, 1.0, 0.25),
            Err(TrialNumberError::TooManyFailures { failures: 50, .. })
        ));
    }

    /// Windows carrying trial number 10 and a shortest phase pulse of `phase_pulse`
    fn windows(unit: f64, phase_pulse: f64) -> Vec<TrialWindow> {
        (0..20)
            .map(|k| {
                let (zero, one) = encode(10, 0.1, unit);
                TrialWindow {
                    t_start: 2.0 * k as f64,
                    t_end: 2.0 * (k + 1) as f64,
                    phase: EdgeTimes {
                        on: vec![0.5, 1.0],
                        off: vec![0.5 + phase_pulse, 1.2],
                    },
                    zero,
                    one,
                }
            })
            .collect()
    }

    #[test]
    fn test_calibrate_time_unit() {
        let unit = 1.0 / 60.0;
        let decoder = TrialNumberDecoder::calibrate(&windows(unit, unit), 0.1).unwrap();
        approx::assert_abs_diff_eq!(decoder.time_unit, unit, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(decoder.envelope_on, 0.1, epsilon = 1e-12);
        assert!(!decoder.lost_ones);
    }

    #[test]
    fn test_calibrate_unit_mismatch() {
        let unit = 1.0 / 60.0;
        match TrialNumberDecoder::calibrate(&windows(unit, 1.2 * unit), 0.1) {
            Err(TrialNumberError::UnitMismatch {
                expected,
                estimated,
                rtol,
            }) => {
                approx::assert_abs_diff_eq!(expected, unit, epsilon = 1e-12);
                approx::assert_abs_diff_eq!(estimated, 1.2 * unit, epsilon = 1e-12);
                approx::assert_abs_diff_eq!(rtol, 0.1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
