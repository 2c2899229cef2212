use serde::{Deserialize, Serialize};

use super::config::Thresholds;
use super::edges::{detect_edges, EdgeTimes};
use super::error::DeviceTrialsError;
use super::photodiode::PhotodiodeLocator;
use super::trial::TrialRecord;
use super::trial_number::{check_trial_numbers, TrialNumberDecoder};

/// Analog photodiode samples recorded alongside a device's sync channels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhotodiodeTrace {
    pub sample_rate: f64,
    pub values: Vec<f64>,
}

impl PhotodiodeTrace {
    pub fn times(&self) -> Vec<f64> {
        (0..self.values.len())
            .map(|i| i as f64 / self.sample_rate)
            .collect()
    }
}

/// The sync channels of one physiology acquisition device.
///
/// Digital channels are 0/1 samples at `sample_rate`, starting with the device stream.
/// Trial times are reported relative to `record_start_time`, the stream time at which
/// the recording (and so the spike-sorted data) begins, and shifted by `fixed_delay`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSyncEvents {
    pub sample_rate: f64,
    pub trial_start: Vec<u8>,
    pub phase: Vec<u8>,
    pub trial_num_zero: Vec<u8>,
    pub trial_num_one: Vec<u8>,
    #[serde(default)]
    pub photodiode: Option<PhotodiodeTrace>,
    #[serde(default)]
    pub record_start_time: f64,
    #[serde(default)]
    pub fixed_delay: f64,
}

/// Pulses attributed to one trial window, relative to the window start
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialWindow {
    pub t_start: f64,
    pub t_end: f64,
    pub phase: EdgeTimes,
    pub zero: EdgeTimes,
    pub one: EdgeTimes,
}

/// Times in [start, end) of a sorted slice, relative to start
fn times_in_window(times: &[f64], start: f64, end: f64) -> Vec<f64> {
    let lo = times.partition_point(|&t| t < start);
    let hi = times.partition_point(|&t| t < end);
    times[lo..hi].iter().map(|t| t - start).collect()
}

fn edges_in_window(edges: &EdgeTimes, start: f64, end: f64) -> EdgeTimes {
    EdgeTimes {
        on: times_in_window(&edges.on, start, end),
        off: times_in_window(&edges.off, start, end),
    }
}

/// WindowBuilder takes trial start edges and composes them into TrialWindows.
///
/// The first start edge opens a window. Every following start edge closes the open
/// window, which is returned with all phase and trial number pulses in [start, end),
/// and opens the next one. The last window never closes.
#[derive(Debug)]
pub struct WindowBuilder<'a> {
    current_start: Option<f64>,
    phase: &'a EdgeTimes,
    zero: &'a EdgeTimes,
    one: &'a EdgeTimes,
}

impl<'a> WindowBuilder<'a> {
    pub fn new(phase: &'a EdgeTimes, zero: &'a EdgeTimes, one: &'a EdgeTimes) -> Self {
        Self {
            current_start: None,
            phase,
            zero,
            one,
        }
    }

    /// Add a start edge. Returns the window it closed, if one was open.
    pub fn append_start(&mut self, t: f64) -> Option<TrialWindow> {
        let window = self.current_start.map(|start| TrialWindow {
            t_start: start,
            t_end: t,
            phase: edges_in_window(self.phase, start, t),
            zero: edges_in_window(self.zero, start, t),
            one: edges_in_window(self.one, start, t),
        });
        self.current_start = Some(t);
        window
    }

    pub fn build_all(mut self, starts: &[f64]) -> Vec<TrialWindow> {
        starts
            .iter()
            .filter_map(|&t| self.append_start(t))
            .collect()
    }
}

/// Segment a device recording into trials and decode each trial's number.
///
/// Trials are windows between consecutive trial-start falling edges. Photodiode
/// delays are matched per falling edge; if more than the device failure fraction is
/// missing the photodiode is presumed faulty and all delays are dropped.
pub fn extract_device_trials(
    name: &str,
    events: &DeviceSyncEvents,
    thresholds: &Thresholds,
) -> Result<Vec<TrialRecord>, DeviceTrialsError> {
    let start = detect_edges(&events.trial_start)?.at_rate(events.sample_rate);
    let phase = detect_edges(&events.phase)?.at_rate(events.sample_rate);
    let zero = detect_edges(&events.trial_num_zero)?.at_rate(events.sample_rate);
    let one = detect_edges(&events.trial_num_one)?.at_rate(events.sample_rate);

    if start.off.len() < 2 {
        return Err(DeviceTrialsError::TooFewStartEdges(
            name.to_string(),
            start.off.len(),
        ));
    }

    let windows = WindowBuilder::new(&phase, &zero, &one).build_all(&start.off);
    log::info!("{name}: computing {} trials", windows.len());

    let decoder = TrialNumberDecoder::calibrate(&windows, thresholds.time_unit_rtol)?;

    let locator = PhotodiodeLocator::new(
        thresholds.photodiode_match_window,
        thresholds.photodiode_failure_fraction,
    );
    let photodiode_delays = match &events.photodiode {
        Some(trace) => locator.delays(&trace.values, &trace.times(), &start.on, &start.off)?,
        None => {
            log::warn!("{name}: no photodiode recorded");
            vec![None; start.off.len()]
        }
    };
    if photodiode_delays.len() != windows.len() + 1 {
        return Err(DeviceTrialsError::PhotodiodeLength(
            photodiode_delays.len(),
            start.off.len(),
        ));
    }

    let offset = events.fixed_delay - events.record_start_time;
    let mut trials: Vec<TrialRecord> = windows
        .iter()
        .zip(photodiode_delays.iter())
        .map(|(window, delay)| {
            let mut trial = TrialRecord::new(
                decoder.decode(&window.zero, &window.one),
                window.t_start + offset,
                window.t_end + offset,
                window.phase.on.clone(),
                *delay,
            );
            trial.noisy_trial_numbers = decoder.lost_ones;
            trial
        })
        .collect();

    let trial_nums: Vec<Option<i64>> = trials.iter().map(|t| t.trial_num).collect();
    let increment_threshold = if decoder.lost_ones {
        thresholds.increment_error_rate_degraded
    } else {
        thresholds.increment_error_rate
    };
    check_trial_numbers(
        &trial_nums,
        increment_threshold,
        thresholds.decode_failure_fraction,
    )?;

    let photodiode_errors = trials.iter().filter(|t| t.photodiode_delay.is_none()).count();
    log::info!("{name}: photodiode errors: {photodiode_errors}");
    if photodiode_errors as f64 > thresholds.device_photodiode_failure_fraction * trials.len() as f64
    {
        log::warn!("{name}: photodiode did not work. Dropping all photodiode delays.");
        for trial in trials.iter_mut() {
            trial.photodiode_delay = None;
        }
    }

    log::info!("{name}: total trials found: {}", trials.len());
    Ok(trials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial_number::tests::encode;

    fn paint(signal: &mut [u8], rate: f64, on: f64, off: f64) {
        let lo = (on * rate).round() as usize;
        let hi = (off * rate).round() as usize;
        signal[lo..hi].iter_mut().for_each(|s| *s = 1);
    }

    /// A device recording of `n` trials numbered from `first`, 2 s apart
    fn synthetic_device(n: usize, first: u32, lose_ones: bool) -> DeviceSyncEvents {
        let rate = 1000.0;
        let unit = 1.0 / 60.0;
        let len = ((n as f64 + 1.0) * 2.0 * rate) as usize + 2000;
        let mut events = DeviceSyncEvents {
            sample_rate: rate,
            trial_start: vec![0; len],
            phase: vec![0; len],
            trial_num_zero: vec![0; len],
            trial_num_one: vec![0; len],
            ..Default::default()
        };
        for k in 0..=n {
            let t = 1.0 + 2.0 * k as f64;
            paint(&mut events.trial_start, rate, t - 0.05, t);
            // one-frame phase pulse and a longer one
            paint(&mut events.phase, rate, t + 0.5, t + 0.5 + unit);
            paint(&mut events.phase, rate, t + 1.0, t + 1.1);
            if k < n {
                let (zero, one) = encode(first + k as u32, t + 0.1, unit);
                for (on, off) in zero.on.iter().zip(zero.off.iter()) {
                    paint(&mut events.trial_num_zero, rate, *on, *off);
                }
                if !lose_ones {
                    for (on, off) in one.on.iter().zip(one.off.iter()) {
                        paint(&mut events.trial_num_one, rate, *on, *off);
                    }
                }
            }
        }
        events
    }

    #[test]
    fn test_window_builder_half_open() {
        let phase = EdgeTimes {
            on: vec![0.5, 1.0, 1.5],
            off: vec![0.6, 1.1, 1.6],
        };
        let empty = EdgeTimes::default();
        let windows = WindowBuilder::new(&phase, &empty, &empty).build_all(&[0.0, 1.0, 2.0]);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].phase.on, vec![0.5]);
        assert_eq!(windows[1].phase.on, vec![0.0, 0.5]);
        assert_eq!(windows[1].t_end, 2.0);
    }

    #[test]
    fn test_device_trials_decoded() {
        let events = synthetic_device(40, 100, false);
        let trials = extract_device_trials("spikeglx", &events, &Thresholds::default()).unwrap();
        assert_eq!(trials.len(), 40);
        for (k, trial) in trials.iter().enumerate() {
            assert_eq!(trial.trial_num, Some(100 + k as i64));
            approx::assert_abs_diff_eq!(trial.t_start, 1.0 + 2.0 * k as f64, epsilon = 1e-9);
            assert_eq!(trial.relative_phase_times.len(), 2);
            assert!(trial.photodiode_delay.is_none());
            assert!(!trial.noisy_trial_numbers);
        }
    }

    #[test]
    fn test_device_trials_lost_ones() {
        let events = synthetic_device(40, 100, true);
        let trials = extract_device_trials("open_ephys", &events, &Thresholds::default()).unwrap();
        let correct = trials
            .iter()
            .enumerate()
            .filter(|(k, t)| t.trial_num == Some(100 + *k as i64))
            .count();
        assert!(correct >= 36, "{correct} of 40 decoded");
        assert!(trials.iter().all(|t| t.noisy_trial_numbers));
    }

    #[test]
    fn test_too_few_start_edges() {
        let mut events = synthetic_device(3, 0, false);
        events.trial_start = vec![0; events.trial_start.len()];
        assert!(matches!(
            extract_device_trials("spikeglx", &events, &Thresholds::default()),
            Err(DeviceTrialsError::TooFewStartEdges(_, 0))
        ));
    }
}
