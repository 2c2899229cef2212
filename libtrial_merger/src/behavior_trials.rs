use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::config::Thresholds;
use super::edges::detect_edge_times;
use super::error::BehaviorTrialsError;
use super::photodiode::PhotodiodeLocator;
use super::trial::{TimedSamples, TrialRecord};

/// Variables of one behavior controller log segment as (time, value) samples.
///
/// The controller only logs a variable when it changes, so samples are not uniform
/// except for the photodiode. `analog` holds any extra variables (eye position, pupil
/// size) that are cut into trials and carried along.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorLog {
    pub sync_trial_start: Vec<(f64, f64)>,
    pub sync_phase: Vec<(f64, f64)>,
    pub total_trial_num: Vec<(f64, f64)>,
    #[serde(default)]
    pub photodiode: Vec<(f64, f64)>,
    #[serde(default)]
    pub analog: BTreeMap<String, Vec<(f64, f64)>>,
}

fn unzip(samples: &[(f64, f64)]) -> (Vec<f64>, Vec<f64>) {
    samples.iter().copied().unzip()
}

fn samples_in_window(samples: &[(f64, f64)], start: f64, end: f64) -> TimedSamples {
    let lo = samples.partition_point(|s| s.0 < start);
    let hi = samples.partition_point(|s| s.0 < end);
    let (times, values) = samples[lo..hi]
        .iter()
        .map(|(t, v)| (t - start, *v))
        .unzip();
    TimedSamples { times, values }
}

/// Fraction of the last `tail` trials whose inferred and expected numbers agree
fn tail_agreement(inferred: &[i64], expected: &[i64], tail: usize) -> f64 {
    let skip = inferred.len().saturating_sub(tail);
    let compared = inferred.len() - skip;
    if compared == 0 {
        return 1.0;
    }
    let agree = inferred[skip..]
        .iter()
        .zip(expected[skip..].iter())
        .filter(|(a, b)| a == b)
        .count();
    agree as f64 / compared as f64
}

/// Cut one behavior log segment into trials.
///
/// The logged trial number is the first `total_trial_num` sample in each window minus
/// one. The recorded number is the expected one: the first inferred number, then one
/// more per trial. Inferred and expected must mostly agree over the last trials.
pub fn extract_behavior_trials(
    segment: &BehaviorLog,
    session_num: usize,
    thresholds: &Thresholds,
) -> Result<Vec<TrialRecord>, BehaviorTrialsError> {
    if segment.sync_trial_start.is_empty() {
        return Err(BehaviorTrialsError::EmptyVariable("sync_trial_start"));
    }
    if segment.total_trial_num.is_empty() {
        return Err(BehaviorTrialsError::EmptyVariable("total_trial_num"));
    }

    let (start_times, start_values) = unzip(&segment.sync_trial_start);
    let start = detect_edge_times(&start_times, &start_values)?;
    let (phase_times, phase_values) = unzip(&segment.sync_phase);
    let phase = detect_edge_times(&phase_times, &phase_values)?;

    if start.off.len() < 2 {
        return Err(BehaviorTrialsError::TooFewStartEdges(start.off.len()));
    }
    let n_trials = start.off.len() - 1;

    let photodiode_delays = if segment.photodiode.is_empty() {
        log::warn!("Behavior segment {session_num} has no photodiode samples");
        None
    } else {
        let (times, values) = unzip(&segment.photodiode);
        let locator = PhotodiodeLocator::new(
            thresholds.photodiode_match_window,
            thresholds.photodiode_failure_fraction,
        );
        Some(locator.delays(&values, &times, &start.on, &start.off)?)
    };

    let mut trials = Vec::with_capacity(n_trials);
    let mut inferred = Vec::with_capacity(n_trials);
    let mut expected: Vec<i64> = Vec::with_capacity(n_trials);
    for (idx, window) in start.off.windows(2).enumerate() {
        let (t_start, t_end) = (window[0], window[1]);

        let lo = segment.total_trial_num.partition_point(|s| s.0 < t_start);
        let logged = segment
            .total_trial_num
            .get(lo)
            .filter(|s| s.0 < t_end)
            .ok_or(BehaviorTrialsError::MissingTrialNumber(idx))?;
        let trial_num = logged.1 as i64 - 1;
        inferred.push(trial_num);
        let expected_num = expected.last().map_or(trial_num, |n| n + 1);
        expected.push(expected_num);

        let lo = phase.on.partition_point(|&t| t < t_start);
        let hi = phase.on.partition_point(|&t| t < t_end);
        let relative_phase_times = phase.on[lo..hi].iter().map(|t| t - t_start).collect();

        let delay = photodiode_delays.as_ref().and_then(|d| d[idx]);
        let mut trial = TrialRecord::new(
            Some(expected_num),
            t_start,
            t_end,
            relative_phase_times,
            delay,
        );
        trial.session_num = Some(session_num);
        trial.analog = segment
            .analog
            .iter()
            .map(|(name, samples)| (name.clone(), samples_in_window(samples, t_start, t_end)))
            .collect();
        trials.push(trial);
    }

    let rate = tail_agreement(&inferred, &expected, thresholds.behavior_check_tail);
    if rate < thresholds.behavior_check_agreement {
        return Err(BehaviorTrialsError::InferredMismatch {
            rate,
            threshold: thresholds.behavior_check_agreement,
        });
    }

    if photodiode_delays.is_some() {
        let failures = trials.iter().filter(|t| t.photodiode_delay.is_none()).count();
        log::info!("Behavior segment {session_num}: photodiode errors: {failures}");
        if failures as f64 > thresholds.behavior_photodiode_failure_fraction * n_trials as f64 {
            return Err(BehaviorTrialsError::PhotodiodeFailures {
                failures,
                total: n_trials,
                threshold: thresholds.behavior_photodiode_failure_fraction,
            });
        }
    }

    log::info!(
        "Behavior segment {session_num}: {} trials, first trial number {:?}",
        trials.len(),
        trials.first().and_then(|t| t.trial_num)
    );
    Ok(trials)
}

/// Trial-start falling edges of consecutive trials: every start and the closing edge
/// of the last trial
pub fn start_edges(trials: &[TrialRecord]) -> Vec<f64> {
    let mut edges: Vec<f64> = trials.iter().map(|t| t.t_start).collect();
    if let Some(last) = trials.last() {
        edges.push(last.t_end);
    }
    edges
}

/// Join behavior segments, with a session-break placeholder between consecutive segments
pub fn concatenate_segments(segments: Vec<Vec<TrialRecord>>) -> Vec<TrialRecord> {
    let n_segments = segments.len();
    let mut trials = Vec::new();
    for (idx, segment) in segments.into_iter().enumerate() {
        trials.extend(segment);
        if idx + 1 < n_segments {
            trials.push(TrialRecord::session_break());
        }
    }
    trials
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// `n` trials 2 s apart, logged numbers starting at `first + 1`
    fn synthetic_log(n: usize, first: i64) -> BehaviorLog {
        let mut log = BehaviorLog::default();
        log.sync_trial_start.push((0.0, 0.0));
        log.sync_phase.push((0.0, 0.0));
        log.analog.insert("eye_h".to_string(), Vec::new());
        for k in 0..=n {
            let t = 10.0 + 2.0 * k as f64;
            log.sync_trial_start.push((t - 0.05, 1.0));
            log.sync_trial_start.push((t, 0.0));
            log.sync_phase.push((t + 0.2, 1.0));
            log.sync_phase.push((t + 0.25, 0.0));
            log.sync_phase.push((t + 0.9, 1.0));
            log.sync_phase.push((t + 0.95, 0.0));
            log.total_trial_num.push((t + 0.01, (first + k as i64 + 1) as f64));
            if let Some(eye) = log.analog.get_mut("eye_h") {
                eye.push((t + 0.5, k as f64));
            }
        }
        log
    }

    #[test]
    fn test_behavior_trials() {
        let log = synthetic_log(30, 7);
        let trials = extract_behavior_trials(&log, 2, &Thresholds::default()).unwrap();
        assert_eq!(trials.len(), 30);
        for (k, trial) in trials.iter().enumerate() {
            assert_eq!(trial.trial_num, Some(7 + k as i64));
            assert_eq!(trial.session_num, Some(2));
            approx::assert_abs_diff_eq!(trial.t_start, 10.0 + 2.0 * k as f64);
            assert_eq!(trial.relative_phase_times.len(), 2);
            approx::assert_abs_diff_eq!(trial.relative_phase_times[0], 0.2, epsilon = 1e-9);
            assert_eq!(trial.analog["eye_h"].values, vec![k as f64]);
            assert!(trial.photodiode_delay.is_none());
        }
    }

    #[test]
    fn test_expected_numbers_fill_gaps() {
        let mut log = synthetic_log(30, 0);
        // One mislogged number is overridden by the expected sequence
        log.total_trial_num[10].1 = 500.0;
        let trials = extract_behavior_trials(&log, 0, &Thresholds::default()).unwrap();
        assert_eq!(trials[10].trial_num, Some(10));
    }

    #[test]
    fn test_inferred_mismatch() {
        let mut log = synthetic_log(30, 0);
        for sample in log.total_trial_num.iter_mut().skip(5) {
            sample.1 += 3.0;
        }
        assert!(matches!(
            extract_behavior_trials(&log, 0, &Thresholds::default()),
            Err(BehaviorTrialsError::InferredMismatch { .. })
        ));
    }

    /// 1 ms photodiode samples with a 60 ms flash ending 30 ms after each start edge,
    /// leaving out the flashes of trials for which `missing` holds
    fn add_photodiode(log: &mut BehaviorLog, missing: impl Fn(usize) -> bool) {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 75_000;
        let mut values: Vec<f64> = (0..n).map(|_| 0.05 * rng.random::<f64>()).collect();
        let edges: Vec<f64> = log
            .sync_trial_start
            .iter()
            .filter(|s| s.1 == 0.0 && s.0 > 0.0)
            .map(|s| s.0)
            .collect();
        for (k, t) in edges.iter().enumerate() {
            if missing(k) {
                continue;
            }
            let end = ((t + 0.03) * 1000.0).round() as usize;
            values[end - 60..end].iter_mut().for_each(|v| *v += 1.0);
        }
        log.photodiode = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as f64 * 0.001, v))
            .collect();
    }

    #[test]
    fn test_photodiode_delays() {
        let mut log = synthetic_log(30, 0);
        add_photodiode(&mut log, |_| false);
        let trials = extract_behavior_trials(&log, 0, &Thresholds::default()).unwrap();
        for trial in trials {
            let delay = trial.photodiode_delay.unwrap();
            approx::assert_abs_diff_eq!(delay, 0.03, epsilon = 0.01);
        }
    }

    #[test]
    fn test_photodiode_failures() {
        let mut log = synthetic_log(30, 0);
        // 8 of the 30 trials have no flash
        add_photodiode(&mut log, |k| k % 4 == 1);
        match extract_behavior_trials(&log, 0, &Thresholds::default()) {
            Err(BehaviorTrialsError::PhotodiodeFailures {
                failures,
                total,
                threshold,
            }) => {
                assert_eq!(failures, 8);
                assert_eq!(total, 30);
                approx::assert_abs_diff_eq!(threshold, 0.1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_start_edges_keep_closing_edge() {
        let trials = extract_behavior_trials(&synthetic_log(30, 0), 0, &Thresholds::default()).unwrap();
        let edges = start_edges(&trials);
        assert_eq!(edges.len(), 31);
        approx::assert_abs_diff_eq!(edges[0], 10.0);
        approx::assert_abs_diff_eq!(edges[30], 70.0);
        assert!(start_edges(&[]).is_empty());
    }

    #[test]
    fn test_concatenate_inserts_breaks() {
        let a = extract_behavior_trials(&synthetic_log(5, 0), 0, &Thresholds::default()).unwrap();
        let b = extract_behavior_trials(&synthetic_log(4, 5), 1, &Thresholds::default()).unwrap();
        let joined = concatenate_segments(vec![a, b]);
        assert_eq!(joined.len(), 10);
        assert!(joined[5].is_session_break());
        assert_eq!(joined[6].session_num, Some(1));
        assert!(!joined[9].is_session_break());
    }
}
