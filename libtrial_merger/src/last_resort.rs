//! Per-trial nearest-neighbor matcher for sessions the aligner cannot resolve.
//!
//! This matches each reference trial to a device trial in a small window ahead of the
//! last match, first by a unique decoded trial number and then by the shape of the
//! relative phase times. It produces false matches too often to run unattended, so it
//! is never part of the automatic pipeline; its output is written for a human to
//! review (`trial_merger_cli review`).
#![allow(deprecated)]

use super::config::Thresholds;
use super::error::AlignmentError;
use super::trial::TrialRecord;

fn all_close(a: &[f64], b: &[f64], atol: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= atol)
}

/// Whether a device trial's phase times look like the reference trial's.
///
/// The reference's last phase time (the reset) is ignored since it often differs
/// between devices. The device may carry an extra leading fixation pulse, so both the
/// first and the second device pulse are tried as the alignment point.
#[deprecated(note = "produces false matches; only for human-supervised review")]
pub fn match_relative_phase_times(reference: &[f64], candidate: &[f64], atol: f64) -> bool {
    let reference = &reference[..reference.len().saturating_sub(1)];
    let n = reference.len();
    if candidate.len() < n {
        return false;
    }
    if all_close(&candidate[..n], reference, atol) {
        return true;
    }
    candidate.len() > n && all_close(&candidate[1..n + 1], reference, atol)
}

/// Index of the device trial in `candidates` corresponding to `reference`, if any
#[deprecated(note = "produces false matches; only for human-supervised review")]
pub fn find_corresponding_trial(
    reference: &TrialRecord,
    candidates: &[TrialRecord],
    atol: f64,
) -> Option<usize> {
    if let Some(trial_num) = reference.trial_num {
        let mut same_num = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.trial_num == Some(trial_num));
        if let (Some((idx, _)), None) = (same_num.next(), same_num.next()) {
            return Some(idx);
        }
    }
    candidates.iter().position(|c| {
        match_relative_phase_times(
            &reference.relative_phase_times,
            &c.relative_phase_times,
            atol,
        )
    })
}

/// Propose a device trial index for every reference trial.
///
/// Each search covers the `last_resort_window` device trials following the previous
/// match. More than `last_resort_unmatched_cap` unmatched reference trials is an error.
#[deprecated(note = "produces false matches; only for human-supervised review")]
pub fn find_all_corresponding_trials(
    reference: &[TrialRecord],
    candidates: &[TrialRecord],
    thresholds: &Thresholds,
) -> Result<Vec<Option<usize>>, AlignmentError> {
    log::warn!("Running the last-resort trial matcher. Review its output before using it.");
    let mut start = 0;
    let mut matches = Vec::with_capacity(reference.len());
    for trial in reference {
        if start >= candidates.len() {
            matches.push(None);
            continue;
        }
        let end = (start + thresholds.last_resort_window).min(candidates.len());
        match find_corresponding_trial(
            trial,
            &candidates[start..end],
            thresholds.last_resort_phase_atol,
        ) {
            Some(offset) => {
                matches.push(Some(start + offset));
                start += offset + 1;
            }
            None => matches.push(None),
        }
    }

    let not_found = matches.iter().filter(|m| m.is_none()).count();
    if not_found > thresholds.last_resort_unmatched_cap {
        return Err(AlignmentError::LastResortUnmatched(
            not_found,
            thresholds.last_resort_unmatched_cap,
        ));
    }
    log::info!("Could not find corresponding device trial for {not_found} reference trials");
    Ok(matches)
}
