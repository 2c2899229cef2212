//! Trial correspondence between the behavior controller and the other devices.
//!
//! Device streams are almost always either exactly aligned or missing a contiguous
//! block of trials at one end (acquisition started late or stopped early). The aligner
//! only accepts those two situations. Anything else is returned as needing review:
//! guessing a correspondence would silently attach neural activity to the wrong trial.
use std::collections::BTreeMap;
use std::fmt;

use super::config::Thresholds;
use super::error::AlignmentError;
use super::stats::{diffs, fraction_close};
use super::trial::{PhysRecord, StimulusRecord, TrialRecord, UnifiedTrial};

/// What the aligner measured when it could not resolve a correspondence
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentDiagnostics {
    pub reference_len: usize,
    pub candidate_len: usize,
    /// Fraction of tail trial numbers that agreed (equal lengths only)
    pub tail_agreement: Option<f64>,
    /// Fraction of start deltas that matched with the gap at the end
    pub prefix_match: Option<f64>,
    /// Fraction of start deltas that matched with the gap at the start
    pub suffix_match: Option<f64>,
}

impl fmt::Display for AlignmentDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reference length {}, candidate length {}",
            self.reference_len, self.candidate_len
        )?;
        if let Some(rate) = self.tail_agreement {
            write!(f, ", tail agreement {rate:.3}")?;
        }
        if let Some(rate) = self.prefix_match {
            write!(f, ", prefix delta match {rate:.3}")?;
        }
        if let Some(rate) = self.suffix_match {
            write!(f, ", suffix delta match {rate:.3}")?;
        }
        Ok(())
    }
}

/// Result of aligning one device against the reference
#[derive(Debug, Clone, PartialEq)]
pub enum Alignment {
    /// One entry per reference trial; None where the device has no trial
    Aligned(Vec<Option<TrialRecord>>),
    /// The correspondence is ambiguous and needs a human
    NeedsReview(AlignmentDiagnostics),
}

impl Alignment {
    pub fn into_result(self, device: &str) -> Result<Vec<Option<TrialRecord>>, AlignmentError> {
        match self {
            Self::Aligned(records) => Ok(records),
            Self::NeedsReview(diagnostics) => Err(AlignmentError::Ambiguous {
                device: device.to_string(),
                reference_len: diagnostics.reference_len,
                candidate_len: diagnostics.candidate_len,
                diagnostics: diagnostics.to_string(),
            }),
        }
    }
}

/// Fraction of the last `tail` trials whose decoded numbers agree. Undecoded numbers
/// never agree.
fn tail_agreement(reference: &[TrialRecord], candidate: &[TrialRecord], tail: usize) -> f64 {
    let skip = reference.len().saturating_sub(tail);
    let compared = reference.len() - skip;
    if compared == 0 {
        return 0.0;
    }
    let agree = reference[skip..]
        .iter()
        .zip(candidate[skip..].iter())
        .filter(|(r, c)| r.trial_num.is_some() && r.trial_num == c.trial_num)
        .count();
    agree as f64 / compared as f64
}

fn start_deltas(trials: &[TrialRecord]) -> Vec<f64> {
    let starts: Vec<f64> = trials.iter().map(|t| t.t_start).collect();
    diffs(&starts)
}

/// Align a device's trials to the reference trials.
///
/// 1. Equal lengths are accepted as-is if enough tail trial numbers agree.
/// 2. Otherwise the shorter list's start deltas are compared against the start and
///    the end of the longer list's deltas. A match places the missing (or extra)
///    trials at the other end: a shorter candidate is padded, a longer one truncated.
/// 3. Anything else needs review.
pub fn align_device_trials(
    reference: &[TrialRecord],
    candidate: Vec<TrialRecord>,
    thresholds: &Thresholds,
) -> Alignment {
    let reference_len = reference.len();
    let candidate_len = candidate.len();
    let mut diagnostics = AlignmentDiagnostics {
        reference_len,
        candidate_len,
        tail_agreement: None,
        prefix_match: None,
        suffix_match: None,
    };

    if reference_len == candidate_len {
        let rate = tail_agreement(reference, &candidate, thresholds.tail_length);
        log::info!("Equal lengths ({reference_len}), tail trial number agreement {rate:.3}");
        if rate < thresholds.tail_agreement {
            diagnostics.tail_agreement = Some(rate);
            return Alignment::NeedsReview(diagnostics);
        }
        return Alignment::Aligned(candidate.into_iter().map(Some).collect());
    }

    if reference.is_empty() || candidate.is_empty() {
        return Alignment::NeedsReview(diagnostics);
    }

    let reference_deltas = start_deltas(reference);
    let candidate_deltas = start_deltas(&candidate);
    let rtol = thresholds.delta_rtol;
    let required = thresholds.delta_match_fraction;

    if candidate_len < reference_len {
        let remainder = reference_len - candidate_len;
        let n = candidate_deltas.len();

        let prefix = fraction_close(&candidate_deltas, &reference_deltas[..n], rtol);
        diagnostics.prefix_match = Some(prefix);
        if prefix >= required {
            log::info!("Candidate matches the reference start; padding {remainder} trials at the end");
            let mut aligned: Vec<Option<TrialRecord>> = candidate.into_iter().map(Some).collect();
            aligned.extend(std::iter::repeat(None).take(remainder));
            return Alignment::Aligned(aligned);
        }

        let suffix = fraction_close(
            &candidate_deltas,
            &reference_deltas[reference_deltas.len() - n..],
            rtol,
        );
        diagnostics.suffix_match = Some(suffix);
        if suffix >= required {
            log::info!("Candidate matches the reference end; padding {remainder} trials at the start");
            let mut aligned: Vec<Option<TrialRecord>> = vec![None; remainder];
            aligned.extend(candidate.into_iter().map(Some));
            return Alignment::Aligned(aligned);
        }
    } else {
        let remainder = candidate_len - reference_len;
        let n = candidate_deltas.len();

        let prefix = fraction_close(
            &candidate_deltas[..n - remainder],
            &reference_deltas,
            rtol,
        );
        diagnostics.prefix_match = Some(prefix);
        if prefix >= required {
            log::info!("Reference matches the candidate start; dropping {remainder} trailing candidate trials");
            let aligned = candidate
                .into_iter()
                .take(reference_len)
                .map(Some)
                .collect();
            return Alignment::Aligned(aligned);
        }

        let suffix = fraction_close(&candidate_deltas[remainder..], &reference_deltas, rtol);
        diagnostics.suffix_match = Some(suffix);
        if suffix >= required {
            log::info!("Reference matches the candidate end; dropping {remainder} leading candidate trials");
            let aligned = candidate.into_iter().skip(remainder).map(Some).collect();
            return Alignment::Aligned(aligned);
        }
    }

    log::warn!("Could not align trials: {diagnostics}");
    Alignment::NeedsReview(diagnostics)
}

/// Drop a leading relative phase time below `cutoff`.
///
/// A trial start pulse is sometimes echoed on the phase channel; after curation the
/// first relative phase time is the end of fixation on every device.
pub fn curate_phase_times(trials: &mut [TrialRecord], cutoff: f64) {
    for trial in trials.iter_mut() {
        if trial
            .relative_phase_times
            .first()
            .is_some_and(|t| *t < cutoff)
        {
            trial.relative_phase_times.remove(0);
        }
    }
}

/// Match each behavior trial to the stimulus controller record with the same trial count.
///
/// The stimulus list is walked forward only. A record without a count marks a
/// controller restart and pairs with the behavior trial at the same point (normally the
/// session-break placeholder). Behavior trials without a number, or whose number is not
/// found ahead, get None.
pub fn match_stimulus_trials(
    behavior: &[TrialRecord],
    stimulus: &[StimulusRecord],
    unmatched_cap: usize,
) -> Result<Vec<Option<StimulusRecord>>, AlignmentError> {
    let mut idx = 0;
    let mut matched = Vec::with_capacity(behavior.len());
    for trial in behavior {
        let Some(current) = stimulus.get(idx) else {
            matched.push(None);
            continue;
        };
        if current.total_trial_num.is_none() {
            idx += 1;
            matched.push(None);
            continue;
        }
        let Some(trial_num) = trial.trial_num else {
            matched.push(None);
            continue;
        };
        match stimulus[idx..]
            .iter()
            .position(|s| s.total_trial_num == Some(trial_num))
        {
            Some(offset) => {
                idx += offset;
                matched.push(Some(stimulus[idx].clone()));
            }
            None => matched.push(None),
        }
    }

    let not_found = matched.iter().filter(|m| m.is_none()).count();
    if not_found > unmatched_cap {
        return Err(AlignmentError::StimulusUnmatched(not_found, unmatched_cap));
    }
    if not_found > 0 {
        log::warn!("Could not find corresponding stimulus trial for {not_found} behavior trials");
    }
    Ok(matched)
}

/// Merge aligned device records into one unified trial per numbered behavior trial.
///
/// `stimulus` and every list in `devices` must be index-aligned with `behavior`.
/// Behavior trials without a number (session-break placeholders) are skipped. Device
/// photodiode delays are not carried: the behavior delay is the one used downstream.
pub fn merge_unified(
    behavior: &[TrialRecord],
    stimulus: Option<&[Option<StimulusRecord>]>,
    devices: &BTreeMap<String, Vec<Option<TrialRecord>>>,
) -> Vec<UnifiedTrial> {
    let mut unified = Vec::with_capacity(behavior.len());
    for (idx, record) in behavior.iter().enumerate() {
        let Some(trial_num) = record.trial_num else {
            continue;
        };
        let mut trial = UnifiedTrial::from_behavior(trial_num, record);
        trial.stimulus = stimulus.and_then(|s| s.get(idx).cloned().flatten());
        for (device, aligned) in devices {
            if let Some(Some(device_record)) = aligned.get(idx) {
                trial
                    .physiology
                    .insert(device.clone(), PhysRecord::from(device_record));
            }
        }
        unified.push(trial);
    }
    log::info!("Merged {} unified trials", unified.len());
    unified
}
