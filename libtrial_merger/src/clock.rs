//! Affine clock models between devices.
//!
//! Every device runs its own oscillator, so the same event has different timestamps on
//! different devices. Over a session the relation is linear: `t_target = slope *
//! t_source + intercept`. The relative trial offset between the two start sequences
//! is not known in advance and is found by searching small integer offsets for the
//! best fit.
use serde::{Deserialize, Serialize};

use super::config::Thresholds;
use super::error::ClockError;
use super::stats::{is_close, mean, std};
use super::trial::UnifiedTrial;

/// `t -> slope * t + intercept`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineMap {
    pub slope: f64,
    pub intercept: f64,
}

impl AffineMap {
    pub fn apply(&self, t: f64) -> f64 {
        self.slope * t + self.intercept
    }
}

/// Least-squares fit with its residual statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineFit {
    pub map: AffineMap,
    /// Population std of the residuals (s)
    pub residual_std: f64,
    pub max_error: f64,
}

/// The persisted transform from a device clock to the common clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockTransform {
    #[serde(rename = "coef")]
    pub slope: f64,
    pub intercept: f64,
    /// Index of the first device trial minus index of the first common trial
    #[serde(rename = "phys_start_index_minus_mworks_start_index")]
    pub relative_trial_offset: i64,
    #[serde(default)]
    pub residual_std: f64,
}

impl ClockTransform {
    pub fn map(&self) -> AffineMap {
        AffineMap {
            slope: self.slope,
            intercept: self.intercept,
        }
    }

    pub fn apply(&self, t: f64) -> f64 {
        self.map().apply(t)
    }
}

/// Ordinary least-squares fit of `target` against `source`.
///
/// A source without spread gives an infinite residual std so it never wins a search.
pub fn fit_affine(source: &[f64], target: &[f64]) -> Result<AffineFit, ClockError> {
    if source.len() != target.len() {
        return Err(ClockError::LengthMismatch(source.len(), target.len()));
    }
    let (Some(mean_s), Some(mean_t)) = (mean(source), mean(target)) else {
        return Err(ClockError::NoPairedTimes);
    };
    let mut cov = 0.0;
    let mut var = 0.0;
    for (s, t) in source.iter().zip(target.iter()) {
        cov += (s - mean_s) * (t - mean_t);
        var += (s - mean_s) * (s - mean_s);
    }
    if var <= 0.0 {
        return Ok(AffineFit {
            map: AffineMap {
                slope: f64::NAN,
                intercept: f64::NAN,
            },
            residual_std: f64::INFINITY,
            max_error: f64::INFINITY,
        });
    }
    let slope = cov / var;
    let map = AffineMap {
        slope,
        intercept: mean_t - slope * mean_s,
    };
    let residuals: Vec<f64> = source
        .iter()
        .zip(target.iter())
        .map(|(s, t)| t - map.apply(*s))
        .collect();
    Ok(AffineFit {
        map,
        residual_std: std(&residuals).unwrap_or(f64::INFINITY),
        max_error: residuals.iter().fold(0.0, |m, r| m.max(r.abs())),
    })
}

/// Overlapping parts of source and target when the source starts `offset` trials
/// after the target. Negative offsets drop leading source trials.
fn overlap<'a>(source: &'a [f64], target: &'a [f64], offset: i64) -> (&'a [f64], &'a [f64]) {
    let skip = offset.unsigned_abs() as usize;
    let (source, target) = if offset < 0 {
        (source.get(skip..).unwrap_or(&[]), target)
    } else {
        (source, target.get(skip..).unwrap_or(&[]))
    };
    let n = source.len().min(target.len());
    (&source[..n], &target[..n])
}

fn search_offsets(
    source: &[f64],
    target: &[f64],
    thresholds: &Thresholds,
) -> Result<(i64, AffineFit), ClockError> {
    let mut best: Option<(i64, AffineFit)> = None;
    for offset in -thresholds.max_trial_offset..=thresholds.max_trial_offset {
        let (s, t) = overlap(source, target, offset);
        if s.len() < thresholds.min_fit_length {
            continue;
        }
        let fit = fit_affine(s, t)?;
        if best
            .as_ref()
            .map_or(true, |(_, b)| fit.residual_std < b.residual_std)
        {
            best = Some((offset, fit));
        }
    }
    best.ok_or(ClockError::NoCandidateOffset(
        thresholds.max_trial_offset,
        thresholds.min_fit_length,
    ))
}

/// Find the offset and affine map from `source` times to `target` times.
///
/// If the best residual std is above `threshold`, the first element of both
/// sequences is dropped and the search runs once more (a single leading spurious
/// pulse); failing again is fatal.
pub fn find_clock_transform(
    source: &[f64],
    target: &[f64],
    threshold: f64,
    thresholds: &Thresholds,
) -> Result<ClockTransform, ClockError> {
    let (mut offset, mut fit) = search_offsets(source, target, thresholds)?;
    if fit.residual_std > threshold {
        log::warn!(
            "Residual std {:.4} s at offset {offset} is above {threshold} s; retrying without the first pulse",
            fit.residual_std
        );
        (offset, fit) = search_offsets(
            source.get(1..).unwrap_or(&[]),
            target.get(1..).unwrap_or(&[]),
            thresholds,
        )?;
        if fit.residual_std > threshold {
            return Err(ClockError::ResidualTooHigh {
                residual_std: fit.residual_std,
                offset,
                threshold,
            });
        }
    }
    log::info!(
        "Clock fit: offset {offset}, slope {:.8}, intercept {:.4}, residual std {:.2} ms, max error {:.2} ms",
        fit.map.slope,
        fit.map.intercept,
        1000.0 * fit.residual_std,
        1000.0 * fit.max_error
    );
    Ok(ClockTransform {
        slope: fit.map.slope,
        intercept: fit.map.intercept,
        relative_trial_offset: offset,
        residual_std: fit.residual_std,
    })
}

/// Behavior segments placed on one common clock
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainedClock {
    /// Map from each segment's clock to the common clock; None for segments too short to fit
    pub segment_maps: Vec<Option<AffineMap>>,
    /// Trial-start edges of the usable segments on the common clock, concatenated
    pub times: Vec<f64>,
}

/// Chain the trial-start edges of several behavior segments onto one common clock.
///
/// A segment holds every falling edge it logged, including the one closing its last
/// trial, so `n` edges make `n - 1` trials. Each usable segment is fit against the reference device's start times, walking
/// forward through them, which puts all segments on the reference clock. The
/// segment slopes must agree; the common clock is the reference clock mapped back
/// through the trial-weighted mean slope and the longest segment's intercept, so a
/// single segment's clock is returned unchanged.
pub fn chain_behavior_segments(
    segments: &[Vec<f64>],
    reference: &[f64],
    threshold: f64,
    thresholds: &Thresholds,
) -> Result<ChainedClock, ClockError> {
    let usable: Vec<usize> = (0..segments.len())
        .filter(|&i| segments[i].len().saturating_sub(1) > thresholds.min_segment_length)
        .collect();
    let Some(&longest) = usable.iter().max_by_key(|&&i| segments[i].len()) else {
        return Err(ClockError::NoUsableSegment(thresholds.min_segment_length));
    };

    let mut segment_maps: Vec<Option<AffineMap>> = vec![None; segments.len()];
    if usable.len() == 1 {
        segment_maps[longest] = Some(AffineMap {
            slope: 1.0,
            intercept: 0.0,
        });
        return Ok(ChainedClock {
            segment_maps,
            times: segments[longest].clone(),
        });
    }

    let mut to_reference: Vec<(usize, AffineMap)> = Vec::with_capacity(usable.len());
    let mut remaining = reference;
    for &i in &usable {
        let transform = find_clock_transform(&segments[i], remaining, threshold, thresholds)?;
        let advance = (segments[i].len() as i64 + transform.relative_trial_offset).max(0) as usize;
        remaining = remaining.get(advance..).unwrap_or(&[]);
        to_reference.push((i, transform.map()));
    }

    let slopes: Vec<f64> = to_reference.iter().map(|(_, m)| m.slope).collect();
    let max = slopes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = slopes.iter().copied().fold(f64::INFINITY, f64::min);
    if !is_close(max, min, thresholds.slope_rtol) {
        return Err(ClockError::SlopeDisagreement {
            max,
            min,
            rtol: thresholds.slope_rtol,
        });
    }

    let total: f64 = to_reference
        .iter()
        .map(|(i, _)| segments[*i].len() as f64)
        .sum();
    let common_slope = to_reference
        .iter()
        .map(|(i, m)| m.slope * segments[*i].len() as f64)
        .sum::<f64>()
        / total;
    let common_intercept = to_reference
        .iter()
        .find(|(i, _)| *i == longest)
        .map_or(0.0, |(_, m)| m.intercept);

    let mut times = Vec::new();
    for (i, map) in &to_reference {
        let to_common = AffineMap {
            slope: map.slope / common_slope,
            intercept: (map.intercept - common_intercept) / common_slope,
        };
        times.extend(segments[*i].iter().map(|t| to_common.apply(*t)));
        segment_maps[*i] = Some(to_common);
    }
    log::info!(
        "Chained {} behavior segments ({} start edges) with common slope {common_slope:.8}",
        to_reference.len(),
        times.len()
    );
    Ok(ChainedClock {
        segment_maps,
        times,
    })
}

/// Remove pulses closer than `min_gap` to the pulse before them
pub fn drop_duplicate_pulses(times: &[f64], min_gap: f64) -> Vec<f64> {
    let mut kept = Vec::with_capacity(times.len());
    for (idx, &t) in times.iter().enumerate() {
        if idx > 0 && t - times[idx - 1] < min_gap {
            continue;
        }
        kept.push(t);
    }
    if kept.len() < times.len() {
        log::warn!("Dropped {} duplicate pulses", times.len() - kept.len());
    }
    kept
}

/// Fit a device's trial starts against the common trial starts of the unified trials
/// where both exist
pub fn common_clock_mapping(unified: &[UnifiedTrial], device: &str) -> Result<AffineFit, ClockError> {
    let (source, target): (Vec<f64>, Vec<f64>) = unified
        .iter()
        .filter_map(|t| {
            t.physiology
                .get(device)
                .map(|p| (p.t_start, t.t_start))
        })
        .filter(|(s, t)| s.is_finite() && t.is_finite())
        .unzip();
    if source.len() < 2 {
        return Err(ClockError::NoPairedTimes);
    }
    let fit = fit_affine(&source, &target)?;
    log::info!(
        "{device}: common clock residual std {:.2} ms, max error {:.2} ms over {} trials",
        1000.0 * fit.residual_std,
        1000.0 * fit.max_error,
        source.len()
    );
    Ok(fit)
}
