//! Spike-sorting output of one probe and its per-cluster and per-trial views.
//!
//! The sorter writes, per probe directory:
//!
//! ```text
//! spike_times.bin    - u64 little-endian sample index per spike
//! spike_clusters.bin - u32 little-endian cluster id per spike
//! cluster_group.tsv  - cluster_id<TAB>label, with a header line
//! sample_rate        - JSON float, samples per second
//! ```
use byteorder::{LittleEndian, ReadBytesExt};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::error::SpikesError;
use super::trial::UnifiedTrial;

const SPIKE_TIMES_FILE: &str = "spike_times.bin";
const SPIKE_CLUSTERS_FILE: &str = "spike_clusters.bin";
const CLUSTER_GROUP_FILE: &str = "cluster_group.tsv";
const SAMPLE_RATE_FILE: &str = "sample_rate";

#[derive(Debug, Clone, Default)]
pub struct SpikeSorting {
    pub sample_indices: Vec<u64>,
    pub clusters: Vec<u32>,
    pub labels: FxHashMap<u32, String>,
    pub sample_rate: f64,
}

fn open_sized(path: &Path, item_size: u64) -> Result<(BufReader<File>, usize), SpikesError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    if size % item_size != 0 {
        return Err(SpikesError::BadFileSize(path.to_path_buf(), size, item_size));
    }
    Ok((BufReader::new(file), (size / item_size) as usize))
}

fn read_u64_file(path: &Path) -> Result<Vec<u64>, SpikesError> {
    let (mut reader, count) = open_sized(path, 8)?;
    let mut values = vec![0u64; count];
    reader.read_u64_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

fn read_u32_file(path: &Path) -> Result<Vec<u32>, SpikesError> {
    let (mut reader, count) = open_sized(path, 4)?;
    let mut values = vec![0u32; count];
    reader.read_u32_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

fn read_cluster_labels(path: &Path) -> Result<FxHashMap<u32, String>, SpikesError> {
    let text = std::fs::read_to_string(path)?;
    let mut labels = FxHashMap::default();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let (id, label) = line
            .split_once('\t')
            .ok_or_else(|| SpikesError::BadLabelLine(line.to_string()))?;
        labels.insert(id.trim().parse::<u32>()?, label.trim().to_string());
    }
    Ok(labels)
}

impl SpikeSorting {
    /// Load the sorter output of one probe directory
    pub fn load(dir: &Path) -> Result<Self, SpikesError> {
        let sample_indices = read_u64_file(&dir.join(SPIKE_TIMES_FILE))?;
        let clusters = read_u32_file(&dir.join(SPIKE_CLUSTERS_FILE))?;
        if sample_indices.len() != clusters.len() {
            return Err(SpikesError::LengthMismatch(
                sample_indices.len(),
                clusters.len(),
            ));
        }
        let labels = read_cluster_labels(&dir.join(CLUSTER_GROUP_FILE))?;
        let sample_rate: f64 =
            serde_json::from_str(&std::fs::read_to_string(dir.join(SAMPLE_RATE_FILE))?)?;
        log::info!(
            "Loaded {} spikes in {} labeled clusters at {} Hz from {}",
            sample_indices.len(),
            labels.len(),
            sample_rate,
            dir.display()
        );
        Ok(Self {
            sample_indices,
            clusters,
            labels,
            sample_rate,
        })
    }
}

/// Group spike times by cluster id. Each cluster's times are sorted.
pub fn spike_times_per_cluster(
    times: &[f64],
    clusters: &[u32],
) -> Result<FxHashMap<u32, Vec<f64>>, SpikesError> {
    if times.len() != clusters.len() {
        return Err(SpikesError::LengthMismatch(times.len(), clusters.len()));
    }
    let mut per_cluster: FxHashMap<u32, Vec<f64>> = FxHashMap::default();
    for (t, cluster) in times.iter().zip(clusters.iter()) {
        per_cluster.entry(*cluster).or_default().push(*t);
    }
    for cluster_times in per_cluster.values_mut() {
        cluster_times.sort_by(|a, b| a.total_cmp(b));
    }
    Ok(per_cluster)
}

/// Spikes of one cluster in one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSpikes {
    pub trial_num: i64,
    pub t_start: f64,
    pub t_end: f64,
    pub relative_spike_times: Vec<f64>,
    /// Spikes per second over the whole trial
    pub fr: f64,
    /// Spikes per second between consecutive phase boundaries, starting at the trial start
    pub fr_per_phase: Vec<f64>,
}

/// Firing rate in each phase. Bins are [0, phase_0, phase_1, ...].
fn fr_per_phase(relative_spike_times: &[f64], relative_phase_times: &[f64]) -> Vec<f64> {
    std::iter::once(&0.0)
        .chain(relative_phase_times.iter())
        .zip(relative_phase_times.iter())
        .map(|(&start, &end)| {
            let count = relative_spike_times
                .iter()
                .filter(|&&t| t > start && t < end)
                .count();
            count as f64 / (end - start)
        })
        .collect()
}

/// Split a cluster's sorted common-clock spike times into trials.
///
/// Trial windows are the unified trials' common-clock start and end, shifted by the
/// behavior photodiode delay when there is one, so that time zero is the display change.
pub fn spike_times_per_trial(spike_times: &[f64], trials: &[UnifiedTrial]) -> Vec<TrialSpikes> {
    trials
        .iter()
        .map(|trial| {
            let delay = trial.photodiode_delay.unwrap_or(0.0);
            let t_start = trial.t_start + delay;
            let t_end = trial.t_end + delay;
            let lo = spike_times.partition_point(|&t| t < t_start);
            let hi = spike_times.partition_point(|&t| t < t_end).max(lo);
            let relative_spike_times: Vec<f64> =
                spike_times[lo..hi].iter().map(|t| t - t_start).collect();
            TrialSpikes {
                trial_num: trial.trial_num,
                t_start,
                t_end,
                fr: relative_spike_times.len() as f64 / (t_end - t_start),
                fr_per_phase: fr_per_phase(&relative_spike_times, &trial.relative_phase_times),
                relative_spike_times,
            }
        })
        .collect()
}
