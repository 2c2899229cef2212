use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::clock::{ChainedClock, ClockTransform};
use super::error::WriterError;
use super::spikes::TrialSpikes;
use super::trial::{TrialRecord, UnifiedTrial};

const BEHAVIOR_TRIALS_NAME: &str = "behavior_trials.json";
const UNIFIED_TRIALS_NAME: &str = "trials.json";
const FLAT_TRIALS_NAME: &str = "trials_flat.json";
const COMMON_CLOCK_NAME: &str = "common_clock.json";
const SESSION_INFO_NAME: &str = "session.json";
const SPIKES_DIR: &str = "spikes";

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct SessionInfo<'a> {
    version: String,
    subject: &'a str,
    date: &'a str,
    devices: &'a [String],
    n_trials: usize,
}

#[derive(Debug, Serialize)]
struct ClusterSpikes<'a> {
    cluster_id: u32,
    label: Option<&'a str>,
    spike_times: &'a [f64],
    trials: &'a [TrialSpikes],
}

/// One proposed correspondence of the last-resort matcher
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewEntry {
    pub behavior_index: usize,
    pub behavior_trial_num: Option<i64>,
    pub device_index: Option<usize>,
    pub device_trial_num: Option<i64>,
}

/// Writes the outputs of one session as JSON files.
//
// Structure
// <output_path>/<subject>/<date>/
// |---- session.json - version, subject, date, devices, n_trials
// |---- behavior_trials.json
// |---- <device>_trials.json (index-aligned with behavior_trials.json)
// |---- trials.json, trials_flat.json
// |---- <device>_transform.json
// |---- common_clock.json
// |---- spikes/<device>/<probe>/cluster_<id>.json
#[derive(Debug)]
pub struct SessionWriter {
    dir: PathBuf,
}

impl SessionWriter {
    /// Create the writer, creating the output directory if needed
    pub fn new(dir: &Path) -> Result<Self, WriterError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), WriterError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write_session_info(
        &self,
        subject: &str,
        date: &str,
        devices: &[String],
        n_trials: usize,
    ) -> Result<(), WriterError> {
        let info = SessionInfo {
            version: format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION),
            subject,
            date,
            devices,
            n_trials,
        };
        self.write_json(&self.dir.join(SESSION_INFO_NAME), &info)
    }

    pub fn write_behavior_trials(&self, trials: &[TrialRecord]) -> Result<(), WriterError> {
        self.write_json(&self.dir.join(BEHAVIOR_TRIALS_NAME), trials)
    }

    /// Device trials aligned to the behavior trials; missing trials are `null`
    pub fn write_device_trials(
        &self,
        device: &str,
        trials: &[Option<TrialRecord>],
    ) -> Result<(), WriterError> {
        self.write_json(&self.dir.join(format!("{device}_trials.json")), trials)
    }

    /// Write the unified trials both nested and with prefixed flat keys
    pub fn write_unified_trials(&self, trials: &[UnifiedTrial]) -> Result<(), WriterError> {
        self.write_json(&self.dir.join(UNIFIED_TRIALS_NAME), trials)?;
        let flat: Vec<serde_json::Map<String, serde_json::Value>> =
            trials.iter().map(|t| t.to_prefixed()).collect();
        self.write_json(&self.dir.join(FLAT_TRIALS_NAME), &flat)
    }

    pub fn write_transform(
        &self,
        device: &str,
        transform: &ClockTransform,
    ) -> Result<(), WriterError> {
        self.write_json(&self.dir.join(format!("{device}_transform.json")), transform)
    }

    pub fn write_common_clock(&self, clock: &ChainedClock) -> Result<(), WriterError> {
        self.write_json(&self.dir.join(COMMON_CLOCK_NAME), clock)
    }

    pub fn write_review(&self, device: &str, entries: &[ReviewEntry]) -> Result<(), WriterError> {
        self.write_json(&self.dir.join(format!("{device}_review.json")), entries)
    }

    /// One file per cluster with its common-clock spike times and per-trial split
    pub fn write_cluster_spikes(
        &self,
        device: &str,
        probe: &str,
        cluster_id: u32,
        label: Option<&str>,
        spike_times: &[f64],
        trials: &[TrialSpikes],
    ) -> Result<(), WriterError> {
        let probe_dir = self.dir.join(SPIKES_DIR).join(device).join(probe);
        std::fs::create_dir_all(&probe_dir)?;
        let record = ClusterSpikes {
            cluster_id,
            label,
            spike_times,
            trials,
        };
        self.write_json(&probe_dir.join(format!("cluster_{cluster_id}.json")), &record)
    }
}
