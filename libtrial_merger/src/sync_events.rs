//! Locating and loading the inputs of one session.
//!
//! A session input directory is laid out as
//!
//! ```text
//! <data_path>/<subject>/<date>/
//! |---- behavior/segment_0.json, segment_1.json, ...
//! |---- stimulus/trials.json              (optional)
//! |---- devices/<name>/sync_events.json
//! |---- devices/<name>/spikes/<probe>/    (optional, one per probe)
//! ```
//!
//! Behavior segments are ordered by the number in their file name, which is the
//! order the controller was (re)started in.
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::behavior_trials::BehaviorLog;
use super::device_trials::DeviceSyncEvents;
use super::error::SyncEventsError;
use super::trial::StimulusRecord;

const BEHAVIOR_DIR: &str = "behavior";
const SEGMENT_PREFIX: &str = "segment_";
const STIMULUS_FILE: &str = "stimulus/trials.json";
const DEVICES_DIR: &str = "devices";
const SYNC_EVENTS_FILE: &str = "sync_events.json";
const SPIKES_DIR: &str = "spikes";

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, SyncEventsError> {
    if !path.exists() {
        return Err(SyncEventsError::BadFilePath(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str::<T>(&text).map_err(|e| SyncEventsError::ParsingError(path.to_path_buf(), e))
}

/// Files of one session, found but not yet read
#[derive(Debug, Clone)]
pub struct SessionInputs {
    pub dir: PathBuf,
    pub behavior_segments: Vec<PathBuf>,
    pub stimulus: Option<PathBuf>,
    /// Device name to device directory
    pub devices: BTreeMap<String, PathBuf>,
}

impl SessionInputs {
    /// Scan a session directory
    pub fn locate(dir: &Path) -> Result<Self, SyncEventsError> {
        if !dir.exists() {
            return Err(SyncEventsError::BadFilePath(dir.to_path_buf()));
        }

        let behavior_segments = Self::get_segment_stack(&dir.join(BEHAVIOR_DIR))?;
        if behavior_segments.is_empty() {
            return Err(SyncEventsError::NoBehaviorSegments(dir.join(BEHAVIOR_DIR)));
        }

        let stimulus = Some(dir.join(STIMULUS_FILE)).filter(|p| p.exists());

        let mut devices = BTreeMap::new();
        let devices_dir = dir.join(DEVICES_DIR);
        if devices_dir.exists() {
            for item in devices_dir.read_dir()? {
                let item_path = item?.path();
                if !item_path.join(SYNC_EVENTS_FILE).exists() {
                    continue;
                }
                if let Some(name) = item_path.file_name().and_then(|n| n.to_str()) {
                    devices.insert(name.to_string(), item_path.clone());
                }
            }
        }
        log::info!(
            "Found {} behavior segments, {} devices, stimulus log: {}",
            behavior_segments.len(),
            devices.len(),
            stimulus.is_some()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            behavior_segments,
            stimulus,
            devices,
        })
    }

    /// Segment files ordered by their number
    fn get_segment_stack(behavior_dir: &Path) -> Result<Vec<PathBuf>, SyncEventsError> {
        if !behavior_dir.exists() {
            return Ok(Vec::new());
        }
        let mut segments: Vec<(usize, PathBuf)> = Vec::new();
        for item in behavior_dir.read_dir()? {
            let item_path = item?.path();
            let number = item_path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(SEGMENT_PREFIX))
                .and_then(|s| s.parse::<usize>().ok());
            if let Some(number) = number {
                segments.push((number, item_path));
            }
        }
        segments.sort_by_key(|(number, _)| *number);
        Ok(segments.into_iter().map(|(_, path)| path).collect())
    }

    pub fn load_behavior(&self) -> Result<Vec<BehaviorLog>, SyncEventsError> {
        self.behavior_segments
            .iter()
            .map(|path| read_json::<BehaviorLog>(path))
            .collect()
    }

    pub fn load_stimulus(&self) -> Result<Option<Vec<StimulusRecord>>, SyncEventsError> {
        self.stimulus
            .as_deref()
            .map(read_json::<Vec<StimulusRecord>>)
            .transpose()
    }

    pub fn load_device(&self, name: &str) -> Result<DeviceSyncEvents, SyncEventsError> {
        let dir = self
            .devices
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.dir.join(DEVICES_DIR).join(name));
        read_json::<DeviceSyncEvents>(&dir.join(SYNC_EVENTS_FILE))
    }

    /// Probe name and directory of each spike-sorted probe of a device
    pub fn probe_dirs(&self, name: &str) -> Result<Vec<(String, PathBuf)>, SyncEventsError> {
        let Some(device_dir) = self.devices.get(name) else {
            return Ok(Vec::new());
        };
        let spikes_dir = device_dir.join(SPIKES_DIR);
        if !spikes_dir.exists() {
            return Ok(Vec::new());
        }
        let mut probes = Vec::new();
        for item in spikes_dir.read_dir()? {
            let item_path = item?.path();
            if !item_path.is_dir() {
                continue;
            }
            if let Some(probe) = item_path.file_name().and_then(|n| n.to_str()) {
                probes.push((probe.to_string(), item_path.clone()));
            }
        }
        probes.sort();
        Ok(probes)
    }
}
