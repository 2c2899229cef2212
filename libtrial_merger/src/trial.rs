//! Trial records produced by the extractors and consumed by the aligner.
//!
//! Times are seconds on the clock of the device that produced the record. Missing
//! values are explicit: `None` for an undecoded trial number or an unmatched
//! photodiode flash, and NaN times (serialized as `null`) for session-break
//! placeholders.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialize NaN as `null` and read `null` back as NaN
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Timestamped samples of an analog variable within one trial, relative to the trial start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimedSamples {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

/// One trial window on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_num: Option<i64>,
    #[serde(with = "nan_as_null")]
    pub t_start: f64,
    #[serde(with = "nan_as_null")]
    pub t_end: f64,
    pub relative_phase_times: Vec<f64>,
    pub photodiode_delay: Option<f64>,
    #[serde(default)]
    pub noisy_trial_numbers: bool,
    /// Index of the behavior log segment the trial came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_num: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub analog: BTreeMap<String, TimedSamples>,
}

impl TrialRecord {
    pub fn new(
        trial_num: Option<i64>,
        t_start: f64,
        t_end: f64,
        relative_phase_times: Vec<f64>,
        photodiode_delay: Option<f64>,
    ) -> Self {
        Self {
            trial_num,
            t_start,
            t_end,
            relative_phase_times,
            photodiode_delay,
            noisy_trial_numbers: false,
            session_num: None,
            analog: BTreeMap::new(),
        }
    }

    /// Placeholder inserted between behavior log segments
    pub fn session_break() -> Self {
        Self::new(None, f64::NAN, f64::NAN, Vec::new(), None)
    }

    pub fn is_session_break(&self) -> bool {
        self.trial_num.is_none() && self.t_start.is_nan()
    }
}

/// The physiology fields merged into a unified trial for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysRecord {
    pub device_trial_num: Option<i64>,
    #[serde(with = "nan_as_null")]
    pub t_start: f64,
    #[serde(with = "nan_as_null")]
    pub t_end: f64,
    pub relative_phase_times: Vec<f64>,
}

impl From<&TrialRecord> for PhysRecord {
    fn from(record: &TrialRecord) -> Self {
        Self {
            device_trial_num: record.trial_num,
            t_start: record.t_start,
            t_end: record.t_end,
            relative_phase_times: record.relative_phase_times.clone(),
        }
    }
}

/// A trial as logged by the stimulus controller.
///
/// Only the running trial count is interpreted; everything else is carried through
/// untouched. A record without a count is a restart marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusRecord {
    pub total_trial_num: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One behavior trial with its matched stimulus and physiology records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTrial {
    pub trial_num: i64,
    #[serde(with = "nan_as_null")]
    pub t_start: f64,
    #[serde(with = "nan_as_null")]
    pub t_end: f64,
    pub relative_phase_times: Vec<f64>,
    pub photodiode_delay: Option<f64>,
    pub session_num: Option<usize>,
    pub stimulus: Option<StimulusRecord>,
    pub physiology: BTreeMap<String, PhysRecord>,
}

impl UnifiedTrial {
    pub fn from_behavior(trial_num: i64, record: &TrialRecord) -> Self {
        Self {
            trial_num,
            t_start: record.t_start,
            t_end: record.t_end,
            relative_phase_times: record.relative_phase_times.clone(),
            photodiode_delay: record.photodiode_delay,
            session_num: record.session_num,
            stimulus: None,
            physiology: BTreeMap::new(),
        }
    }

    /// Flat key/value form with every field prefixed by its source
    /// (`behavior_t_start`, `{device}_t_start`, ...)
    pub fn to_prefixed(&self) -> serde_json::Map<String, serde_json::Value> {
        use serde_json::{json, Value};

        let mut map = serde_json::Map::new();
        map.insert("behavior_trial_num".into(), json!(self.trial_num));
        map.insert("behavior_t_start".into(), json!(self.t_start));
        map.insert("behavior_t_end".into(), json!(self.t_end));
        map.insert(
            "behavior_relative_phase_times".into(),
            json!(self.relative_phase_times),
        );
        map.insert(
            "behavior_photodiode_delay".into(),
            json!(self.photodiode_delay),
        );
        map.insert("behavior_session_num".into(), json!(self.session_num));
        map.insert(
            "stimulus_data".into(),
            self.stimulus
                .as_ref()
                .and_then(|s| serde_json::to_value(s).ok())
                .unwrap_or(Value::Null),
        );
        for (device, record) in &self.physiology {
            map.insert(format!("{device}_t_start"), json!(record.t_start));
            map.insert(format!("{device}_t_end"), json!(record.t_end));
            map.insert(
                format!("{device}_relative_phase_times"),
                json!(record.relative_phase_times),
            );
        }
        map
    }
}
