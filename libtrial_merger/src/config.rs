use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::constants::*;
use super::error::ConfigError;

/// The tuned thresholds of every alignment stage.
///
/// There is one canonical set, shared by all stages and devices. Defaults come from
/// `constants`; a configuration file may override any of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub tail_length: usize,
    pub tail_agreement: f64,
    pub delta_rtol: f64,
    pub delta_match_fraction: f64,
    pub photodiode_match_window: f64,
    pub photodiode_failure_fraction: f64,
    pub device_photodiode_failure_fraction: f64,
    pub behavior_photodiode_failure_fraction: f64,
    pub clock_fit_threshold: f64,
    pub max_trial_offset: i64,
    pub min_fit_length: usize,
    pub min_segment_length: usize,
    pub slope_rtol: f64,
    pub stimulus_unmatched_cap: usize,
    pub time_unit_rtol: f64,
    pub decode_failure_fraction: f64,
    pub increment_error_rate: f64,
    pub increment_error_rate_degraded: f64,
    pub behavior_check_tail: usize,
    pub behavior_check_agreement: f64,
    pub first_phase_cutoff: f64,
    pub last_resort_window: usize,
    pub last_resort_unmatched_cap: usize,
    pub last_resort_phase_atol: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            tail_length: TAIL_LENGTH,
            tail_agreement: TAIL_AGREEMENT,
            delta_rtol: DELTA_RTOL,
            delta_match_fraction: DELTA_MATCH_FRACTION,
            photodiode_match_window: PHOTODIODE_MATCH_WINDOW,
            photodiode_failure_fraction: PHOTODIODE_FAILURE_FRACTION,
            device_photodiode_failure_fraction: DEVICE_PHOTODIODE_FAILURE_FRACTION,
            behavior_photodiode_failure_fraction: BEHAVIOR_PHOTODIODE_FAILURE_FRACTION,
            clock_fit_threshold: CLOCK_FIT_THRESHOLD,
            max_trial_offset: MAX_TRIAL_OFFSET,
            min_fit_length: MIN_FIT_LENGTH,
            min_segment_length: MIN_SEGMENT_LENGTH,
            slope_rtol: SLOPE_RTOL,
            stimulus_unmatched_cap: STIMULUS_UNMATCHED_CAP,
            time_unit_rtol: TIME_UNIT_RTOL,
            decode_failure_fraction: DECODE_FAILURE_FRACTION,
            increment_error_rate: INCREMENT_ERROR_RATE,
            increment_error_rate_degraded: INCREMENT_ERROR_RATE_DEGRADED,
            behavior_check_tail: BEHAVIOR_CHECK_TAIL,
            behavior_check_agreement: BEHAVIOR_CHECK_AGREEMENT,
            first_phase_cutoff: FIRST_PHASE_CUTOFF,
            last_resort_window: LAST_RESORT_WINDOW,
            last_resort_unmatched_cap: LAST_RESORT_UNMATCHED_CAP,
            last_resort_phase_atol: LAST_RESORT_PHASE_ATOL,
        }
    }
}

/// Corrections for one device in one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOverride {
    /// Leave the device out of this session entirely
    pub skip: bool,
    /// Number of leading device trials to splice out
    pub drop_leading: usize,
    /// Number of trailing device trials to splice out
    pub drop_trailing: usize,
    /// Trial starts closer than this (s) to their predecessor are duplicates
    pub min_pulse_gap: Option<f64>,
}

/// Per-session calibration, keyed by subject and date
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub subject: String,
    pub date: String,
    #[serde(default)]
    pub clock_fit_threshold: Option<f64>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceOverride>,
}

impl SessionConfig {
    pub fn new(subject: &str, date: &str) -> Self {
        Self {
            subject: subject.to_string(),
            date: date.to_string(),
            ..Default::default()
        }
    }

    pub fn device_override(&self, device: &str) -> DeviceOverride {
        self.devices.get(device).cloned().unwrap_or_default()
    }

    /// The session's clock fit threshold, falling back to the shared one
    pub fn clock_fit_threshold(&self, thresholds: &Thresholds) -> f64 {
        self.clock_fit_threshold
            .unwrap_or(thresholds.clock_fit_threshold)
    }
}

/// Structure representing the application configuration. Contains pathing and session information
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_path: PathBuf,
    pub output_path: PathBuf,
    pub sessions: Vec<SessionConfig>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl Default for Config {
    /// Generate a new Config object. Paths are placeholders and there is one example session
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("None"),
            output_path: PathBuf::from("None"),
            sessions: vec![SessionConfig::new("subject", "2024-01-01")],
            thresholds: Thresholds::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Find the calibration of a session. Sessions without an entry use the defaults
    pub fn session_config(&self, subject: &str, date: &str) -> SessionConfig {
        self.sessions
            .iter()
            .find(|s| s.subject == subject && s.date == date)
            .cloned()
            .unwrap_or_else(|| SessionConfig::new(subject, date))
    }

    /// Check if a session exists by evaluating the existance of its input directory
    pub fn does_session_exist(&self, session: &SessionConfig) -> bool {
        self.session_input_dir(session).exists()
    }

    pub fn session_input_dir(&self, session: &SessionConfig) -> PathBuf {
        self.data_path.join(&session.subject).join(&session.date)
    }

    pub fn session_output_dir(&self, session: &SessionConfig) -> PathBuf {
        self.output_path.join(&session.subject).join(&session.date)
    }
}
