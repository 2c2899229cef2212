use std::path::PathBuf;
use thiserror::Error;

use super::session_status::SessionStatus;

#[derive(Debug, Clone, Error)]
pub enum SignalError {
    #[error("Input is not digital; found {count} non-digital samples, first at index {first_index} with value {first_value}")]
    NotDigital {
        count: usize,
        first_index: usize,
        first_value: f64,
    },
    #[error("Signal length mismatch -- values: {0} times: {1}")]
    LengthMismatch(usize, usize),
}

#[derive(Debug, Error)]
pub enum PhotodiodeError {
    #[error("Photodiode sample interval is {0} s but should be close to {1} s")]
    BadSampleInterval(f64, f64),
    #[error("Photodiode failed due to signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Photodiode signal has {0} samples, fewer than the flash template length {1}")]
    TooShort(usize, usize),
}

#[derive(Debug, Error)]
pub enum TrialNumberError {
    #[error("No trial contains usable phase pulses; cannot estimate the time unit")]
    NoPhasePulses,
    #[error("No trial contains trial number pulses; cannot estimate the pulse envelope")]
    NoTrialNumberPulses,
    #[error("Expected time unit is {expected}, but estimated time unit is {estimated} (relative tolerance {rtol})")]
    UnitMismatch {
        expected: f64,
        estimated: f64,
        rtol: f64,
    },
    #[error("Trial numbers do not increment. Error rate is {rate} (threshold {threshold}). Something is wrong with the sync variables or trial number decoding")]
    IncrementRate { rate: f64, threshold: f64 },
    #[error("Trial number decoding failed for {failures} of {total} trials (threshold fraction {threshold})")]
    TooManyFailures {
        failures: usize,
        total: usize,
        threshold: f64,
    },
}

#[derive(Debug, Error)]
pub enum DeviceTrialsError {
    #[error("Device {0} has {1} trial start edges; at least 2 are required to form a trial window")]
    TooFewStartEdges(String, usize),
    #[error("Device trials failed due to signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Device trials failed due to photodiode error: {0}")]
    Photodiode(#[from] PhotodiodeError),
    #[error("Device trials failed due to trial number error: {0}")]
    TrialNumber(#[from] TrialNumberError),
    #[error("Photodiode delays have length {0}, but there are {1} trial start edges")]
    PhotodiodeLength(usize, usize),
}

#[derive(Debug, Error)]
pub enum BehaviorTrialsError {
    #[error("Behavior log variable {0} has no samples")]
    EmptyVariable(&'static str),
    #[error("Behavior log has {0} trial start falling edges; at least 2 are required")]
    TooFewStartEdges(usize),
    #[error("Behavior trial {0} has no total_trial_num sample inside its window")]
    MissingTrialNumber(usize),
    #[error("Expected and inferred trial numbers agree on {rate} of the last trials, below {threshold}. Something went wrong with the trial number inference")]
    InferredMismatch { rate: f64, threshold: f64 },
    #[error("Photodiode failed for {failures} of {total} behavior trials (threshold fraction {threshold})")]
    PhotodiodeFailures {
        failures: usize,
        total: usize,
        threshold: f64,
    },
    #[error("Behavior trials failed due to signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Behavior trials failed due to photodiode error: {0}")]
    Photodiode(#[from] PhotodiodeError),
}

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Reference trials have length {reference_len}, but {device} trials have length {candidate_len}, so cannot easily align trials. Consider the last-resort matcher (trial_merger_cli review) under human supervision. Diagnostics: {diagnostics}")]
    Ambiguous {
        device: String,
        reference_len: usize,
        candidate_len: usize,
        diagnostics: String,
    },
    #[error("Could not find corresponding stimulus trial for {0} behavior trials (cap {1})")]
    StimulusUnmatched(usize, usize),
    #[error("Last-resort matcher could not find a corresponding trial for {0} reference trials (cap {1})")]
    LastResortUnmatched(usize, usize),
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("Source times have length {0} but target times have length {1}")]
    LengthMismatch(usize, usize),
    #[error("No relative trial offset within +/-{0} leaves at least {1} overlapping trials")]
    NoCandidateOffset(i64, usize),
    #[error("Minimum residual std is {residual_std} s at offset {offset}, which is above the threshold {threshold} s")]
    ResidualTooHigh {
        residual_std: f64,
        offset: i64,
        threshold: f64,
    },
    #[error("Behavior segment slopes disagree: max {max} min {min} (relative tolerance {rtol})")]
    SlopeDisagreement { max: f64, min: f64, rtol: f64 },
    #[error("No behavior segment has more than {0} trials")]
    NoUsableSegment(usize),
    #[error("No trials have times for both clocks")]
    NoPairedTimes,
}

#[derive(Debug, Error)]
pub enum SpikesError {
    #[error("Spikes failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Spike times have length {0} but spike clusters have length {1}")]
    LengthMismatch(usize, usize),
    #[error("Spike file {0:?} has {1} bytes, which is not a multiple of {2}")]
    BadFileSize(PathBuf, u64, u64),
    #[error("Cluster label file has a malformed line: {0}")]
    BadLabelLine(String),
    #[error("Spikes failed to parse an integer: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
    #[error("Spikes failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Sample rate {0} is not positive")]
    BadSampleRate(f64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum SyncEventsError {
    #[error("SyncEvents failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not load sync events because {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("SyncEvents did not find any behavior segments in {0:?}")]
    NoBehaviorSegments(PathBuf),
    #[error("SyncEvents failed to parse JSON in {0:?}: {1}")]
    ParsingError(PathBuf, serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("SessionWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("SessionWriter failed to convert to JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session failed due to config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Session failed due to SyncEvents error: {0}")]
    SyncEventsError(#[from] SyncEventsError),
    #[error("Session failed due to behavior trials error: {0}")]
    BehaviorError(#[from] BehaviorTrialsError),
    #[error("Session failed due to device trials error: {0}")]
    DeviceError(#[from] DeviceTrialsError),
    #[error("Session failed due to alignment error: {0}")]
    AlignmentError(#[from] AlignmentError),
    #[error("Session failed due to clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("Session failed due to spikes error: {0}")]
    SpikesError(#[from] SpikesError),
    #[error("Session failed due to SessionWriter error: {0}")]
    WriterError(#[from] WriterError),
    #[error("Session has no physiology devices left to define the common clock")]
    NoPhysiologyDevices,
    #[error("Session has no device named {0}")]
    UnknownDevice(String),
    #[error("Session failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<SessionStatus>),
}
