// Tuned thresholds. These are the defaults of config::Thresholds; sessions override
// them through the YAML configuration rather than by editing these values.

/// Number of trailing trials compared on the equal-length fast path
pub const TAIL_LENGTH: usize = 300;
/// Minimum fraction of tail trial numbers that must agree on the fast path
pub const TAIL_AGREEMENT: f64 = 0.3;
/// Relative tolerance when comparing inter-trial start deltas
pub const DELTA_RTOL: f64 = 0.01;
/// Minimum fraction of compared deltas that must match for a prefix/suffix alignment
pub const DELTA_MATCH_FRACTION: f64 = 0.98;

/// Maximum distance (s) between a sync offset and the matched photodiode flash
pub const PHOTODIODE_MATCH_WINDOW: f64 = 0.1;
/// Above this fraction of unmatched trials the photodiode is presumed disconnected
pub const PHOTODIODE_FAILURE_FRACTION: f64 = 0.5;
/// Physiology devices discard all photodiode delays above this fraction of failures
pub const DEVICE_PHOTODIODE_FAILURE_FRACTION: f64 = 0.25;
/// Behavior controller aborts above this fraction of photodiode failures
pub const BEHAVIOR_PHOTODIODE_FAILURE_FRACTION: f64 = 0.1;

/// Nominal photodiode sample interval (s)
pub const PHOTODIODE_SAMPLE_INTERVAL: f64 = 0.001;
/// Relative tolerance on the photodiode sample interval
pub const PHOTODIODE_SAMPLE_RTOL: f64 = 0.5;
/// Moving-average window (samples)
pub const PHOTODIODE_SMOOTH_WINDOW: usize = 10;
/// Flash duration (samples at 1 ms)
pub const FLASH_DURATION: usize = 60;
/// Black guard before and after the flash (samples at 1 ms)
pub const FLASH_GUARD: usize = 50;
/// Lookahead (samples) for the MSE minimum within a below-threshold run
pub const FLASH_LOOKAHEAD: usize = 100;
/// Quantile excluded at each end when normalizing
pub const NORMALIZE_QUANTILE: f64 = 0.001;
/// Quantile used at each end to infer flash polarity
pub const POLARITY_QUANTILE: f64 = 0.002;

/// Number of bit slots in the trial number pulse envelope
pub const TRIAL_NUMBER_BIT_SLOTS: f64 = 13.0;
/// Quantile of per-trial minimal phase pulse durations used as the time unit
pub const TIME_UNIT_QUANTILE: f64 = 0.65;
/// Quantile of per-trial first trial number pulse onsets
pub const ENVELOPE_ON_QUANTILE: f64 = 0.3;
/// Quantile of per-trial last trial number pulse offsets
pub const ENVELOPE_OFF_QUANTILE: f64 = 0.7;
/// Relative tolerance between the estimated and the expected time unit
pub const TIME_UNIT_RTOL: f64 = 0.1;
/// Below this mean count of ones pulses per trial, the ones channel is considered lost
pub const LOST_ONES_MEAN_PULSES: f64 = 0.5;
/// Maximum fraction of consecutive trials whose numbers do not increment by one
pub const INCREMENT_ERROR_RATE: f64 = 0.4;
/// Same, when the ones channel was reconstructed
pub const INCREMENT_ERROR_RATE_DEGRADED: f64 = 0.7;
/// Maximum fraction of trials whose trial number could not be decoded
pub const DECODE_FAILURE_FRACTION: f64 = 0.25;

/// Number of trailing behavior trials checked for expected vs inferred numbers
pub const BEHAVIOR_CHECK_TAIL: usize = 100;
/// Minimum agreement between expected and inferred behavior trial numbers
pub const BEHAVIOR_CHECK_AGREEMENT: f64 = 0.8;

/// Default maximum residual std (s) of a clock fit
pub const CLOCK_FIT_THRESHOLD: f64 = 1.0;
/// Relative trial offsets searched in each direction
pub const MAX_TRIAL_OFFSET: i64 = 12;
/// Minimum overlapping trials for a candidate offset
pub const MIN_FIT_LENGTH: usize = 5;
/// Behavior segments with this many trials or fewer are ignored when chaining
pub const MIN_SEGMENT_LENGTH: usize = 5;
/// Relative tolerance between slopes of chained behavior segments
pub const SLOPE_RTOL: f64 = 0.001;

/// Maximum number of behavior trials without a stimulus-controller match
pub const STIMULUS_UNMATCHED_CAP: usize = 15;
/// Leading relative phase times below this value (s) are dropped
pub const FIRST_PHASE_CUTOFF: f64 = 0.35;

/// Absolute tolerance used with relative tolerances, as numpy does
pub const ATOL: f64 = 1.0e-8;

/// Candidate device trials searched per reference trial by the last-resort matcher
pub const LAST_RESORT_WINDOW: usize = 10;
/// Maximum reference trials the last-resort matcher may leave unmatched
pub const LAST_RESORT_UNMATCHED_CAP: usize = 10;
/// Absolute tolerance (s) when comparing relative phase times in the last-resort matcher
pub const LAST_RESORT_PHASE_ATOL: f64 = 1.0e-3;
