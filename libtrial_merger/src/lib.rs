//! # trial_merger
//!
//! trial_merger puts the trials of a behavioral neurophysiology session on one clock.
//! A session is recorded by a behavior controller, an optional stimulus controller,
//! and one or more physiology acquisition devices, each with its own clock and its own
//! idea of where trials begin. The devices share a few digital sync lines (trial start,
//! task phase, and a binary trial number), and some also record a photodiode watching
//! the display. trial_merger reads those lines, works out which trial on each device
//! is which, fits the clock of every device to a common clock, and writes a unified
//! trial list together with the spikes of every sorted cluster, cut per trial.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) to install the tool chain.
//!
//! To build and install the CLI use `cargo install --path ./trial_merger_cli` from the
//! top level repository. The binary is installed to your cargo install location
//! (typically `~/.cargo/bin/`).
//!
//! ## Configuration
//!
//! A configuration file is YAML. `trial_merger_cli -p config.yml new` writes a
//! template:
//!
//! ```yml
//! data_path: /data
//! output_path: /processed
//! sessions:
//! - subject: Elgar
//!   date: 2022-06-01
//!   clock_fit_threshold: 3.0
//!   devices:
//!     open_ephys:
//!       skip: true
//!     spikeglx:
//!       drop_leading: 1
//!       min_pulse_gap: 0.1
//! thresholds:
//!   tail_agreement: 0.3
//! ```
//!
//! - `data_path`: contains one `<subject>/<date>/` directory per session
//! - `output_path`: receives one `<subject>/<date>/` directory per session
//! - `sessions`: the sessions to process, with per-session corrections. A device can be
//!   skipped, have known spurious trials spliced out at either end, or have duplicated
//!   trial start pulses removed before clock fitting.
//! - `thresholds`: the tuned thresholds of every stage. Any field left out keeps its
//!   default (see [`constants`]).
//!
//! ## Input
//!
//! ```text
//! <data_path>/<subject>/<date>/
//! |---- behavior/segment_#.json - sync_trial_start, sync_phase, total_trial_num, photodiode, analog
//! |---- stimulus/trials.json (optional) - total_trial_num, ...
//! |---- devices/<name>/sync_events.json - sample_rate, trial_start, phase, trial_num_zero, trial_num_one, photodiode, record_start_time, fixed_delay
//! |---- devices/<name>/spikes/<probe>/ - spike_times.bin, spike_clusters.bin, cluster_group.tsv, sample_rate
//! ```
//!
//! ## Output
//!
//! See [`session_writer::SessionWriter`]. Log messages go through the `log` facade;
//! the CLI prints them to the terminal. A session that fails is logged with the
//! reason and the remaining sessions are still processed. When a device cannot be
//! aligned unambiguously, the error names both trial counts; the deprecated
//! last-resort matcher (`trial_merger_cli review`) can then propose a correspondence
//! for a person to check.
pub mod aligner;
pub mod behavior_trials;
pub mod clock;
pub mod config;
pub mod constants;
pub mod device_trials;
pub mod edges;
pub mod error;
pub mod last_resort;
pub mod photodiode;
pub mod resync;
pub mod session;
pub mod session_status;
pub mod session_writer;
pub mod spikes;
pub mod stats;
pub mod sync_events;
pub mod trial;
pub mod trial_number;
