/// Shared helpers building synthetic session directories.
use byteorder::{LittleEndian, WriteBytesExt};
use libtrial_merger::behavior_trials::BehaviorLog;
use libtrial_merger::config::{Config, SessionConfig};
use libtrial_merger::device_trials::DeviceSyncEvents;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const SUBJECT: &str = "Elgar";
pub const DATE: &str = "2022-06-01";
/// Device clock minus behavior clock (s)
pub const DEVICE_OFFSET: f64 = -8.0;
pub const SPIKE_RATE: f64 = 30_000.0;
/// First behavior segment clock minus second segment clock (s)
pub const SEGMENT_SHIFT: f64 = 90.0;

/// `n + 1` trial start times on a 1 ms grid with irregular gaps
pub fn trial_starts(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ms: u64 = 10_000;
    (0..=n)
        .map(|_| {
            let t = ms as f64 / 1000.0;
            ms += 2000 + rng.random_range(0..=500u64);
            t
        })
        .collect()
}

/// Runs of (is_one, length) for `n` over 12 bit slots and a terminating zero
fn bit_runs(n: u32) -> Vec<(bool, usize)> {
    let mut runs: Vec<(bool, usize)> = Vec::new();
    for slot in 0..13 {
        let bit = slot < 12 && (n >> slot) & 1 == 1;
        match runs.last_mut() {
            Some((b, len)) if *b == bit => *len += 1,
            _ => runs.push((bit, 1)),
        }
    }
    runs
}

fn paint(signal: &mut [u8], rate: f64, on: f64, off: f64) {
    let lo = (on * rate).round() as usize;
    let hi = (off * rate).round() as usize;
    signal[lo..hi].iter_mut().for_each(|s| *s = 1);
}

/// Behavior controller log with trials starting at `starts`, numbered from `first`
pub fn behavior_log(starts: &[f64], first: i64) -> BehaviorLog {
    let mut log = BehaviorLog::default();
    log.sync_trial_start.push((0.0, 0.0));
    log.sync_phase.push((0.0, 0.0));
    for (k, &t) in starts.iter().enumerate() {
        log.sync_trial_start.push((t - 0.05, 1.0));
        log.sync_trial_start.push((t, 0.0));
        log.sync_phase.push((t + 0.5, 1.0));
        log.sync_phase.push((t + 0.55, 0.0));
        log.sync_phase.push((t + 1.0, 1.0));
        log.sync_phase.push((t + 1.1, 0.0));
        log.total_trial_num.push((t + 0.01, (first + k as i64 + 1) as f64));
    }
    log
}

/// 1 kHz device recording of the trials at `starts` shifted onto the device clock
pub fn device_events(starts: &[f64], first: u32) -> DeviceSyncEvents {
    let rate = 1000.0;
    let unit = 1.0 / 60.0;
    let last = starts.last().copied().unwrap_or(0.0) + DEVICE_OFFSET;
    let len = ((last + 3.0) * rate) as usize;
    let mut events = DeviceSyncEvents {
        sample_rate: rate,
        trial_start: vec![0; len],
        phase: vec![0; len],
        trial_num_zero: vec![0; len],
        trial_num_one: vec![0; len],
        ..Default::default()
    };
    for (k, start) in starts.iter().enumerate() {
        let t = start + DEVICE_OFFSET;
        paint(&mut events.trial_start, rate, t - 0.05, t);
        paint(&mut events.phase, rate, t + 0.5, t + 0.5 + unit);
        paint(&mut events.phase, rate, t + 1.0, t + 1.1);
        if k + 1 < starts.len() {
            let mut onset = t + 0.1;
            for (is_one, len) in bit_runs(first + k as u32) {
                let channel = if is_one {
                    &mut events.trial_num_one
                } else {
                    &mut events.trial_num_zero
                };
                paint(channel, rate, onset, onset + len as f64 * unit);
                onset += len as f64 * unit;
            }
        }
    }
    events
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string(value).unwrap()).unwrap();
}

/// Sorter output with spikes at the given device-clock times
pub fn write_spikes(dir: &Path, spikes: &[(f64, u32)], labels: &[(u32, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    let mut times = File::create(dir.join("spike_times.bin")).unwrap();
    let mut clusters = File::create(dir.join("spike_clusters.bin")).unwrap();
    for (t, cluster) in spikes {
        times
            .write_u64::<LittleEndian>((t * SPIKE_RATE).round() as u64)
            .unwrap();
        clusters.write_u32::<LittleEndian>(*cluster).unwrap();
    }
    let mut tsv = File::create(dir.join("cluster_group.tsv")).unwrap();
    writeln!(tsv, "cluster_id\tgroup").unwrap();
    for (id, label) in labels {
        writeln!(tsv, "{id}\t{label}").unwrap();
    }
    std::fs::write(dir.join("sample_rate"), SPIKE_RATE.to_string()).unwrap();
}

/// A complete session of `n` trials with one device and one probe
pub fn build_session(root: &Path, n: usize, device_first: u32) -> (Config, SessionConfig) {
    let session_dir = root.join("data").join(SUBJECT).join(DATE);
    let starts = trial_starts(n, 11);
    write_json(
        &session_dir.join("behavior").join("segment_0.json"),
        &behavior_log(&starts, 100),
    );
    let device_dir = session_dir.join("devices").join("spikeglx");
    write_json(
        &device_dir.join("sync_events.json"),
        &device_events(&starts, device_first),
    );

    let mut spikes: Vec<(f64, u32)> = Vec::new();
    for (k, start) in starts[..n].iter().enumerate() {
        spikes.push((start + DEVICE_OFFSET + 0.25, 1));
        if k % 2 == 0 {
            spikes.push((start + DEVICE_OFFSET + 1.5, 2));
        }
    }
    write_spikes(
        &device_dir.join("spikes").join("imec0"),
        &spikes,
        &[(1, "good"), (2, "mua")],
    );

    session_config(root)
}

/// A session whose behavior controller restarted after `n_first` trials.
///
/// The second segment logs `n_second` trials on a clock `SEGMENT_SHIFT` behind the
/// first. The device records straight through, so its window spanning the restart
/// carries trial number `100 + n_first` that no behavior trial has.
pub fn build_split_session(
    root: &Path,
    n_first: usize,
    n_second: usize,
) -> (Config, SessionConfig) {
    let session_dir = root.join("data").join(SUBJECT).join(DATE);
    let starts = trial_starts(n_first + n_second + 1, 11);
    write_json(
        &session_dir.join("behavior").join("segment_0.json"),
        &behavior_log(&starts[..=n_first], 100),
    );
    let second: Vec<f64> = starts[n_first + 1..]
        .iter()
        .map(|t| t - SEGMENT_SHIFT)
        .collect();
    write_json(
        &session_dir.join("behavior").join("segment_1.json"),
        &behavior_log(&second, 100 + n_first as i64 + 1),
    );
    write_json(
        &session_dir
            .join("devices")
            .join("spikeglx")
            .join("sync_events.json"),
        &device_events(&starts, 100),
    );
    session_config(root)
}

fn session_config(root: &Path) -> (Config, SessionConfig) {
    let session = SessionConfig::new(SUBJECT, DATE);
    let config = Config {
        data_path: root.join("data"),
        output_path: root.join("out"),
        sessions: vec![session.clone()],
        ..Default::default()
    };
    (config, session)
}
