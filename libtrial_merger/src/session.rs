use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use super::aligner::{align_device_trials, curate_phase_times, match_stimulus_trials, merge_unified};
use super::behavior_trials::{concatenate_segments, extract_behavior_trials, start_edges};
use super::clock::{
    chain_behavior_segments, common_clock_mapping, drop_duplicate_pulses, find_clock_transform,
    ChainedClock,
};
use super::config::{Config, DeviceOverride, SessionConfig, Thresholds};
use super::device_trials::extract_device_trials;
use super::error::SessionError;
use super::resync::resync_spike_times;
use super::session_status::{SessionStatus, Stage};
use super::session_writer::{ReviewEntry, SessionWriter};
use super::spikes::{spike_times_per_cluster, spike_times_per_trial, SpikeSorting};
use super::sync_events::SessionInputs;
use super::trial::{TrialRecord, UnifiedTrial};

/// Trials of one physiology device, on its recording-relative clock
#[derive(Debug, Clone)]
struct DeviceTrials {
    name: String,
    fixed_delay: f64,
    min_pulse_gap: Option<f64>,
    trials: Vec<TrialRecord>,
}

impl DeviceTrials {
    /// Trial-start edges used for clock fitting, without duplicated pulses
    fn clock_starts(&self) -> Vec<f64> {
        let starts = start_edges(&self.trials);
        match self.min_pulse_gap {
            Some(gap) => drop_duplicate_pulses(&starts, gap),
            None => starts,
        }
    }
}

/// Everything extracted from the raw inputs of a session, phase times curated
#[derive(Debug, Clone)]
struct SessionTrials {
    /// Trial-start edges of each behavior segment on its own clock
    segment_starts: Vec<Vec<f64>>,
    behavior: Vec<TrialRecord>,
    devices: Vec<DeviceTrials>,
}

/// Splice out known spurious trials at either end of a device recording
fn apply_override(name: &str, mut trials: Vec<TrialRecord>, device: &DeviceOverride) -> Vec<TrialRecord> {
    if device.drop_leading == 0 && device.drop_trailing == 0 {
        return trials;
    }
    log::warn!(
        "{name}: dropping {} leading and {} trailing trials per session configuration",
        device.drop_leading,
        device.drop_trailing
    );
    let end = trials.len().saturating_sub(device.drop_trailing);
    trials.truncate(end);
    let start = device.drop_leading.min(trials.len());
    trials.drain(..start);
    trials
}

fn extract_session(
    inputs: &SessionInputs,
    session: &SessionConfig,
    thresholds: &Thresholds,
) -> Result<SessionTrials, SessionError> {
    let mut segments = Vec::with_capacity(inputs.behavior_segments.len());
    for (session_num, segment) in inputs.load_behavior()?.iter().enumerate() {
        segments.push(extract_behavior_trials(segment, session_num, thresholds)?);
    }
    let segment_starts: Vec<Vec<f64>> = segments
        .iter()
        .map(|segment| start_edges(segment))
        .collect();
    let mut behavior = concatenate_segments(segments);
    curate_phase_times(&mut behavior, thresholds.first_phase_cutoff);

    let mut devices = Vec::with_capacity(inputs.devices.len());
    for name in inputs.devices.keys() {
        let device = session.device_override(name);
        if device.skip {
            log::warn!("{name}: skipped per session configuration");
            continue;
        }
        let events = inputs.load_device(name)?;
        let trials = extract_device_trials(name, &events, thresholds)?;
        let mut trials = apply_override(name, trials, &device);
        curate_phase_times(&mut trials, thresholds.first_phase_cutoff);
        devices.push(DeviceTrials {
            name: name.clone(),
            fixed_delay: events.fixed_delay,
            min_pulse_gap: device.min_pulse_gap,
            trials,
        });
    }

    Ok(SessionTrials {
        segment_starts,
        behavior,
        devices,
    })
}

/// Put the unified behavior times on the common clock.
///
/// Trials of a segment too short to be chained get NaN times.
fn map_to_common_clock(unified: &mut [UnifiedTrial], clock: &ChainedClock) {
    for trial in unified.iter_mut() {
        match trial
            .session_num
            .and_then(|k| clock.segment_maps.get(k).copied().flatten())
        {
            Some(map) => {
                trial.t_start = map.apply(trial.t_start);
                trial.t_end = map.apply(trial.t_end);
            }
            None => {
                trial.t_start = f64::NAN;
                trial.t_end = f64::NAN;
            }
        }
    }
}

/// The main loop of trial_merger for one session.
///
/// Extracts the trials of every device, aligns them against the behavior controller,
/// fits the device clocks to the common clock, and writes the unified trials and spike
/// outputs. Progress is reported through `tx`.
pub fn process_session(
    config: &Config,
    session: &SessionConfig,
    session_index: usize,
    tx: &Sender<SessionStatus>,
) -> Result<(), SessionError> {
    let label = format!("{}/{}", session.subject, session.date);
    let thresholds = &config.thresholds;
    let clock_threshold = session.clock_fit_threshold(thresholds);
    tx.send(SessionStatus::new(0.0, session_index, &label, Stage::Extract))?;

    let inputs = SessionInputs::locate(&config.session_input_dir(session))?;
    let writer = SessionWriter::new(&config.session_output_dir(session))?;
    let SessionTrials {
        segment_starts,
        behavior,
        devices,
    } = extract_session(&inputs, session, thresholds)?;
    if devices.is_empty() {
        return Err(SessionError::NoPhysiologyDevices);
    }
    writer.write_behavior_trials(&behavior)?;

    tx.send(SessionStatus::new(0.2, session_index, &label, Stage::Align))?;
    let mut aligned: BTreeMap<String, Vec<Option<TrialRecord>>> = BTreeMap::new();
    for device in devices.iter() {
        log::info!("Aligning {} trials to behavior", device.name);
        let records = align_device_trials(&behavior, device.trials.clone(), thresholds)
            .into_result(&device.name)?;
        writer.write_device_trials(&device.name, &records)?;
        aligned.insert(device.name.clone(), records);
    }
    let stimulus = match inputs.load_stimulus()? {
        Some(records) => Some(match_stimulus_trials(
            &behavior,
            &records,
            thresholds.stimulus_unmatched_cap,
        )?),
        None => None,
    };
    let mut unified = merge_unified(&behavior, stimulus.as_deref(), &aligned);

    tx.send(SessionStatus::new(0.4, session_index, &label, Stage::Clock))?;
    let reference = &devices[0];
    log::info!("Chaining behavior segments on the {} clock", reference.name);
    let clock = chain_behavior_segments(
        &segment_starts,
        &reference.clock_starts(),
        clock_threshold,
        thresholds,
    )?;
    writer.write_common_clock(&clock)?;
    map_to_common_clock(&mut unified, &clock);

    let mut transforms = Vec::with_capacity(devices.len());
    for device in devices.iter() {
        log::info!("Fitting {} clock to the common clock", device.name);
        let transform =
            find_clock_transform(&device.clock_starts(), &clock.times, clock_threshold, thresholds)?;
        writer.write_transform(&device.name, &transform)?;
        match common_clock_mapping(&unified, &device.name) {
            Ok(fit) if fit.residual_std > clock_threshold => log::warn!(
                "{}: aligned trials disagree with the common clock, residual std {:.4} s",
                device.name,
                fit.residual_std
            ),
            Ok(_) => (),
            Err(e) => log::warn!("{}: could not check aligned trials: {e}", device.name),
        }
        transforms.push(transform);
    }
    let device_names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
    writer.write_unified_trials(&unified)?;
    writer.write_session_info(&session.subject, &session.date, &device_names, unified.len())?;

    tx.send(SessionStatus::new(0.6, session_index, &label, Stage::Spikes))?;
    for (device, transform) in devices.iter().zip(transforms.iter()) {
        for (probe, dir) in inputs.probe_dirs(&device.name)? {
            log::info!("Resynchronizing {} probe {probe}", device.name);
            let sorting = SpikeSorting::load(&dir)?;
            let times = resync_spike_times(
                &sorting.sample_indices,
                sorting.sample_rate,
                &transform.map(),
                device.fixed_delay,
            )?
            .to_vec();
            let per_cluster = spike_times_per_cluster(&times, &sorting.clusters)?;
            let mut cluster_ids: Vec<u32> = per_cluster.keys().copied().collect();
            cluster_ids.sort_unstable();
            for cluster_id in cluster_ids {
                let Some(cluster_times) = per_cluster.get(&cluster_id) else {
                    continue;
                };
                let per_trial = spike_times_per_trial(cluster_times, &unified);
                writer.write_cluster_spikes(
                    &device.name,
                    &probe,
                    cluster_id,
                    sorting.labels.get(&cluster_id).map(|l| l.as_str()),
                    cluster_times,
                    &per_trial,
                )?;
            }
            log::info!(
                "Wrote {} clusters of {} probe {probe}",
                per_cluster.len(),
                device.name
            );
        }
    }

    tx.send(SessionStatus::new(1.0, session_index, &label, Stage::Write))?;
    Ok(())
}

/// The function to be called by a separate thread (typically the CLI).
/// Processes every configured session in order. A failed session is logged and the
/// next one is processed; only a lost progress channel stops the loop.
pub fn process(config: Config, tx: Sender<SessionStatus>) -> Result<(), SessionError> {
    for (idx, session) in config.sessions.iter().enumerate() {
        if !config.does_session_exist(session) {
            log::info!(
                "Session {}/{} does not exist, skipping...",
                session.subject,
                session.date
            );
            continue;
        }
        log::info!("Processing session {}/{}...", session.subject, session.date);
        match process_session(&config, session, idx, &tx) {
            Ok(()) => log::info!(
                "Finished processing session {}/{}.",
                session.subject,
                session.date
            ),
            Err(SessionError::SendError(e)) => return Err(SessionError::SendError(e)),
            Err(e) => log::error!(
                "Session {}/{} failed: {e}",
                session.subject,
                session.date
            ),
        }
    }
    Ok(())
}

/// Run the last-resort matcher for one device of one session and write its proposal
/// to `<device>_review.json` in the session output directory.
///
/// This is for sessions the aligner reports as ambiguous. The proposal must be checked
/// by a person; nothing downstream reads it.
#[allow(deprecated)]
pub fn review_device(
    config: &Config,
    session: &SessionConfig,
    device: &str,
) -> Result<Vec<ReviewEntry>, SessionError> {
    let inputs = SessionInputs::locate(&config.session_input_dir(session))?;
    let trials = extract_session(&inputs, session, &config.thresholds)?;
    let candidates = trials
        .devices
        .iter()
        .find(|d| d.name == device)
        .ok_or_else(|| SessionError::UnknownDevice(device.to_string()))?;

    let matches = super::last_resort::find_all_corresponding_trials(
        &trials.behavior,
        &candidates.trials,
        &config.thresholds,
    )?;
    let entries: Vec<ReviewEntry> = trials
        .behavior
        .iter()
        .zip(matches.iter())
        .enumerate()
        .map(|(idx, (reference, candidate))| ReviewEntry {
            behavior_index: idx,
            behavior_trial_num: reference.trial_num,
            device_index: *candidate,
            device_trial_num: candidate.and_then(|c| candidates.trials[c].trial_num),
        })
        .collect();

    let writer = SessionWriter::new(&config.session_output_dir(session))?;
    writer.write_review(device, &entries)?;
    log::info!(
        "Wrote last-resort proposal for {device} ({} behavior trials) to {}",
        entries.len(),
        writer.dir().display()
    );
    Ok(entries)
}
