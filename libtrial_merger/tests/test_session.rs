mod common;
use approx::assert_abs_diff_eq;
use common::{build_session, build_split_session, DEVICE_OFFSET, SEGMENT_SHIFT, SUBJECT};
use libtrial_merger::clock::ClockTransform;
use libtrial_merger::config::SessionConfig;
use libtrial_merger::session::{process, process_session, review_device};
use libtrial_merger::trial::UnifiedTrial;
use std::sync::mpsc;

fn read_json(path: &std::path::Path) -> serde_json::Value {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|_| panic!("output not found: {}", path.display()));
    serde_json::from_str(&text).unwrap()
}

#[test]
fn session_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let (config, session) = build_session(root.path(), 40, 100);
    let (tx, rx) = mpsc::channel();
    process_session(&config, &session, 0, &tx).unwrap();

    let statuses: Vec<_> = rx.try_iter().collect();
    assert_eq!(statuses.first().map(|s| s.progress), Some(0.0));
    assert_eq!(statuses.last().map(|s| s.progress), Some(1.0));

    let out = config.session_output_dir(&session);
    let unified: Vec<UnifiedTrial> =
        serde_json::from_value(read_json(&out.join("trials.json"))).unwrap();
    assert_eq!(unified.len(), 40);
    for (k, trial) in unified.iter().enumerate() {
        assert_eq!(trial.trial_num, 100 + k as i64);
        let phys = &trial.physiology["spikeglx"];
        assert_eq!(phys.device_trial_num, Some(100 + k as i64));
        assert_abs_diff_eq!(phys.t_start - trial.t_start, DEVICE_OFFSET, epsilon = 1e-6);
        assert_eq!(phys.relative_phase_times.len(), 2);
    }

    let transform: ClockTransform =
        serde_json::from_value(read_json(&out.join("spikeglx_transform.json"))).unwrap();
    assert_eq!(transform.relative_trial_offset, 0);
    assert_abs_diff_eq!(transform.slope, 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(transform.intercept, -DEVICE_OFFSET, epsilon = 1e-3);

    let flat = read_json(&out.join("trials_flat.json"));
    assert!(flat[0].get("spikeglx_t_start").is_some());
    assert!(flat[0].get("behavior_t_start").is_some());

    let good = read_json(&out.join("spikes/spikeglx/imec0/cluster_1.json"));
    assert_eq!(good["label"], "good");
    let trials = good["trials"].as_array().unwrap();
    assert_eq!(trials.len(), 40);
    for trial in trials {
        let relative = trial["relative_spike_times"].as_array().unwrap();
        assert_eq!(relative.len(), 1);
        assert_abs_diff_eq!(relative[0].as_f64().unwrap(), 0.25, epsilon = 1e-3);
        assert_abs_diff_eq!(trial["fr_per_phase"][0].as_f64().unwrap(), 2.0, epsilon = 1e-6);
    }
    let mua = read_json(&out.join("spikes/spikeglx/imec0/cluster_2.json"));
    assert_eq!(mua["spike_times"].as_array().unwrap().len(), 20);
}

#[test]
fn restarted_behavior_segments_share_one_clock() {
    let root = tempfile::tempdir().unwrap();
    let (config, session) = build_split_session(root.path(), 40, 30);
    let (tx, _rx) = mpsc::channel();
    process_session(&config, &session, 0, &tx).unwrap();

    let out = config.session_output_dir(&session);
    let transform: ClockTransform =
        serde_json::from_value(read_json(&out.join("spikeglx_transform.json"))).unwrap();
    assert_eq!(transform.relative_trial_offset, 0);
    assert_abs_diff_eq!(transform.slope, 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(transform.intercept, -DEVICE_OFFSET, epsilon = 1e-3);
    assert!(transform.residual_std < 1e-3);

    let clock = read_json(&out.join("common_clock.json"));
    assert_eq!(clock["times"].as_array().unwrap().len(), 72);
    let second = &clock["segment_maps"][1];
    assert_abs_diff_eq!(second["intercept"].as_f64().unwrap(), SEGMENT_SHIFT, epsilon = 1e-3);

    let unified: Vec<UnifiedTrial> =
        serde_json::from_value(read_json(&out.join("trials.json"))).unwrap();
    assert_eq!(unified.len(), 70);
    assert_eq!(unified[40].trial_num, 141);
    assert_eq!(unified[40].session_num, Some(1));
    for trial in unified.iter() {
        let phys = &trial.physiology["spikeglx"];
        assert_eq!(phys.device_trial_num, Some(trial.trial_num));
        assert_abs_diff_eq!(phys.t_start - trial.t_start, DEVICE_OFFSET, epsilon = 1e-6);
    }
}

#[test]
fn failed_session_is_logged_and_skipped() {
    let root = tempfile::tempdir().unwrap();
    // Device numbers never agree with the behavior numbers
    let (mut config, session) = build_session(root.path(), 30, 900);
    config.sessions.insert(0, SessionConfig::new(SUBJECT, "2022-06-02"));
    let (tx, _rx) = mpsc::channel();
    process(config.clone(), tx).unwrap();

    let out = config.session_output_dir(&session);
    assert!(out.join("behavior_trials.json").exists());
    assert!(!out.join("trials.json").exists());
}

#[test]
fn review_proposes_correspondence() {
    let root = tempfile::tempdir().unwrap();
    let (config, session) = build_session(root.path(), 30, 900);
    let entries = review_device(&config, &session, "spikeglx").unwrap();
    assert_eq!(entries.len(), 30);
    assert_eq!(entries[5].device_index, Some(5));
    assert_eq!(entries[5].device_trial_num, Some(905));
    assert!(config
        .session_output_dir(&session)
        .join("spikeglx_review.json")
        .exists());
    assert!(review_device(&config, &session, "open_ephys").is_err());
}
