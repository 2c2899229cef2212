use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use libtrial_merger::config::Config;
use libtrial_merger::session::{process, review_device};

fn make_template_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config)?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())?;
    Ok(())
}

fn main() {
    // Create a cli
    let matches = Command::new("trial_merger_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("review")
                .about("Propose a trial correspondence for one device with the last-resort matcher. The output must be checked by hand.")
                .arg(Arg::new("subject").long("subject").required(true))
                .arg(Arg::new("date").long("date").required(true))
                .arg(Arg::new("device").long("device").required(true)),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }

    // Parse the cli
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A configuration path is required");
        return;
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match make_template_config(&config_path) {
            Ok(()) => log::info!("Done."),
            Err(e) => log::error!("Could not write template config: {e}"),
        }
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Data Path: {}", config.data_path.to_string_lossy());
    log::info!("Output Path: {}", config.output_path.to_string_lossy());
    log::info!("Sessions: {}", config.sessions.len());

    if let Some(("review", args)) = matches.subcommand() {
        let (Some(subject), Some(date), Some(device)) = (
            args.get_one::<String>("subject"),
            args.get_one::<String>("date"),
            args.get_one::<String>("device"),
        ) else {
            log::error!("review requires --subject, --date and --device");
            return;
        };
        let session = config.session_config(subject, date);
        match review_device(&config, &session, device) {
            Ok(entries) => {
                let unmatched = entries.iter().filter(|e| e.device_index.is_none()).count();
                log::info!(
                    "Proposed a correspondence for {} behavior trials ({unmatched} unmatched). Check it before use.",
                    entries.len()
                );
            }
            Err(e) => log::error!("Review failed with error: {e}"),
        }
        return;
    }

    // Setup the progress bar
    let n_sessions = config.sessions.len().max(1);
    let pb = pb_manager.add(ProgressBar::new((n_sessions * 100) as u64));
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>4}/{len:4} {msg}") {
        pb.set_style(style);
    }
    let (tx, rx) = mpsc::channel();
    // Spawn the task!
    let handle = std::thread::spawn(move || process(config, tx));

    loop {
        // No UI to drive updates, so poll the channel a few times a second
        std::thread::sleep(std::time::Duration::from_millis(250));
        for status in rx.try_iter() {
            pb.set_position((status.session_index * 100) as u64 + (status.progress * 100.0) as u64);
            pb.set_message(format!("{} ({})", status.label, status.stage));
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(_) => log::info!("Finished processing sessions!"),
                    Err(e) => log::error!("Processing failed with error: {e}"),
                },
                Err(_) => log::error!("Failed to join processing task!"),
            }
            break;
        }
    }

    pb.finish();

    log::info!("Done.");
}
