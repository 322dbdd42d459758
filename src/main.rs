// src/main.rs

use adas_pilot::lane_detection::build_detector;
use adas_pilot::playback::{self, PlaybackController, PlaybackSettings};
use adas_pilot::video_processor::build_backend;
use adas_pilot::Config;
use anyhow::Result;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("adas_pilot={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let config_path = Config::path_from_env();
    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let config = config.with_source_override(std::env::args().nth(1));

    init_logging(&config.logging.level);

    match run(&config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<u8> {
    info!("🚗 ADAS Pilot lane overlay starting");
    info!(
        "✓ Configuration loaded (backend: {:?}, source: {})",
        config.video.backend, config.video.source
    );

    let backend = build_backend(config)?;
    let detector = build_detector(&config.detector.command)?;
    info!("✓ Lane detector ready: {}", detector.name());

    let settings = PlaybackSettings::from_display_config(&config.display);
    let mut controller = PlaybackController::new(backend, detector, settings);

    // Failures are logged by the controller on the way to Closed
    let result = controller.run(&config.video.source);
    Ok(playback::exit_code(&result))
}
