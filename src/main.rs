use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};
use neuroslice::{Config, PreprocessingPipeline, SliceExtractor};

const DEFAULT_CONFIG: &str = "neuroslice.json";

fn run() -> neuroslice::Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = if path.exists() {
        info!("Reading configuration from {}", path.display());
        Config::from_file(&path)?
    } else {
        info!("No configuration at {}, using defaults", path.display());
        Config::default()
    };

    let pipeline = PreprocessingPipeline::from_config(config.preprocessing)?;
    pipeline.run()?.log_report("Preprocessing");

    SliceExtractor::new(config.slicing).run()?.log_report("Slicing");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
