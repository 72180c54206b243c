use std::path::Path;

use log::{info, LevelFilter};
use mqbridge_models::errors::SendableError;

use crate::logger;

/// Common process bootstrap: logging, panic capture, banner.
pub fn startup(
    name: &str,
    level: LevelFilter,
    log_file: Option<&Path>,
) -> Result<(), SendableError> {
    logger::setup_logger(level, log_file)?;
    log_panics::init();

    info!("--- {} ---", name);
    if let Some(path) = log_file {
        info!("Logging to {}", path.display());
    }
    Ok(())
}
