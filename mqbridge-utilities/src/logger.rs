use std::{path::Path, time::SystemTime};

use log::LevelFilter;
use mqbridge_models::errors::SendableError;

/// Install the process-wide `fern` dispatcher writing to stdout and, when
/// given, to `log_file`.
pub fn setup_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    let mut dispatch = base_dispatch(level).chain(std::io::stdout());
    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}

fn base_dispatch(level: LevelFilter) -> fern::Dispatch {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // sqlx and the broker clients are chatty at info
        .level_for("sqlx", LevelFilter::Warn)
        .level_for("lapin", LevelFilter::Warn)
        .level_for("mongodb", LevelFilter::Warn)
}

/// Parse a `--log-level` style string, defaulting to `Info`.
pub fn parse_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|raw| raw.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels() {
        assert_eq!(parse_level(Some("debug")), LevelFilter::Debug);
        assert_eq!(parse_level(Some("WARN")), LevelFilter::Warn);
        assert_eq!(parse_level(Some("loud")), LevelFilter::Info);
        assert_eq!(parse_level(None), LevelFilter::Info);
    }
}
