use std::{path::Path, str::FromStr, time::SystemTime};

use log::LevelFilter;

use crate::errors::{RuntimeError, SendableError};

pub fn setup_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
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
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// Parse `off`, `error`, `warn`, `info`, `debug` or `trace`, ignoring case.
pub fn parse_level(value: &str) -> Result<LevelFilter, RuntimeError> {
    LevelFilter::from_str(value.trim()).map_err(|_| {
        RuntimeError::new(
            "brokerline.logger.invalid_level",
            format!("Unknown log level '{value}'"),
        )
    })
}
