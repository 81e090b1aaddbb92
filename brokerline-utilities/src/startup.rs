use std::{env, path::Path};

use log::{LevelFilter, info};

use crate::{errors::SendableError, logger};

/// Install logging and panic reporting, then print the banner.
pub fn startup(
    name: &str,
    level: LevelFilter,
    log_file: Option<&Path>,
) -> Result<(), SendableError> {
    unsafe {
        env::set_var("RUST_BACKTRACE", "1");
    }
    logger::setup_logger(level, log_file)?;
    log_panics::init();

    info!("--- {} ---", name);
    let cwd = env::current_dir()?;
    info!("The current directory is {}", cwd.display());

    Ok(())
}
