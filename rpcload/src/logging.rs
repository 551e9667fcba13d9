use std::error::Error;

use log::LevelFilter;
use simple_logger::SimpleLogger;

/// Transport crates, silenced below the highest verbosity.
const TRANSPORT_MODULES: &[&str] = &["h2", "hyper", "tonic", "tower", "rustls"];

/// Maps the number of `-v` flags to the level of our own module tree.
#[inline]
fn level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Maps the number of `-v` flags to the level of transport crates.
#[inline]
fn transport_level(verbosity: u8) -> LevelFilter {
    if verbosity > 2 {
        LevelFilter::Trace
    } else {
        LevelFilter::Off
    }
}

/// Installs the global logger, must be called once.
pub fn init(verbosity: u8) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut logger = SimpleLogger::new()
        .with_level(LevelFilter::Off)
        .with_module_level("rpcload", level(verbosity))
        .with_utc_timestamps();

    for module in TRANSPORT_MODULES {
        logger = logger.with_module_level(module, transport_level(verbosity));
    }

    logger.init()?;

    log::debug!("logging initialized at {}", level(verbosity));

    Ok(())
}
