pub use log::{trace, debug, info, warn, error, log_enabled, Level, LevelFilter};

/// Install the process-wide logger.
///
/// `RUST_LOG` still overrides `level` for individual modules.
pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        .filter_module("winit", LevelFilter::Warn)
        .filter_module("calloop", LevelFilter::Error)
        .filter_module("sctk", LevelFilter::Error)
        .parse_default_env()
        .try_init()?;

    Ok(())
}
