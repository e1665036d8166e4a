use clap::{Parser, ValueEnum};
use log::LevelFilter;

/// Log level options for command-line argument.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Common command-line arguments for Keel applications.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct EngineArgs {
    /// Set the log verbosity level
    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Force synchronous uploads and a GPU idle after every frame
    #[arg(long = "safe-mode")]
    pub safe_mode: bool,

    /// Number of frames the CPU may record ahead of the GPU
    #[arg(long = "frames-in-flight", value_parser = clap::value_parser!(u32).range(1..=4))]
    pub frames_in_flight: Option<u32>,

    /// Additional positional arguments passed to the application
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

impl EngineArgs {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_flags() {
        let args = EngineArgs::parse_from(["keel"]);
        assert!(matches!(args.log_level, LogLevel::Info));
        assert!(!args.safe_mode);
        assert_eq!(args.frames_in_flight, None);
    }

    #[test]
    fn parses_frame_flags() {
        let args = EngineArgs::parse_from(["keel", "--safe-mode", "--frames-in-flight", "3", "-l", "debug"]);
        assert!(args.safe_mode);
        assert_eq!(args.frames_in_flight, Some(3));
        assert_eq!(LevelFilter::from(args.log_level), LevelFilter::Debug);
    }

    #[test]
    fn rejects_out_of_range_frames_in_flight() {
        assert!(EngineArgs::try_parse_from(["keel", "--frames-in-flight", "9"]).is_err());
    }
}
