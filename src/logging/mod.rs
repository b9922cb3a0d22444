//! Logging module for ssh-agent-switcher
//!
//! All diagnostics go to stderr through tracing-subscriber. In daemon mode
//! stderr is the log file, so colors are only used when stderr is a
//! terminal.

use std::io::IsTerminal;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{Error, Result};

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level adjustment: -1 for quiet, 0 for normal, +1 for verbose
    pub verbosity: i8,
}

impl LogConfig {
    /// Create a new log configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the configuration from the command line flags; quiet wins
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        let config = Self::new();
        if quiet {
            config.quiet()
        } else if verbose {
            config.verbose()
        } else {
            config
        }
    }

    /// Set verbose mode (+1 verbosity)
    pub fn verbose(mut self) -> Self {
        self.verbosity = 1;
        self
    }

    /// Set quiet mode (-1 verbosity)
    pub fn quiet(mut self) -> Self {
        self.verbosity = -1;
        self
    }

    /// Get the minimum log level based on verbosity
    fn min_level(&self) -> Level {
        match self.verbosity {
            v if v < 0 => Level::WARN, // quiet: only warnings and errors
            0 => Level::INFO,          // normal: info and above
            _ => Level::DEBUG,         // verbose: debug and above
        }
    }
}

/// Initialize the logging subsystem
///
/// `RUST_LOG` still overrides the level chosen by the flags.
pub fn init(verbose: bool, quiet: bool) -> Result<()> {
    init_with_config(LogConfig::from_flags(verbose, quiet))
}

/// Initialize logging with full configuration
pub fn init_with_config(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.min_level().into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Other(format!("Failed to set global tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.min_level(), Level::INFO);
    }

    #[test]
    fn test_log_config_verbose() {
        let config = LogConfig::new().verbose();
        assert_eq!(config.verbosity, 1);
        assert_eq!(config.min_level(), Level::DEBUG);
    }

    #[test]
    fn test_log_config_quiet() {
        let config = LogConfig::new().quiet();
        assert_eq!(config.verbosity, -1);
        assert_eq!(config.min_level(), Level::WARN);
    }

    #[test]
    fn test_log_config_from_flags() {
        assert_eq!(LogConfig::from_flags(false, false).min_level(), Level::INFO);
        assert_eq!(LogConfig::from_flags(true, false).min_level(), Level::DEBUG);
        assert_eq!(LogConfig::from_flags(true, true).min_level(), Level::WARN);
    }
}
