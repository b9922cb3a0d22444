//! CLI module for ssh-agent-switcher
//!
//! This module provides the command-line interface using clap derive macros.

pub mod exit_code;
pub mod run;

use clap::{Command, CommandFactory, FromArgMatches, Parser};
use std::ffi::OsString;
use std::fmt::Write;
use std::path::PathBuf;

use crate::config::{self, Overrides, Settings};

/// Version string shown by `--version`
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\nBuilt with: ",
    env!("RUSTC_VERSION")
);

/// Stable SSH agent socket that follows forwarded agents across sessions
#[derive(Parser, Debug, Clone)]
#[command(name = "ssh-agent-switcher")]
#[command(author, version, about, long_about = None)]
#[command(long_version = LONG_VERSION)]
pub struct Cli {
    /// Path to the socket to listen on
    #[arg(long, value_name = "PATH")]
    pub socket_path: Option<PathBuf>,

    /// Colon-separated list of directories where to look for running agents
    #[arg(long, value_name = "DIR1:..:DIRN")]
    pub agents_dirs: Option<String>,

    /// Run in the background
    #[arg(long)]
    pub daemon: bool,

    /// Path to the file where to write logs in daemon mode
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Path to the PID file to create in daemon mode
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Configuration file path
    #[arg(long, value_name = "PATH", env = "SSH_AGENT_SWITCHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only report warnings and errors
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Set on the re-executed daemon child
    #[arg(long, hide = true)]
    pub detached: bool,
}

impl Cli {
    /// Parse the process arguments, showing resolved defaults in `--help`
    pub fn parse_with_defaults() -> Self {
        let matches = Self::command_with_defaults().get_matches();
        Self::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }

    /// Build the clap command with the defaults trailer attached
    pub fn command_with_defaults() -> Command {
        Self::command().after_help(defaults_trailer())
    }

    /// Values given explicitly on the command line
    pub fn overrides(&self) -> Overrides {
        Overrides {
            socket_path: self.socket_path.clone(),
            agents_dirs: self.agents_dirs.clone(),
            log_file: self.log_file.clone(),
            pid_file: self.pid_file.clone(),
        }
    }

    /// Arguments for the detached child
    ///
    /// Every setting is passed explicitly so that the child serves exactly
    /// what the parent waits for. The launcher appends the detached flag.
    pub fn child_args(&self, settings: &Settings) -> Vec<OsString> {
        let switcher = &settings.switcher;

        let mut agents_dirs = OsString::new();
        for (i, dir) in switcher.agents_dirs.iter().enumerate() {
            if i > 0 {
                agents_dirs.push(":");
            }
            agents_dirs.push(dir);
        }

        let mut args: Vec<OsString> = vec![
            "--daemon".into(),
            "--socket-path".into(),
            switcher.socket_path.clone().into(),
            "--agents-dirs".into(),
            agents_dirs,
            "--log-file".into(),
            settings.log_file.clone().into(),
            "--pid-file".into(),
            settings.pid_file.clone().into(),
        ];
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.clone().into());
        }
        if self.verbose {
            args.push("--verbose".into());
        }
        if self.quiet {
            args.push("--quiet".into());
        }
        args
    }
}

/// Describe the default values of the path flags, skipping unknown ones
fn defaults_trailer() -> String {
    let mut text = String::new();
    if let Ok(dirs) = config::default_agents_dirs() {
        let dirs: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
        let _ = writeln!(text, "If --agents-dirs is not set, the default list is {}", dirs.join(":"));
    }
    if let Ok(path) = config::default_log_file() {
        let _ = writeln!(text, "If --log-file is not set, the default path is {}", path.display());
    }
    if let Ok(path) = config::default_pid_file() {
        let _ = writeln!(text, "If --pid-file is not set, the default path is {}", path.display());
    }
    if let Ok(path) = config::default_socket_path() {
        let _ = writeln!(
            text,
            "If --socket-path is not set, the default path is {}",
            path.display()
        );
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitcherConfig;
    use crate::service::DETACHED_FLAG;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "ssh-agent-switcher",
            "--socket-path",
            "/tmp/s.sock",
            "--agents-dirs",
            "/a:/b",
            "--daemon",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(cli.socket_path, Some(PathBuf::from("/tmp/s.sock")));
        assert_eq!(cli.agents_dirs.as_deref(), Some("/a:/b"));
        assert!(cli.daemon);
        assert!(cli.verbose);
        assert!(!cli.detached);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        let result = Cli::try_parse_from(["ssh-agent-switcher", "--verbose", "--quiet"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_positional_arguments_rejected() {
        let result = Cli::try_parse_from(["ssh-agent-switcher", "extra"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_child_args_round_trip() {
        let cli = Cli::try_parse_from(["ssh-agent-switcher", "--daemon", "--quiet"]).unwrap();
        let settings = Settings {
            switcher: SwitcherConfig::new(
                "/tmp/s.sock",
                vec![PathBuf::from("/x/.ssh/agent"), PathBuf::from("/tmp")],
            ),
            log_file: PathBuf::from("/tmp/s.log"),
            pid_file: PathBuf::from("/tmp/s.pid"),
        };

        let mut argv: Vec<OsString> = vec!["ssh-agent-switcher".into()];
        argv.extend(cli.child_args(&settings));
        argv.push(DETACHED_FLAG.into());

        let child = Cli::try_parse_from(argv).unwrap();
        assert!(child.daemon);
        assert!(child.detached);
        assert!(child.quiet);
        assert_eq!(child.socket_path, Some(PathBuf::from("/tmp/s.sock")));
        assert_eq!(child.agents_dirs.as_deref(), Some("/x/.ssh/agent:/tmp"));
        assert_eq!(child.log_file, Some(PathBuf::from("/tmp/s.log")));
        assert_eq!(child.pid_file, Some(PathBuf::from("/tmp/s.pid")));
    }
}
