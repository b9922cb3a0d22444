//! Configuration module for ssh-agent-switcher
//!
//! Settings come from three layers, highest priority first: command line
//! flags, the optional configuration file, and built-in defaults derived
//! from the environment. The result is frozen into a [`SwitcherConfig`]
//! that is shared, read-only, by every connection handler.

mod file;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agent::{DEFAULT_PROC_ROOT, PROC_ROOT_ENV, ProcfsInspector};
use crate::error::{Error, Result};
use crate::utils::path::expand_to_pathbuf;

pub use file::{ConfigFile, ConfigPath, config_search_paths, find_config_file, load_config};

/// Application name for file and directory names
pub const APP_NAME: &str = "ssh-agent-switcher";

/// Contents of the configuration file
///
/// Every key is optional; paths support `~` and `$VAR` expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the socket to listen on
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Directories where to look for running agents, in search order
    #[serde(default)]
    pub agents_dirs: Option<Vec<String>>,

    /// Log file used in daemon mode
    #[serde(default)]
    pub log_file: Option<String>,

    /// PID file used in daemon mode
    #[serde(default)]
    pub pid_file: Option<String>,
}

/// Immutable runtime configuration
#[derive(Debug, Clone)]
pub struct SwitcherConfig {
    /// Stable socket clients connect to
    pub socket_path: PathBuf,
    /// Directories searched for agent sockets, in order
    pub agents_dirs: Vec<PathBuf>,
    /// Home directory of the invoking user, enabling the `~/.ssh/agent` layout
    pub home: Option<PathBuf>,
    /// User that session directories must belong to
    pub uid: u32,
    /// Root of the process information filesystem
    pub proc_root: PathBuf,
}

impl SwitcherConfig {
    /// Create a configuration for the current user and process environment
    pub fn new<P: AsRef<Path>>(socket_path: P, agents_dirs: Vec<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            agents_dirs,
            home: std::env::var_os("HOME").map(PathBuf::from),
            // SAFETY: getuid cannot fail.
            uid: unsafe { libc::getuid() },
            proc_root: proc_root_from_env(),
        }
    }

    /// Override the home directory
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Override the process information root
    pub fn with_proc_root<P: AsRef<Path>>(mut self, proc_root: P) -> Self {
        self.proc_root = proc_root.as_ref().to_path_buf();
        self
    }

    /// Build the process inspector for this configuration
    pub fn inspector(&self) -> ProcfsInspector {
        ProcfsInspector::new(&self.proc_root)
    }
}

/// Values given explicitly on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub socket_path: Option<PathBuf>,
    /// Colon-separated list, as typed by the user
    pub agents_dirs: Option<String>,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
}

/// Fully resolved settings for one invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub switcher: SwitcherConfig,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
}

impl Settings {
    /// Merge command line overrides, the configuration file and defaults.
    ///
    /// Defaults are only computed for values that are not provided, so a
    /// missing `USER` does not matter when `--socket-path` is given.
    pub fn resolve(overrides: &Overrides, file: Option<&Config>) -> Result<Self> {
        let file = file.cloned().unwrap_or_default();

        let socket_path = match (&overrides.socket_path, &file.socket_path) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => expand_to_pathbuf(path)?,
            (None, None) => default_socket_path()?,
        };

        let agents_dirs = match (&overrides.agents_dirs, &file.agents_dirs) {
            (Some(dirs), _) => parse_agents_dirs(dirs),
            (None, Some(dirs)) => dirs
                .iter()
                .map(|dir| expand_to_pathbuf(dir))
                .collect::<Result<Vec<_>>>()?,
            (None, None) => default_agents_dirs()?,
        };

        let log_file = match (&overrides.log_file, &file.log_file) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => expand_to_pathbuf(path)?,
            (None, None) => default_log_file()?,
        };

        let pid_file = match (&overrides.pid_file, &file.pid_file) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => expand_to_pathbuf(path)?,
            (None, None) => default_pid_file()?,
        };

        Ok(Self {
            switcher: SwitcherConfig::new(socket_path, agents_dirs),
            log_file,
            pid_file,
        })
    }
}

/// Read a required environment variable
fn required_env_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|e| Error::Config(format!("{} variable is not set or not valid: {}", name, e)))
}

/// Root of the process information filesystem, honoring the test override
pub fn proc_root_from_env() -> PathBuf {
    match std::env::var_os(PROC_ROOT_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_PROC_ROOT),
    }
}

/// Split a colon-separated list of directories, ignoring empty elements
pub fn parse_agents_dirs(list: &str) -> Vec<PathBuf> {
    list.split(':')
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Socket path used by default for `user`
pub fn socket_path_for_user(user: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/ssh-agent.{}", user))
}

/// Agents directories searched by default for a user living in `home`.
///
/// sshd used to create session directories in /tmp; newer versions place
/// sockets in ~/.ssh/agent instead.
pub fn agents_dirs_for_home(home: &Path) -> Vec<PathBuf> {
    vec![home.join(".ssh").join("agent"), PathBuf::from("/tmp")]
}

/// Default value of the socket path
pub fn default_socket_path() -> Result<PathBuf> {
    required_env_var("USER").map(|user| socket_path_for_user(&user))
}

/// Default value of the agents directories
pub fn default_agents_dirs() -> Result<Vec<PathBuf>> {
    required_env_var("HOME").map(|home| agents_dirs_for_home(Path::new(&home)))
}

/// Directory for persistent state such as the log file
fn state_dir() -> Result<PathBuf> {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .ok_or_else(|| Error::Config("Cannot determine the state directory".to_string()))
}

/// Default value of the log file
pub fn default_log_file() -> Result<PathBuf> {
    Ok(state_dir()?.join(format!("{}.log", APP_NAME)))
}

/// Default value of the PID file
///
/// XDG_RUNTIME_DIR is often unset (it is on FreeBSD by default), in which
/// case the state directory is used instead.
pub fn default_pid_file() -> Result<PathBuf> {
    let dir = match dirs::runtime_dir() {
        Some(dir) => dir,
        None => state_dir()?,
    };
    Ok(dir.join(format!("{}.pid", APP_NAME)))
}
