//! Validation of directory entries considered as agent sockets
//!
//! sshd creates one `ssh-XXXXXXXX` session directory per login, owned by the
//! user, holding a socket named `agent.<PID>` where `<PID>` is the sshd
//! process serving the session. Newer sshd versions drop the session
//! directory and place `<random>.sshd.<random>` sockets straight into
//! `~/.ssh/agent`. Every entry examined while looking for an agent yields
//! exactly one [`ValidationOutcome`].

use std::fmt;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::UnixStream;
use std::path::Path;

use super::process::ProcessInspector;

/// Name prefix of the per-login directories created by sshd
pub const SESSION_DIR_PREFIX: &str = "ssh-";

/// Name prefix of forwarded agent sockets inside a session directory
pub const AGENT_SOCKET_PREFIX: &str = "agent.";

/// Name infix of forwarded agent sockets placed directly in `~/.ssh/agent`
pub const HOME_AGENT_SOCKET_INFIX: &str = ".sshd.";

/// Naming rule an entry failed to satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRule {
    /// Name must start with the given text
    Prefix(&'static str),
    /// Name must contain the given text
    Infix(&'static str),
}

impl fmt::Display for NameRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameRule::Prefix(prefix) => write!(f, "does not start with '{}'", prefix),
            NameRule::Infix(infix) => write!(f, "does not contain '{}'", infix),
        }
    }
}

/// Verdict reached for a single examined entry
///
/// The `Display` text is the reason written to the log next to the entry
/// path, and external tooling greps for it, so wording changes are
/// user-visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    NotADirectory,
    WrongNamePrefix(NameRule),
    WrongOwner { owner: u32, current: u32 },
    /// A session directory held no usable socket, or could not be listed
    NoCandidateFound(Option<String>),
    StatFailed(String),
    NotASocket,
    InvalidEmbeddedPid,
    NotASessionProcess,
    NoTerminalAttached,
    ConnectFailed(String),
    Accepted,
}

impl ValidationOutcome {
    /// Whether this outcome selects the entry
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted)
    }
}

impl fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationOutcome::NotADirectory => f.write_str("not a directory"),
            ValidationOutcome::WrongNamePrefix(rule) => rule.fmt(f),
            ValidationOutcome::WrongOwner { owner, current } => {
                write!(f, "owner {} is not current user {}", owner, current)
            }
            ValidationOutcome::NoCandidateFound(None) => f.write_str("No socket in subdirectory"),
            ValidationOutcome::NoCandidateFound(Some(e)) => {
                write!(f, "No socket in subdirectory: cannot read directory: {}", e)
            }
            ValidationOutcome::StatFailed(e) => write!(f, "stat failed: {}", e),
            ValidationOutcome::NotASocket => f.write_str("not a socket"),
            ValidationOutcome::InvalidEmbeddedPid => f.write_str("invalid socket path"),
            ValidationOutcome::NotASessionProcess => f.write_str("not owned by sshd process"),
            ValidationOutcome::NoTerminalAttached => {
                f.write_str("owning sshd process does not have a PTS attached")
            }
            ValidationOutcome::ConnectFailed(e) => write!(f, "Cannot connect to socket: {}", e),
            ValidationOutcome::Accepted => f.write_str("accepted"),
        }
    }
}

/// Return the UTF-8 file name of `path`, if any
fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// Extract the sshd PID embedded in an `agent.<PID>` socket name
pub fn embedded_pid(name: &str) -> Option<i32> {
    let pid: i32 = name.strip_prefix(AGENT_SOCKET_PREFIX)?.parse().ok()?;
    (pid > 0).then_some(pid)
}

/// Decide whether `path` is a session directory worth descending into.
///
/// `is_dir` comes from the directory listing, which does not follow
/// symlinks. [`ValidationOutcome::Accepted`] means "descend".
pub fn check_session_dir(path: &Path, is_dir: bool, uid: u32) -> ValidationOutcome {
    if !is_dir {
        return ValidationOutcome::NotADirectory;
    }

    if !file_name(path).is_some_and(|name| name.starts_with(SESSION_DIR_PREFIX)) {
        return ValidationOutcome::WrongNamePrefix(NameRule::Prefix(SESSION_DIR_PREFIX));
    }

    // Checked explicitly so that the outcome does not depend on how the
    // permission bits of a foreign directory happen to be set.
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => return ValidationOutcome::StatFailed(e.to_string()),
    };
    if metadata.uid() != uid {
        return ValidationOutcome::WrongOwner {
            owner: metadata.uid(),
            current: uid,
        };
    }

    ValidationOutcome::Accepted
}

/// Check that `path` is a socket file
fn check_is_socket(path: &Path) -> Result<(), ValidationOutcome> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => Ok(()),
        Ok(_) => Err(ValidationOutcome::NotASocket),
        Err(e) => Err(ValidationOutcome::StatFailed(e.to_string())),
    }
}

/// Connect to the socket at `path`.
///
/// The owning sshd may have exited since the entry was listed; that shows up
/// here as an ordinary rejection.
fn connect(path: &Path) -> Result<UnixStream, ValidationOutcome> {
    UnixStream::connect(path).map_err(|e| ValidationOutcome::ConnectFailed(e.to_string()))
}

/// Validate an `agent.<PID>` entry inside a session directory and open it.
pub fn open_session_candidate(
    path: &Path,
    inspector: &dyn ProcessInspector,
) -> Result<UnixStream, ValidationOutcome> {
    let name = file_name(path)
        .filter(|name| name.starts_with(AGENT_SOCKET_PREFIX))
        .ok_or(ValidationOutcome::WrongNamePrefix(NameRule::Prefix(
            AGENT_SOCKET_PREFIX,
        )))?;

    check_is_socket(path)?;

    let pid = embedded_pid(name).ok_or(ValidationOutcome::InvalidEmbeddedPid)?;

    if !inspector.is_session_process(pid) {
        return Err(ValidationOutcome::NotASessionProcess);
    }
    if !inspector.has_attached_terminal(pid) {
        return Err(ValidationOutcome::NoTerminalAttached);
    }

    connect(path)
}

/// Validate a `*.sshd.*` entry placed directly in a home-based agents
/// directory and open it.
///
/// These names carry no PID, so the owning process cannot be inspected.
pub fn open_home_candidate(path: &Path) -> Result<UnixStream, ValidationOutcome> {
    if !file_name(path).is_some_and(|name| name.contains(HOME_AGENT_SOCKET_INFIX)) {
        return Err(ValidationOutcome::WrongNamePrefix(NameRule::Infix(
            HOME_AGENT_SOCKET_INFIX,
        )));
    }

    check_is_socket(path)?;
    connect(path)
}
