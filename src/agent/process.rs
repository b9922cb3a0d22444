//! Process inspection through a procfs-like directory
//!
//! sshd rewrites its command line to describe the session it serves, e.g.
//! `sshd: user@pts/1` for an interactive login or `sshd: user@notty` for one
//! without a terminal. That description is what tells a live, user-facing
//! forwarding socket apart from leftovers of batch sessions.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Default location of the process information filesystem
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Environment variable that relocates the process information root.
///
/// Only meant for tests that fake process metadata in a plain directory.
pub const PROC_ROOT_ENV: &str = "PROCESS_OVERRIDE_PROC_DIR";

/// Token present in the command line of session-owning sshd processes
const SESSION_PROCESS_MARKER: &str = "sshd";

/// Token present in the command line of sshd processes serving a PTY
const ATTACHED_TERMINAL_MARKER: &str = "@pts/";

/// Answers questions about the process that created an agent socket.
///
/// Lookup failures of any kind (the process is gone, permission denied)
/// must be reported as a negative answer, never as an error: the owner of
/// a candidate socket exiting while we look at it is business as usual.
pub trait ProcessInspector: Send + Sync {
    /// Whether `pid` is a session-owning sshd process.
    fn is_session_process(&self, pid: i32) -> bool;

    /// Whether `pid` has an interactive terminal attached.
    fn has_attached_terminal(&self, pid: i32) -> bool;
}

/// Inspector backed by `<root>/<pid>/cmdline` files.
///
/// With the default root this reads the real `/proc`; pointing it at a
/// scratch directory with the same layout gives tests full control over
/// which processes "exist".
#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    root: PathBuf,
}

impl ProcfsInspector {
    /// Create an inspector rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Create an inspector for the running system
    pub fn system() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the command line of `pid` with NUL separators turned into spaces
    fn cmdline(&self, pid: i32) -> Option<String> {
        let path = self.root.join(pid.to_string()).join("cmdline");
        match fs::read(&path) {
            Ok(raw) => {
                let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
                trace!(pid = pid, cmdline = %cmdline.trim_end(), "Read process command line");
                Some(cmdline)
            }
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Cannot read process command line");
                None
            }
        }
    }
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::system()
    }
}

impl ProcessInspector for ProcfsInspector {
    fn is_session_process(&self, pid: i32) -> bool {
        self.cmdline(pid)
            .is_some_and(|cmdline| cmdline.contains(SESSION_PROCESS_MARKER))
    }

    fn has_attached_terminal(&self, pid: i32) -> bool {
        self.cmdline(pid)
            .is_some_and(|cmdline| cmdline.contains(ATTACHED_TERMINAL_MARKER))
    }
}
