//! Discovery of the live forwarded agent socket
//!
//! Every client connection triggers a fresh scan of the configured agents
//! directories. Nothing is cached between scans: sshd creates a new socket on
//! every login, so the right answer changes as sessions come and go.

use std::fs::{self, FileType};
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixStream;
use tracing::{debug, info};

use super::candidate::{self, ValidationOutcome};
use super::process::ProcessInspector;
use crate::config::SwitcherConfig;
use crate::error::{Error, Result};

/// One entry looked at during a scan, with the verdict reached for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Examined {
    pub path: PathBuf,
    pub outcome: ValidationOutcome,
}

/// An open connection to the agent that won the scan
#[derive(Debug)]
pub struct ResolvedAgent {
    pub path: PathBuf,
    pub stream: StdUnixStream,
}

/// Result of one scan: the selected agent, if any, and everything examined
#[derive(Debug)]
pub struct Resolution {
    pub agent: Option<ResolvedAgent>,
    pub examined: Vec<Examined>,
}

impl Resolution {
    /// Get the outcome recorded for `path`, if it was examined
    pub fn outcome_for(&self, path: &Path) -> Option<&ValidationOutcome> {
        self.examined
            .iter()
            .find(|e| e.path == path)
            .map(|e| &e.outcome)
    }
}

/// Records and logs verdicts as the scan progresses
#[derive(Default)]
struct Trace {
    examined: Vec<Examined>,
}

impl Trace {
    fn record(&mut self, path: &Path, outcome: ValidationOutcome) {
        if outcome.is_accepted() {
            info!("Successfully opened SSH agent at {}", path.display());
        } else {
            info!("Ignoring {}: {}", path.display(), outcome);
        }
        self.examined.push(Examined {
            path: path.to_path_buf(),
            outcome,
        });
    }
}

/// List `dir` sorted by name.
///
/// Entries that cannot be read are skipped. The ordering makes scans
/// reproducible and carries no other meaning.
fn sorted_entries(dir: &Path) -> io::Result<Vec<(PathBuf, Option<FileType>)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        match entry {
            Ok(entry) => entries.push((entry.path(), entry.file_type().ok())),
            Err(e) => debug!(dir = %dir.display(), error = %e, "Failed to read directory entry"),
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Finds and opens the forwarded agent socket
pub struct Resolver {
    agents_dirs: Vec<PathBuf>,
    home: Option<PathBuf>,
    uid: u32,
    inspector: Arc<dyn ProcessInspector>,
}

impl Resolver {
    /// Create a resolver searching `agents_dirs` in order
    pub fn new(
        agents_dirs: Vec<PathBuf>,
        home: Option<PathBuf>,
        uid: u32,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        Self {
            agents_dirs,
            home,
            uid,
            inspector,
        }
    }

    /// Create a resolver from the runtime configuration
    pub fn from_config(config: &SwitcherConfig) -> Self {
        Self::new(
            config.agents_dirs.clone(),
            config.home.clone(),
            config.uid,
            Arc::new(config.inspector()),
        )
    }

    /// Scan all agents directories and stop at the first usable socket.
    ///
    /// This performs blocking filesystem and socket calls.
    pub fn resolve(&self) -> Resolution {
        let mut trace = Trace::default();
        let agent = self.scan(&mut trace);
        Resolution {
            agent,
            examined: trace.examined,
        }
    }

    /// Resolve from async code and hand back a tokio stream.
    pub async fn connect(self: Arc<Self>) -> Result<(PathBuf, UnixStream)> {
        let resolution = tokio::task::spawn_blocking(move || self.resolve())
            .await
            .map_err(|e| Error::Other(format!("Agent lookup task failed: {}", e)))?;

        let agent = resolution.agent.ok_or(Error::AgentNotFound)?;
        agent.stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(agent.stream)?;
        Ok((agent.path, stream))
    }

    fn scan(&self, trace: &mut Trace) -> Option<ResolvedAgent> {
        for dir in &self.agents_dirs {
            let home_layout = self.home.as_ref().is_some_and(|home| dir.starts_with(home));
            if home_layout {
                debug!(dir = %dir.display(), "Looking for an agent socket with HOME naming scheme");
                if let Some(agent) = self.scan_home_dir(dir, trace) {
                    return Some(agent);
                }
            }

            debug!(dir = %dir.display(), "Looking for an agent socket in session directories");
            if let Some(agent) = self.scan_shared_dir(dir, home_layout, trace) {
                return Some(agent);
            }
        }

        None
    }

    /// Scan a directory holding `*.sshd.*` sockets directly
    ///
    /// Subdirectories are left to the session directory scan.
    fn scan_home_dir(&self, dir: &Path, trace: &mut Trace) -> Option<ResolvedAgent> {
        let entries = match sorted_entries(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Failed to read directory entries");
                return None;
            }
        };

        for (path, file_type) in entries {
            if file_type.is_some_and(|t| t.is_dir()) {
                continue;
            }
            match candidate::open_home_candidate(&path) {
                Ok(stream) => {
                    trace.record(&path, ValidationOutcome::Accepted);
                    return Some(ResolvedAgent { path, stream });
                }
                Err(outcome) => trace.record(&path, outcome),
            }
        }

        None
    }

    /// Scan a directory holding `ssh-*` session directories
    ///
    /// With `dirs_only`, other entries were already judged by the home scan.
    fn scan_shared_dir(
        &self,
        dir: &Path,
        dirs_only: bool,
        trace: &mut Trace,
    ) -> Option<ResolvedAgent> {
        let entries = match sorted_entries(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Failed to read directory entries");
                return None;
            }
        };

        for (path, file_type) in entries {
            let is_dir = file_type.is_some_and(|t| t.is_dir());
            if dirs_only && !is_dir {
                continue;
            }
            let outcome = candidate::check_session_dir(&path, is_dir, self.uid);
            if !outcome.is_accepted() {
                trace.record(&path, outcome);
                continue;
            }

            if let Some(agent) = self.scan_session_dir(&path, trace) {
                return Some(agent);
            }
        }

        debug!(dir = %dir.display(), "No socket in directory");
        None
    }

    /// Scan one session directory for its `agent.<PID>` socket
    fn scan_session_dir(&self, dir: &Path, trace: &mut Trace) -> Option<ResolvedAgent> {
        let entries = match sorted_entries(dir) {
            Ok(entries) => entries,
            Err(e) => {
                trace.record(dir, ValidationOutcome::NoCandidateFound(Some(e.to_string())));
                return None;
            }
        };

        for (path, _file_type) in entries {
            match candidate::open_session_candidate(&path, self.inspector.as_ref()) {
                Ok(stream) => {
                    trace.record(&path, ValidationOutcome::Accepted);
                    return Some(ResolvedAgent { path, stream });
                }
                Err(outcome) => trace.record(&path, outcome),
            }
        }

        trace.record(dir, ValidationOutcome::NoCandidateFound(None));
        None
    }
}
