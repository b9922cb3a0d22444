//! Daemon management for ssh-agent-switcher
//!
//! Daemon mode re-executes the current binary in a new session with its
//! stderr appended to the log file. The parent only waits until the child
//! has published its PID file and socket, then exits.

use crate::error::{Error, Result};
use crate::utils::socket;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Maximum amount of time to wait for the detached child to start
pub const MAX_CHILD_WAIT: Duration = Duration::from_secs(10);

/// Hidden flag marking the re-executed child
pub const DETACHED_FLAG: &str = "--detached";

/// Interval between checks while waiting for the child
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of starting the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The child published its PID file and socket
    Started { pid: u32 },
    /// The child found another instance holding the PID file and exited
    AlreadyRunning,
}

/// Launcher for the detached child process
#[derive(Debug)]
pub struct Daemon {
    /// Log file receiving the child's stderr
    log_file: PathBuf,
    /// PID file the child writes
    pid_file: PathBuf,
    /// Socket the child listens on
    socket_path: PathBuf,
}

impl Daemon {
    /// Create a launcher for the given files
    pub fn new<P: AsRef<Path>>(log_file: P, pid_file: P, socket_path: P) -> Self {
        Self {
            log_file: log_file.as_ref().to_path_buf(),
            pid_file: pid_file.as_ref().to_path_buf(),
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Get the PID file path
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Start the daemon and wait until it is serving
    ///
    /// `args` are passed to the child in addition to [`DETACHED_FLAG`].
    pub async fn start(&self, args: &[OsString]) -> Result<Readiness> {
        tracing::info!("Log file: {}", self.log_file.display());
        tracing::info!("PID file: {}", self.pid_file.display());

        let mut child = self.spawn(args)?;
        let readiness = self.wait_until_ready(&mut child, MAX_CHILD_WAIT).await?;
        if let Readiness::Started { pid } = &readiness {
            tracing::info!("PID is: {}", pid);
        }
        Ok(readiness)
    }

    /// Re-execute the current binary detached from the terminal
    fn spawn(&self, args: &[OsString]) -> Result<Child> {
        socket::ensure_parent_dir(&self.log_file)?;
        socket::ensure_parent_dir(&self.pid_file)?;

        let log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_file)
            .map_err(|e| {
                Error::Daemon(format!(
                    "Failed to open/create log file {}: {}",
                    self.log_file.display(),
                    e
                ))
            })?;

        let executable = std::env::current_exe()
            .map_err(|e| Error::Daemon(format!("Failed to get current executable path: {}", e)))?;

        let mut cmd = Command::new(&executable);
        cmd.args(args)
            .arg(DETACHED_FLAG)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
            .map_err(|e| Error::Daemon(format!("Failed to become daemon: {}", e)))
    }

    /// Wait until the child is serving, exits, or `timeout` elapses
    async fn wait_until_ready(&self, child: &mut Child, timeout: Duration) -> Result<Readiness> {
        let pid = child
            .id()
            .ok_or_else(|| Error::Daemon("Daemon exited before it could be tracked".to_string()))?;

        tokio::time::timeout(timeout, self.poll_ready(child, pid))
            .await
            .map_err(|_| {
                Error::Daemon(format!(
                    "Daemon failed to start on time: see {}",
                    self.log_file.display()
                ))
            })?
    }

    async fn poll_ready(&self, child: &mut Child, pid: u32) -> Result<Readiness> {
        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(Readiness::AlreadyRunning);
                }
                return Err(Error::Daemon(format!(
                    "Daemon exited with {}; see {}",
                    status,
                    self.log_file.display()
                )));
            }

            if published_pid(&self.pid_file) == Some(pid)
                && fs::symlink_metadata(&self.socket_path).is_ok()
            {
                return Ok(Readiness::Started { pid });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// PID currently recorded in `path`, if any
fn published_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Exclusively held PID file
///
/// The lock lives as long as the open file, so a crashed daemon never blocks
/// a new one. The file is removed when the value is dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: Option<File>,
}

impl PidFile {
    /// Lock `path` and write the current PID into it
    ///
    /// Returns [`Error::AlreadyRunning`] if another process holds the lock;
    /// the file is left untouched in that case.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        socket::ensure_parent_dir(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                Error::Daemon(format!("Failed to open PID file {}: {}", path.display(), e))
            })?;

        // SAFETY: the descriptor is owned by `file` and stays open while locked.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(Error::AlreadyRunning(path));
            }
            return Err(Error::Daemon(format!(
                "Unable to lock PID file {}: {}",
                path.display(),
                err
            )));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        tracing::debug!(path = %path.display(), "Created PID file");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Remove the PID file and release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        // Remove while still holding the lock so a newcomer never loses its file.
        if let Some(file) = self.file.take() {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
            }
            drop(file);
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}
