//! Unix socket server for the stable agent endpoint
//!
//! The server claims its socket path exclusively: a live instance already
//! listening there wins and is left untouched, while dead leftovers are
//! reclaimed. The socket file is removed again when the server stops, but
//! only if it is still the one this process created. A listener handed over
//! by systemd belongs to systemd and is never removed.

use crate::error::{Error, Result};
use crate::utils::socket::{self, DirLock, ExistingSocket, FileIdentity};
use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Pause after a transient accept failure before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Whether an accept error is worth retrying instead of giving up
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    ) || matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    )
}

/// Identify the socket just bound at `path`, removing it if that fails
fn record_identity(
    path: &Path,
    identify: impl FnOnce(&Path) -> io::Result<FileIdentity>,
) -> io::Result<FileIdentity> {
    identify(path).inspect_err(|_| {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
    })
}

/// Unix socket server for accepting SSH agent client connections
pub struct Server {
    /// Path to the socket file
    socket_path: PathBuf,
    /// The listener (created on bind)
    listener: Option<UnixListener>,
    /// Identity of the socket file we created, if any
    identity: Option<FileIdentity>,
    /// Whether the listener was inherited through socket activation
    activated: bool,
}

impl Server {
    /// Create a new server that will listen on the specified path
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            identity: None,
            activated: false,
        }
    }

    /// Serve on a listener inherited through systemd socket activation
    ///
    /// The socket file is owned by systemd: it is neither probed nor removed.
    pub fn from_listener(listener: StdUnixListener) -> Result<Self> {
        let socket_path = listener
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(Path::to_path_buf))
            .ok_or_else(|| {
                Error::Socket("Cannot determine socket path from inherited listener".to_string())
            })?;

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        info!("Listening on {} (provided by systemd)", socket_path.display());
        Ok(Self {
            socket_path,
            listener: Some(listener),
            identity: None,
            activated: true,
        })
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the server to the socket path
    ///
    /// Returns [`Error::AlreadyRunning`] if another live server owns the
    /// path; in that case nothing on disk is modified. The socket is created
    /// accessible by the current user only.
    pub async fn bind(&mut self) -> Result<()> {
        socket::ensure_parent_dir(&self.socket_path)?;

        let parent = self
            .socket_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let _claim = DirLock::acquire(parent)?;

        match socket::probe_existing_socket(&self.socket_path)? {
            ExistingSocket::Absent => {}
            ExistingSocket::Live => return Err(Error::AlreadyRunning(self.socket_path.clone())),
            ExistingSocket::Stale => {
                debug!(path = %self.socket_path.display(), "Removing stale socket file");
                socket::remove_existing_socket(&self.socket_path)?;
            }
        }

        let bound = {
            let _umask = socket::set_umask(0o177);
            UnixListener::bind(&self.socket_path)
        };
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                return Err(Error::AlreadyRunning(self.socket_path.clone()));
            }
            Err(e) => {
                return Err(Error::Socket(format!(
                    "Cannot listen on {}: {}",
                    self.socket_path.display(),
                    e
                )));
            }
        };

        // Record ownership first so that any later failure still cleans up.
        let identity = match record_identity(&self.socket_path, FileIdentity::of) {
            Ok(identity) => identity,
            Err(e) => {
                drop(listener);
                return Err(e.into());
            }
        };
        self.identity = Some(identity);
        self.listener = Some(listener);
        socket::set_socket_permissions(&self.socket_path)?;

        info!("Listening on {}", self.socket_path.display());
        Ok(())
    }

    /// Accept connections until shutdown is requested or accepting fails
    ///
    /// Every connection is served by its own task, so a slow client never
    /// holds up the accept loop. The socket file is removed before returning.
    ///
    /// # Arguments
    /// * `handler` - Async function to handle each client connection
    /// * `shutdown_rx` - Watch receiver for shutdown signal
    pub async fn run<F, Fut>(
        &mut self,
        handler: F,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()>
    where
        F: Fn(UnixStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Socket("Server is not bound".to_string()))?;

        let handler = Arc::new(handler);

        let result = loop {
            if *shutdown_rx.borrow_and_update() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            trace!("Accepted new client connection");
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = handler(stream).await {
                                    // Already logged by the handler; nothing else to do.
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!(error = %e, "Failed to accept connection, retrying");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            break Err(Error::Socket(format!("Failed to accept connection: {}", e)));
                        }
                    }
                }
            }
        };

        if self.activated {
            info!("Shutting down (systemd owns {})", self.socket_path.display());
        } else {
            info!("Shutting down and removing {}", self.socket_path.display());
        }
        self.cleanup();
        result
    }

    /// Stop listening and remove the socket file if it is still ours.
    ///
    /// Safe to call more than once.
    pub fn cleanup(&mut self) {
        self.listener.take();

        let Some(identity) = self.identity.take() else {
            return;
        };
        match socket::remove_if_same(&self.socket_path, identity) {
            Ok(true) => debug!(path = %self.socket_path.display(), "Removed socket file"),
            Ok(false) => debug!(
                path = %self.socket_path.display(),
                "Socket file was replaced by someone else; leaving it alone"
            ),
            Err(e) => warn!(
                path = %self.socket_path.display(),
                error = %e,
                "Failed to remove socket file during cleanup"
            ),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cleanup();
    }
}
