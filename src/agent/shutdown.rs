//! Shutdown notification and signal wiring
//!
//! Termination signals raise a one-shot [`Shutdown`] notification that the
//! accept loop watches. SIGHUP is ignored outright so that an instance
//! started from an interactive shell survives the shell going away.

use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Result;

/// One-shot shutdown notification shared by the lifecycle
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a new, not yet triggered, notification
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the notification. Later calls have no effect.
    pub fn trigger(&self) {
        self.tx.send_if_modified(|triggered| !std::mem::replace(triggered, true));
    }

    /// Get a receiver to wait on
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Make terminal disconnects harmless to this process
pub fn ignore_hangup() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGQUIT that trigger `shutdown`.
///
/// Handlers are registered before this returns, so signals delivered right
/// after the call are not lost.
pub fn spawn_signal_listener(shutdown: Shutdown) -> Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };
        info!(signal = name, "Received termination signal");
        shutdown.trigger();
    }))
}
