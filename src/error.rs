//! Error types for ssh-agent-switcher

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ssh-agent-switcher
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error(transparent)]
    SocketPath(#[from] crate::utils::socket::SocketError),

    /// Another live instance already owns the socket or the PID file.
    ///
    /// This is not a failure: the caller is expected to exit successfully.
    #[error("Another instance is already serving {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("No agent found")]
    AgentNotFound,

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
