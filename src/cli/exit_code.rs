//! Exit code definitions for ssh-agent-switcher
//!
//! Provides standardized exit codes for different error conditions.

use crate::error::Error;

/// Exit codes for the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Successful execution, including finding another instance already serving
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Configuration error (invalid config, missing required settings)
    ConfigError = 2,
    /// Socket error (cannot create/bind socket, permission denied)
    SocketError = 3,
}

impl ExitCode {
    /// Classify an error returned by the application
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<Error>() {
            Some(Error::AlreadyRunning(_)) => ExitCode::Success,
            Some(Error::Config(_)) => ExitCode::ConfigError,
            Some(Error::Socket(_) | Error::SocketPath(_)) => ExitCode::SocketError,
            _ => ExitCode::GeneralError,
        }
    }
}

impl From<ExitCode> for u8 {
    fn from(code: ExitCode) -> Self {
        code as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}
