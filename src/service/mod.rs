//! Service management module
//!
//! This module provides functionality for running ssh-agent-switcher in the
//! background:
//! - Re-executing the binary as a detached child and waiting for it to start
//! - Claiming the PID file that keeps a single daemon alive

mod daemon;

pub use daemon::{DETACHED_FLAG, Daemon, MAX_CHILD_WAIT, PidFile, Readiness};
