//! ssh-agent-switcher - stable SSH agent socket across SSH sessions
//!
//! This library serves a Unix socket at a fixed path. For every client it
//! finds the live agent socket forwarded by sshd into the current user's
//! sessions and relays the connection to it, so long-lived programs such as
//! terminal multiplexers keep working after reconnecting.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod service;
pub mod utils;

pub use error::{Error, Result};
