//! SSH agent switching
//!
//! This module provides the components behind the stable agent socket:
//! - `Server`: exclusive listener on the stable path with its lifecycle
//! - `Proxy`: per-connection agent lookup followed by a relay
//! - `Resolver`: discovery of the live agent socket forwarded by sshd
//! - `ProcessInspector`: checks on the sshd process owning a socket

pub mod candidate;
mod process;
mod proxy;
mod relay;
mod resolver;
mod server;
mod shutdown;

pub use candidate::ValidationOutcome;
pub use process::{DEFAULT_PROC_ROOT, PROC_ROOT_ENV, ProcessInspector, ProcfsInspector};
pub use proxy::Proxy;
pub use relay::{RelayStats, relay};
pub use resolver::{Examined, Resolution, ResolvedAgent, Resolver};
pub use server::Server;
pub use shutdown::{Shutdown, ignore_hangup, spawn_signal_listener};
