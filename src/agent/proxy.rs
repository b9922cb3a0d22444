//! Per-connection handling
//!
//! Each accepted client gets its own fresh agent lookup followed by a relay.
//! Failures here only ever affect the one client being served.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use super::relay::relay;
use super::resolver::Resolver;
use crate::error::{Error, Result};

/// Serves client connections by pairing them with the current agent
pub struct Proxy {
    /// Agent socket lookup
    resolver: Arc<Resolver>,
    /// Connection counter for client IDs
    connection_counter: AtomicU64,
}

impl Proxy {
    /// Create a new proxy
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver: Arc::new(resolver),
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Handle a client connection
    ///
    /// Looks up the agent, relays traffic until either side is done, and
    /// closes both connections on return. A client for which no agent can be
    /// found is dropped without any data being sent.
    pub async fn handle_client(&self, client: UnixStream) -> Result<()> {
        let client_id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        info!(client_id = client_id, "Accepted client connection");

        let (agent_path, agent) = match Arc::clone(&self.resolver).connect().await {
            Ok(found) => found,
            Err(Error::AgentNotFound) => {
                warn!(client_id = client_id, "Dropping connection: no agent found");
                return Err(Error::AgentNotFound);
            }
            Err(e) => {
                warn!(client_id = client_id, "Dropping connection: {}", e);
                return Err(e);
            }
        };

        match relay(client, agent).await {
            Ok(stats) => {
                debug!(
                    client_id = client_id,
                    agent = %agent_path.display(),
                    to_agent = stats.client_to_agent,
                    to_client = stats.agent_to_client,
                    "Relay finished"
                );
                info!(client_id = client_id, "Closing client connection");
                Ok(())
            }
            Err(e) => {
                warn!(client_id = client_id, "Dropping connection: {}", e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ProcfsInspector;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_no_agent_closes_client_without_data() {
        let root = tempdir().unwrap();
        let resolver = Resolver::new(
            vec![root.path().to_path_buf()],
            None,
            unsafe { libc::getuid() },
            Arc::new(ProcfsInspector::new(root.path())),
        );
        let proxy = Proxy::new(resolver);

        let (mut client_app, client_side) = UnixStream::pair().unwrap();
        let result = proxy.handle_client(client_side).await;
        assert!(matches!(result, Err(Error::AgentNotFound)));

        let mut buf = Vec::new();
        let n = client_app.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
