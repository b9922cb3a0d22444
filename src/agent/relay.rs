//! Byte-transparent relay between a client and an agent connection
//!
//! The agent protocol allows several requests in flight on one connection,
//! so the two directions are pumped independently instead of alternating
//! request/response. Reads and writes may be partial; each pump loops until
//! its source reaches end of stream.
//!
//! The client decides when the conversation is over. Once it stops sending,
//! the agent only gets a short window to deliver pending replies.

use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::trace;

/// Size of the per-direction copy buffer. This bounds one read, not one message.
const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// How long the agent may stay quiet after the client reached end of stream
const DRAIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Data flow handled by one pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToAgent,
    AgentToClient,
}

impl Direction {
    fn source(self) -> &'static str {
        match self {
            Direction::ClientToAgent => "client",
            Direction::AgentToClient => "agent",
        }
    }

    fn sink(self) -> &'static str {
        match self {
            Direction::ClientToAgent => "agent",
            Direction::AgentToClient => "client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source(), self.sink())
    }
}

/// Bytes moved in each direction by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_agent: u64,
    pub agent_to_client: u64,
}

/// Whether a pump has switched to draining what is left
fn is_draining(drain: &Option<watch::Receiver<bool>>) -> bool {
    drain.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Read the next chunk, or `None` once a draining source stayed idle too long.
async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    drain: &mut Option<watch::Receiver<bool>>,
    idle: Duration,
) -> io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let Some(rx) = drain else {
        return reader.read(buf).await.map(Some);
    };

    if !*rx.borrow_and_update() {
        // Interrupting a pending read loses nothing; it is simply retried.
        tokio::select! {
            read = reader.read(buf) => return read.map(Some),
            _ = rx.changed() => {}
        }
    }

    match tokio::time::timeout(idle, reader.read(buf)).await {
        Ok(read) => read.map(Some),
        Err(_) => Ok(None),
    }
}

/// Copy everything from `reader` to `writer` and then close `writer`.
///
/// With `drain` set, the pump stops early once the receiver flips to `true`
/// and the source then stays idle for `idle`, or the sink goes away.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    mut drain: Option<watch::Receiver<bool>>,
    idle: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = read_chunk(reader, &mut buf, &mut drain, idle)
            .await
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("read from {} failed: {}", direction.source(), e),
                )
            })?;
        let n = match read {
            Some(0) => break,
            Some(n) => n,
            None => {
                trace!(direction = %direction, "Source idle while draining");
                break;
            }
        };
        trace!(direction = %direction, bytes = n, "Forwarding data");

        if let Err(e) = writer.write_all(&buf[..n]).await {
            if is_draining(&drain) {
                trace!(direction = %direction, error = %e, "Sink gone while draining");
                return Ok(total);
            }
            return Err(io::Error::new(
                e.kind(),
                format!("write to {} failed: {}", direction.sink(), e),
            ));
        }
        total += n as u64;
    }

    // Propagate end of stream. The peer may already be gone, which is fine.
    if let Err(e) = writer.shutdown().await {
        trace!(direction = %direction, error = %e, "Failed to shut down write side");
    }
    trace!(direction = %direction, bytes = total, "End of stream");
    Ok(total)
}

/// Relay data between `client` and `agent` until the client reaches end of
/// stream and the agent has drained its replies, or until the first I/O error.
///
/// Dropping the streams is left to the caller, which closes both ends.
pub async fn relay<C, A>(client: C, agent: A) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    A: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_drain(client, agent, DRAIN_IDLE_TIMEOUT).await
}

/// Same as [`relay`] with a custom agent idle window after client end of stream
async fn relay_with_drain<C, A>(client: C, agent: A, idle: Duration) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    A: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut agent_reader, mut agent_writer) = tokio::io::split(agent);
    let (drain_tx, drain_rx) = watch::channel(false);

    let client_to_agent = async {
        let sent = pump(
            &mut client_reader,
            &mut agent_writer,
            Direction::ClientToAgent,
            None,
            idle,
        )
        .await?;
        drain_tx.send_replace(true);
        Ok::<_, io::Error>(sent)
    };
    let agent_to_client = pump(
        &mut agent_reader,
        &mut client_writer,
        Direction::AgentToClient,
        Some(drain_rx),
        idle,
    );

    let (client_to_agent, agent_to_client) = tokio::try_join!(client_to_agent, agent_to_client)?;

    Ok(RelayStats {
        client_to_agent,
        agent_to_client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tokio::net::UnixStream;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_relay_request_response() {
        let client = Builder::new()
            .read(b"request")
            .write(b"response")
            .build();
        let agent = Builder::new()
            .write(b"request")
            .read(b"response")
            .build();

        let stats = relay(client, agent).await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_agent: 7,
                agent_to_client: 8
            }
        );
    }

    #[tokio::test]
    async fn test_relay_partial_reads_are_reassembled() {
        let client = Builder::new()
            .read(b"he")
            .read(b"llo")
            .write(b"wor")
            .write(b"ld")
            .build();
        let agent = Builder::new()
            .write(b"he")
            .write(b"llo")
            .read(b"wor")
            .read(b"ld")
            .build();

        let stats = relay(client, agent).await.unwrap();
        assert_eq!(stats.client_to_agent, 5);
        assert_eq!(stats.agent_to_client, 5);
    }

    #[tokio::test]
    async fn test_relay_client_read_error() {
        let client = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "boom"))
            .build();
        let agent = Builder::new().build();

        let err = relay(client, agent).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("read from client failed"));
    }

    #[tokio::test]
    async fn test_relay_large_payload_both_directions() {
        let (mut client_app, client_side) = UnixStream::pair().unwrap();
        let (agent_side, mut agent_app) = UnixStream::pair().unwrap();

        let mut payload = vec![0u8; 1024 * 1024 + 17];
        rand::thread_rng().fill_bytes(&mut payload);

        let relay_task = tokio::spawn(relay(client_side, agent_side));

        // Echo agent: send back everything until the client is done.
        let echo_task = tokio::spawn(async move {
            let (mut reader, mut writer) = agent_app.split();
            tokio::io::copy(&mut reader, &mut writer).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let (mut reader, mut writer) = client_app.split();
        let sent = payload.clone();
        let write = async move {
            writer.write_all(&sent).await.unwrap();
            writer.shutdown().await.unwrap();
        };
        let read = async move {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.unwrap();
            received
        };
        let ((), received) = tokio::join!(write, read);

        assert_eq!(received.len(), payload.len());
        assert!(received == payload, "payload corrupted in transit");

        echo_task.await.unwrap();
        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_agent, payload.len() as u64);
        assert_eq!(stats.agent_to_client, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_finishes_when_client_leaves_and_agent_lingers() {
        let (mut client_app, client_side) = UnixStream::pair().unwrap();
        let (agent_side, mut agent_app) = UnixStream::pair().unwrap();

        let relay_task = tokio::spawn(relay_with_drain(
            client_side,
            agent_side,
            Duration::from_millis(100),
        ));

        client_app.write_all(b"req").await.unwrap();
        drop(client_app);

        let mut request = [0u8; 3];
        agent_app.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"req");

        // The agent keeps its end open and never answers.
        let stats = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay must not wait for the agent to close")
            .unwrap()
            .unwrap();
        assert_eq!(stats.client_to_agent, 3);
        assert_eq!(stats.agent_to_client, 0);
        drop(agent_app);
    }

    #[tokio::test]
    async fn test_relay_delivers_reply_after_client_half_close() {
        let (mut client_app, client_side) = UnixStream::pair().unwrap();
        let (agent_side, mut agent_app) = UnixStream::pair().unwrap();

        let relay_task = tokio::spawn(relay_with_drain(
            client_side,
            agent_side,
            Duration::from_secs(5),
        ));

        client_app.write_all(b"ping").await.unwrap();
        client_app.shutdown().await.unwrap();

        let mut request = [0u8; 4];
        agent_app.read_exact(&mut request).await.unwrap();
        agent_app.write_all(b"pong").await.unwrap();
        agent_app.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.agent_to_client, 4);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::ClientToAgent.to_string(), "client->agent");
        assert_eq!(Direction::AgentToClient.to_string(), "agent->client");
    }
}
