//! End-to-end switching tests with an in-process server and mock agents

use rand::RngCore;
use ssh_agent_switcher::agent::{ProcfsInspector, Proxy, Resolver, Server, Shutdown};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// How a mock agent answers
#[derive(Clone, Copy)]
enum Behavior {
    /// Echoes back exactly what it receives
    Echo,
    /// Returns 'a' for every byte received
    AlwaysA,
}

/// Start a mock agent; aborting the handle stops accepting
fn start_mock_agent(socket_path: &Path, behavior: Behavior) -> JoinHandle<()> {
    let listener = UnixListener::bind(socket_path).unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let response = match behavior {
                        Behavior::Echo => buf[..n].to_vec(),
                        Behavior::AlwaysA => vec![b'a'; n],
                    };
                    if stream.write_all(&response).await.is_err() {
                        break;
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    })
}

/// Switcher running in-process over a scratch agents directory
struct TestEnv {
    temp_dir: TempDir,
    agents_dir: PathBuf,
    proc_root: PathBuf,
    socket_path: PathBuf,
    shutdown: Shutdown,
    server_task: JoinHandle<ssh_agent_switcher::Result<()>>,
}

impl TestEnv {
    async fn start() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let agents_dir = temp_dir.path().join("agents");
        let proc_root = temp_dir.path().join("proc");
        let socket_path = temp_dir.path().join("switcher.sock");
        fs::create_dir(&agents_dir).unwrap();
        fs::create_dir(&proc_root).unwrap();

        let resolver = Resolver::new(
            vec![agents_dir.clone()],
            None,
            unsafe { libc::getuid() },
            Arc::new(ProcfsInspector::new(&proc_root)),
        );
        let proxy = Arc::new(Proxy::new(resolver));

        let mut server = Server::new(&socket_path);
        server.bind().await.unwrap();

        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        let server_task = tokio::spawn(async move {
            server
                .run(
                    move |stream| {
                        let proxy = Arc::clone(&proxy);
                        async move { proxy.handle_client(stream).await }
                    },
                    rx,
                )
                .await
        });

        Self {
            temp_dir,
            agents_dir,
            proc_root,
            socket_path,
            shutdown,
            server_task,
        }
    }

    /// Create a session directory with an agent owned by a fake sshd
    fn session_agent(&self, session: &str, pid: i32, behavior: Behavior) -> JoinHandle<()> {
        let proc_dir = self.proc_root.join(pid.to_string());
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(proc_dir.join("cmdline"), "sshd: user@pts/0").unwrap();

        let dir = self.agents_dir.join(session);
        fs::create_dir_all(&dir).unwrap();
        start_mock_agent(&dir.join(format!("agent.{}", pid)), behavior)
    }

    fn remove_session(&self, session: &str) {
        fs::remove_dir_all(self.agents_dir.join(session)).unwrap();
    }

    /// Send `data`, close our write side, and collect the whole reply
    async fn exchange(&self, data: &[u8]) -> Vec<u8> {
        let stream = UnixStream::connect(&self.socket_path).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let data = data.to_vec();
        let sender = tokio::spawn(async move {
            writer.write_all(&data).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut reply))
            .await
            .expect("reply timed out")
            .unwrap();
        sender.await.unwrap();
        reply
    }

    async fn stop(self) {
        self.shutdown.trigger();
        self.server_task.await.unwrap().unwrap();
        assert!(!self.socket_path.exists());
        drop(self.temp_dir);
    }
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let env = TestEnv::start().await;
    let _agent = env.session_agent("ssh-echo", 1000, Behavior::Echo);

    let mut payload = vec![0u8; 4 * 1024 * 1024 + 123];
    rand::thread_rng().fill_bytes(&mut payload);

    let reply = env.exchange(&payload).await;
    assert_eq!(reply.len(), payload.len());
    assert!(reply == payload, "payload corrupted in transit");

    env.stop().await;
}

#[tokio::test]
async fn test_no_agent_closes_clients_and_keeps_listening() {
    let env = TestEnv::start().await;

    for _ in 0..3 {
        let mut stream = UnixStream::connect(&env.socket_path).await.unwrap();
        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut reply))
            .await
            .expect("connection was not closed")
            .unwrap();
        assert!(reply.is_empty());
    }

    // The listener survived and serves as soon as an agent shows up.
    let _agent = env.session_agent("ssh-late", 1001, Behavior::Echo);
    assert_eq!(env.exchange(b"Back online").await, b"Back online");

    env.stop().await;
}

#[tokio::test]
async fn test_switches_between_agents() {
    let env = TestEnv::start().await;

    let echo = env.session_agent("ssh-echo", 2000, Behavior::Echo);
    assert_eq!(env.exchange(b"Hello, SSH agent!").await, b"Hello, SSH agent!");

    // Sessions sort by name, so ssh-always-a wins over ssh-echo.
    let always_a = env.session_agent("ssh-always-a", 2001, Behavior::AlwaysA);
    assert_eq!(env.exchange(b"Test").await, b"aaaa");

    always_a.abort();
    env.remove_session("ssh-always-a");
    assert_eq!(env.exchange(b"Fallback test").await, b"Fallback test");

    echo.abort();
    env.remove_session("ssh-echo");
    assert!(env.exchange(b"No backend").await.is_empty());

    env.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients_are_independent() {
    let env = Arc::new(TestEnv::start().await);
    let _agent = env.session_agent("ssh-echo", 3000, Behavior::Echo);

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let env = Arc::clone(&env);
        tasks.push(tokio::spawn(async move {
            let payload = vec![i; 64 * 1024];
            assert_eq!(env.exchange(&payload).await, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let env = Arc::try_unwrap(env).ok().expect("all clients finished");
    env.stop().await;
}
