//! Run command - serve the stable socket in the foreground or as a daemon

use anyhow::{Context, Result};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::agent::{self, Proxy, Resolver, Server, Shutdown};
use crate::cli::Cli;
use crate::config::{self, ConfigFile, Settings, SwitcherConfig};
use crate::error::Error;
use crate::service::{Daemon, PidFile, Readiness};
use crate::utils::socket;

/// Execute the command line
pub async fn execute(cli: Cli) -> Result<()> {
    let file = load_file_config(cli.config.as_deref())?;
    if let Some(file) = &file {
        info!("Using configuration file {}", file.path.display());
    }
    let settings = Settings::resolve(&cli.overrides(), file.as_ref().map(|f| &f.config))
        .context("Failed to determine settings")?;

    let activated = socket::take_activated_listener().map_err(Error::from)?;
    if activated.is_some() {
        info!("Using the socket passed by systemd: ignoring --socket-path and --daemon");
    } else if cli.daemon && !cli.detached {
        return start_daemon(&cli, &settings).await;
    }

    let pid_file = if cli.detached {
        Some(settings.pid_file.clone())
    } else {
        info!("Running in the foreground: ignoring --log-file and --pid-file");
        None
    };
    serve(settings.switcher, pid_file, activated).await?;
    Ok(())
}

/// Load the explicitly requested configuration file or look for one
fn load_file_config(path: Option<&Path>) -> Result<Option<ConfigFile>> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => config::find_config_file(),
    };
    match path {
        Some(path) => Ok(Some(config::load_config(&path)?)),
        None => Ok(None),
    }
}

/// Launch the detached child and wait for it to serve
async fn start_daemon(cli: &Cli, settings: &Settings) -> Result<()> {
    let daemon = Daemon::new(
        &settings.log_file,
        &settings.pid_file,
        &settings.switcher.socket_path,
    );
    match daemon.start(&cli.child_args(settings)).await? {
        Readiness::Started { .. } => {}
        Readiness::AlreadyRunning => {
            info!(
                "Another daemon holds {}; leaving it alone",
                daemon.pid_file().display()
            );
        }
    }
    Ok(())
}

/// Serve the stable socket until a termination signal arrives
///
/// With `pid_file` set, the PID file is claimed first and a live holder makes
/// this return successfully without touching the socket. The same applies
/// when another instance already serves the socket. An `activated` listener
/// is served as is instead of binding `config.socket_path`.
pub async fn serve(
    config: SwitcherConfig,
    pid_file: Option<PathBuf>,
    activated: Option<StdUnixListener>,
) -> crate::Result<()> {
    agent::ignore_hangup();

    let shutdown = Shutdown::new();
    let signals = agent::spawn_signal_listener(shutdown.clone())?;
    let _signals = scopeguard::guard(signals, |handle| handle.abort());

    // Declared before the server so it is released after the socket is gone.
    let _pid_file = match pid_file {
        Some(path) => match PidFile::acquire(&path) {
            Ok(pid_file) => Some(pid_file),
            Err(Error::AlreadyRunning(path)) => {
                info!("PID file {} is held by another instance", path.display());
                return Ok(());
            }
            Err(e) => return Err(e),
        },
        None => None,
    };

    let mut server = match activated {
        Some(listener) => Server::from_listener(listener)?,
        None => {
            let mut server = Server::new(&config.socket_path);
            match server.bind().await {
                Ok(()) => {}
                Err(e @ Error::AlreadyRunning(_)) => {
                    info!("{}", e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            server
        }
    };

    let proxy = Arc::new(Proxy::new(Resolver::from_config(&config)));
    server
        .run(
            move |stream| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.handle_client(stream).await }
            },
            shutdown.subscribe(),
        )
        .await
}
