//! Unix socket utility functions
//!
//! Provides the low-level operations needed to claim a well-known socket
//! path: liveness probing, stale file removal, permission handling and
//! identity tracking so that we never delete a socket we did not create.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

/// First descriptor passed by systemd socket activation
pub const LISTEN_FDS_START: RawFd = 3;

/// Error type for socket operations
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("Refusing to replace symlink at {path}: potential security risk")]
    SymlinkDetected { path: String },

    #[error("Refusing to replace {path}: it exists and is not a socket")]
    NotASocket { path: String },

    #[error("Failed to check existing socket at {path}: {source}")]
    MetadataError { path: String, source: io::Error },

    #[error("Failed to remove existing socket at {path}: {source}")]
    RemoveError { path: String, source: io::Error },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirError { path: String, source: io::Error },

    #[error("Failed to set permissions on socket at {path}: {source}")]
    PermissionError { path: String, source: io::Error },

    #[error("Failed to lock directory {path}: {source}")]
    LockError { path: String, source: io::Error },

    #[error("Invalid socket activation: {reason}")]
    ActivationError { reason: String },
}

/// What currently occupies a path we want to bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingSocket {
    /// Nothing there
    Absent,
    /// A socket somebody is accepting connections on
    Live,
    /// A socket nobody listens on anymore
    Stale,
}

/// Inspect `path` before binding to it.
///
/// Only dead sockets are reclaimable. Symlinks are never followed.
///
/// # Errors
/// - Returns `SymlinkDetected` if the path is a symbolic link
/// - Returns `NotASocket` if the path holds any other kind of file
/// - Returns `MetadataError` if metadata cannot be read (except NotFound)
pub fn probe_existing_socket(path: &Path) -> Result<ExistingSocket, SocketError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => Err(SocketError::SymlinkDetected {
            path: path.display().to_string(),
        }),
        Ok(metadata) if metadata.file_type().is_socket() => {
            if UnixStream::connect(path).is_ok() {
                Ok(ExistingSocket::Live)
            } else {
                Ok(ExistingSocket::Stale)
            }
        }
        Ok(_) => Err(SocketError::NotASocket {
            path: path.display().to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ExistingSocket::Absent),
        Err(e) => Err(SocketError::MetadataError {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

/// Safely remove an existing socket file if present.
///
/// This function uses `symlink_metadata` instead of `exists` to prevent
/// TOCTOU race conditions. If the path is a symlink, it returns an error
/// to prevent potential symlink attacks.
///
/// # Errors
/// - Returns `SymlinkDetected` if the path is a symbolic link
/// - Returns `MetadataError` if metadata cannot be read (except NotFound)
/// - Returns `RemoveError` if the file cannot be removed
pub fn remove_existing_socket(path: &Path) -> Result<(), SocketError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(SocketError::SymlinkDetected {
                    path: path.display().to_string(),
                });
            }
            fs::remove_file(path).map_err(|e| SocketError::RemoveError {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(SocketError::MetadataError {
                path: path.display().to_string(),
                source: e,
            });
        }
    }
    Ok(())
}

/// Ensure the parent directory of a path exists.
///
/// # Errors
/// Returns `CreateDirError` if directory creation fails.
pub fn ensure_parent_dir(path: &Path) -> Result<(), SocketError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| SocketError::CreateDirError {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    Ok(())
}

/// Set socket permissions to owner read/write only (0600).
///
/// # Errors
/// Returns `PermissionError` if permissions cannot be set.
pub fn set_socket_permissions(path: &Path) -> Result<(), SocketError> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        SocketError::PermissionError {
            path: path.display().to_string(),
            source: e,
        }
    })
}

/// Restores the previous umask when dropped
pub struct UmaskGuard {
    old_umask: libc::mode_t,
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // SAFETY: umask only swaps the process file creation mask.
        unsafe { libc::umask(self.old_umask) };
    }
}

/// Set the process umask, returning a guard that restores the old one.
///
/// Binding a Unix socket creates the file with `0777 & !umask`; setting
/// `0o177` around the bind means the socket is never reachable by anybody
/// else, not even between `bind` and a later `chmod`.
pub fn set_umask(umask: libc::mode_t) -> UmaskGuard {
    // SAFETY: umask only swaps the process file creation mask.
    UmaskGuard {
        old_umask: unsafe { libc::umask(umask) },
    }
}

/// Exclusive advisory lock on a directory, released on drop.
///
/// Serializes concurrent instances racing to claim the same socket path
/// without creating any extra file next to it.
pub struct DirLock {
    _dir: File,
}

impl DirLock {
    /// Block until the exclusive lock on `dir` is held
    pub fn acquire(dir: &Path) -> Result<Self, SocketError> {
        let lock_error = |source| SocketError::LockError {
            path: dir.display().to_string(),
            source,
        };

        let file = File::open(dir).map_err(lock_error)?;
        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(lock_error(io::Error::last_os_error()));
        }
        Ok(Self { _dir: file })
    }
}

/// Device and inode of a file, used to recognise "our" socket later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    /// Get the identity of the file at `path` without following symlinks
    pub fn of(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }
}

/// Remove `path` only if it still is the file identified by `identity`.
///
/// Returns whether the file was removed.
pub fn remove_if_same(path: &Path, identity: FileIdentity) -> io::Result<bool> {
    match FileIdentity::of(path) {
        Ok(current) if current == identity => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Descriptor handed over by systemd, if any.
///
/// `LISTEN_PID`, when set, must name this process. Exactly one descriptor
/// is expected since a single socket is served.
pub fn activation_fd(
    listen_fds: Option<&str>,
    listen_pid: Option<&str>,
    pid: u32,
) -> Result<Option<RawFd>, SocketError> {
    let Some(listen_fds) = listen_fds.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if let Some(listen_pid) = listen_pid.filter(|v| !v.is_empty())
        && listen_pid.parse::<u32>().ok() != Some(pid)
    {
        return Ok(None);
    }

    match listen_fds.parse::<u32>() {
        Ok(0) => Ok(None),
        Ok(1) => Ok(Some(LISTEN_FDS_START)),
        Ok(n) => Err(SocketError::ActivationError {
            reason: format!("expected one socket, got {}", n),
        }),
        Err(e) => Err(SocketError::ActivationError {
            reason: format!("LISTEN_FDS={:?}: {}", listen_fds, e),
        }),
    }
}

/// Take ownership of the listening socket passed by systemd, if any
///
/// Must be called at most once per process.
pub fn take_activated_listener() -> Result<Option<UnixListener>, SocketError> {
    let listen_fds = std::env::var("LISTEN_FDS").ok();
    let listen_pid = std::env::var("LISTEN_PID").ok();
    let fd = activation_fd(
        listen_fds.as_deref(),
        listen_pid.as_deref(),
        std::process::id(),
    )?;
    let Some(fd) = fd else {
        return Ok(None);
    };

    // SAFETY: fstat only fills the zeroed buffer.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(SocketError::ActivationError {
            reason: format!("descriptor {}: {}", fd, io::Error::last_os_error()),
        });
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(SocketError::ActivationError {
            reason: format!("descriptor {} is not a socket", fd),
        });
    }

    // SAFETY: fd is an open socket nobody else in this process owns.
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        Ok(Some(UnixListener::from_raw_fd(fd)))
    }
}
