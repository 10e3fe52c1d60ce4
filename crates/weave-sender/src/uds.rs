// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix-domain socket plumbing for the RPC server.
//!
//! Handles the filesystem side of the listener: path validation, removal of
//! stale socket files left by an unclean exit, permission bits, and cleanup
//! of the socket inode when the server shuts down.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tracing::warn;

/// Safe margin under the kernel's 108-byte sun_path limit.
const MAX_SOCKET_PATH_BYTES: usize = 100;

/// Validates a socket path before binding.
///
/// Rejects empty paths, paths with NUL bytes (they break the C socket API),
/// and paths longer than the kernel allows.
pub fn validate_socket_path(path: &Path) -> io::Result<()> {
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path cannot be empty",
        ));
    }
    if bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path cannot contain NUL bytes",
        ));
    }
    if bytes.len() > MAX_SOCKET_PATH_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "socket path too long: {} bytes (maximum {MAX_SOCKET_PATH_BYTES}): {}",
                bytes.len(),
                path.display()
            ),
        ));
    }
    Ok(())
}

/// Removes a stale socket file from a previous run.
///
/// Refuses to remove symlinks: unlinking through one would let another user
/// redirect the deletion at an arbitrary file.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "socket path is a symlink, refusing to remove: {}",
                path.display()
            ),
        ));
    }
    fs::remove_file(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!(
                "failed to remove existing socket at {}: {e}. It may be in use by another process.",
                path.display()
            ),
        )
    })
}

/// Binds the listener: validates the path, unlinks any stale socket file,
/// binds, and applies the permission mode. Returns the listener together
/// with a guard that unlinks the socket file on drop.
pub fn bind_socket(path: &Path, permissions: u32) -> io::Result<(UnixListener, SocketCleanupGuard)> {
    validate_socket_path(path)?;
    remove_stale_socket(path)?;

    let listener = UnixListener::bind(path).map_err(|e| {
        let message = match e.kind() {
            io::ErrorKind::AddrInUse | io::ErrorKind::AlreadyExists => format!(
                "failed to bind socket {}: already in use by another process: {e}",
                path.display()
            ),
            io::ErrorKind::PermissionDenied => format!(
                "failed to bind socket {}: permission denied, check directory permissions: {e}",
                path.display()
            ),
            _ => format!("failed to bind socket {}: {e}", path.display()),
        };
        io::Error::new(e.kind(), message)
    })?;

    fs::set_permissions(path, fs::Permissions::from_mode(permissions)).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!(
                "failed to set permissions {:o} on socket {}: {e}",
                permissions,
                path.display()
            ),
        )
    })?;

    Ok((listener, SocketCleanupGuard::new(path.to_path_buf())))
}

/// Unlinks the socket file when dropped.
///
/// Tokio's `UnixListener` does not remove the socket inode on drop; without
/// this guard every restart would trip over the previous run's file.
#[derive(Debug)]
pub struct SocketCleanupGuard {
    path: PathBuf,
}

impl SocketCleanupGuard {
    fn new(path: PathBuf) -> Self {
        SocketCleanupGuard { path }
    }
}

impl Drop for SocketCleanupGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove socket file {}: {e}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs as unix_fs;
    use tempfile::TempDir;

    #[test]
    fn test_validate_rejects_empty_path() {
        let err = validate_socket_path(Path::new("")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_validate_rejects_long_path() {
        let long = format!("/tmp/{}.sock", "a".repeat(120));
        let err = validate_socket_path(Path::new(&long)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_validate_accepts_typical_path() {
        assert!(validate_socket_path(Path::new("/tmp/weave-sender.sock")).is_ok());
    }

    #[tokio::test]
    async fn test_bind_removes_stale_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"stale").unwrap();

        let (listener, guard) = bind_socket(&path, 0o600).unwrap();
        assert!(path.exists());
        drop(listener);
        drop(guard);
        assert!(!path.exists(), "guard should unlink the socket file");
    }

    #[tokio::test]
    async fn test_bind_refuses_symlink() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"important").unwrap();
        let link = dir.path().join("link.sock");
        unix_fs::symlink(&target, &link).unwrap();

        let err = bind_socket(&link, 0o600).unwrap_err();
        assert!(err.to_string().contains("symlink"));
        assert!(target.exists(), "symlink target must be untouched");
    }

    #[tokio::test]
    async fn test_bind_applies_permissions() {
        let dir = TempDir::new().unwrap();
        for mode in [0o600u32, 0o666] {
            let path = dir.path().join(format!("perm-{mode:o}.sock"));
            let (_listener, _guard) = bind_socket(&path, mode).unwrap();
            let actual = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(actual, mode, "expected {mode:o}, got {actual:o}");
        }
    }

    #[tokio::test]
    async fn test_bind_fails_in_missing_directory() {
        let path = Path::new("/tmp/weave-sender-test-no-such-dir/agent.sock");
        assert!(bind_socket(path, 0o600).is_err());
    }
}
