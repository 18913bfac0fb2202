use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::error::{Result, TransportError};
use crate::traits::{validate_name, IpcStream, StreamListener, Transport};

/// How often a pending accept or connect re-checks the socket.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A listening filesystem-path Unix domain socket.
///
/// The listener is non-blocking; [`UnixDomainSocket::accept_timeout`] polls it
/// so that callers can give up on a rendezvous that never arrives. The socket
/// file is removed on `Drop` unless something else replaced it meanwhile.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    name: String,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `path`.
    ///
    /// A stale socket file at `path` is removed first; any other kind of file
    /// is left alone and reported as a bind error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |path: &Path, source| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
            } else {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| bind_err(&path, e))?;
        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(Self::DEFAULT_SOCKET_MODE),
        )
        .map_err(|e| bind_err(&path, e))?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            name,
            created_inode: Some((created.dev(), created.ino())),
        })
    }

    /// Wait up to `timeout` for one inbound connection.
    ///
    /// The returned stream is in blocking mode.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<IpcStream> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    trace!(path = ?self.path, "accepted connection");
                    return Ok(IpcStream::from_unix(stream));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout {
                            name: self.name.clone(),
                            timeout,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Accept(err)),
            }
        }
    }

    /// Connect to a listening socket (single attempt).
    pub fn connect(path: impl AsRef<Path>) -> Result<IpcStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(IpcStream::from_unix(stream))
    }

    /// Connect to `path`, retrying while nothing listens there yet.
    pub fn connect_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<IpcStream> {
        let path = path.as_ref();
        let deadline = Instant::now() + timeout;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    trace!(?path, "connected to unix domain socket");
                    return Ok(IpcStream::from_unix(stream));
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Connect {
                            path: path.to_path_buf(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                format!("no listener after {timeout:?}: {err}"),
                            ),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(TransportError::Connect {
                        path: path.to_path_buf(),
                        source: err,
                    })
                }
            }
        }
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StreamListener for UnixDomainSocket {
    fn accept_timeout(&self, timeout: Duration) -> Result<IpcStream> {
        UnixDomainSocket::accept_timeout(self, timeout)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                trace!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

/// Unix domain socket [`Transport`]: stream name `N` lives at `<dir>/N.sock`.
#[derive(Debug, Clone)]
pub struct UdsTransport {
    dir: PathBuf,
}

impl UdsTransport {
    /// Mode for a runtime directory created by [`UdsTransport::new`].
    pub const DIR_MODE: u32 = 0o700;

    /// Use `dir` as the runtime directory, creating it (mode 0700) if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(Self::DIR_MODE)
                .create(&dir)
                .map_err(|e| TransportError::Bind {
                    path: dir.clone(),
                    source: e,
                })?;
            info!(?dir, "created runtime directory");
        }
        Ok(Self { dir })
    }

    /// The runtime directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for stream `name`.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.sock")))
    }
}

impl Transport for UdsTransport {
    fn bind(&self, name: &str) -> Result<Box<dyn StreamListener>> {
        let path = self.path_for(name)?;
        let socket = UnixDomainSocket::bind(path)?;
        Ok(Box::new(socket))
    }

    fn connect(&self, name: &str, timeout: Duration) -> Result<IpcStream> {
        let path = self.path_for(name)?;
        UnixDomainSocket::connect_timeout(path, timeout)
    }

    fn transport_name(&self) -> &'static str {
        "unix-domain-socket"
    }
}

/// Effective user id of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("ipcr-{tag}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn test_bind_accept_connect() {
        let dir = temp_dir("uds");
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("test.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());
        assert_eq!(StreamListener::name(&listener), "test");

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = UnixDomainSocket::connect(&path_clone).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept_timeout(Duration::from_secs(2)).unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();

        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_accept_timeout_expires() {
        let dir = temp_dir("accept-timeout");
        std::fs::create_dir_all(&dir).unwrap();
        let listener = UnixDomainSocket::bind(dir.join("idle.sock")).unwrap();

        let started = Instant::now();
        let err = listener
            .accept_timeout(Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_connect_timeout_waits_for_late_listener() {
        let dir = temp_dir("late");
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("late.sock");

        let bind_path = sock_path.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let listener = UnixDomainSocket::bind(&bind_path).unwrap();
            let _stream = listener.accept_timeout(Duration::from_secs(2)).unwrap();
        });

        UnixDomainSocket::connect_timeout(&sock_path, Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_connect_timeout_gives_up() {
        let dir = temp_dir("nobody");
        std::fs::create_dir_all(&dir).unwrap();
        let err = UnixDomainSocket::connect_timeout(dir.join("x.sock"), Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixDomainSocket::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn test_bind_default_permissions_hardened() {
        let dir = temp_dir("perms");
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("perm.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bind_rejects_existing_non_socket_file() {
        let dir = temp_dir("bind-file");
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_drop_does_not_remove_replaced_path() {
        let dir = temp_dir("drop-race");
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("drop.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            sock_path.exists(),
            "drop must not remove path if inode identity changed"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_transport_maps_names_into_runtime_dir() {
        let dir = temp_dir("transport");
        let transport = UdsTransport::new(&dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        assert_eq!(transport.path_for("Test").unwrap(), dir.join("Test.sock"));
        assert!(transport.bind("../escape").is_err());

        let listener = transport.bind("Test").unwrap();
        assert_eq!(listener.name(), "Test");
        let client = std::thread::spawn({
            let transport = transport.clone();
            move || {
                let mut stream = transport.connect("Test", Duration::from_secs(1)).unwrap();
                stream.write_all(b"ping").unwrap();
            }
        });
        let mut stream = listener.accept_timeout(Duration::from_secs(2)).unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_effective_uid_matches_peer_credentials() {
        let (a, _b) = IpcStream::pair().unwrap();
        if let Some((uid, _, _)) = a.peer_credentials() {
            assert_eq!(uid, effective_uid());
        }
    }
}
