#[cfg(windows)]
use std::ffi::CString;
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    time::{Duration, Instant},
};
#[cfg(unix)]
use std::{
    os::unix::io::{AsRawFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
};
#[cfg(windows)]
use std::ptr;

// Platform-specific imports
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt};
#[cfg(windows)]
use windows_sys::Win32::{Foundation::*, Storage::FileSystem::*, System::Pipes::*};

use crate::{
    address::Address,
    error::{IpcError, Result},
};

/// One side of a pipe or socket connection
pub enum PlatformSocket {
    #[cfg(unix)]
    /// Unix domain socket
    Unix(UnixStream),
    /// TCP socket
    Tcp(TcpStream),
    #[cfg(windows)]
    /// Windows named pipe handle
    NamedPipe(HANDLE),
}

// SAFETY: a named pipe HANDLE is a kernel object reference that may be used
// from any thread; the enum owns it exclusively and closes it once on drop.
#[cfg(windows)]
unsafe impl Send for PlatformSocket {}

/// Bound listener producing [`PlatformSocket`]s
pub enum PlatformListener {
    #[cfg(unix)]
    /// Unix domain socket listener and the socket file it owns
    Unix {
        /// Underlying listener
        listener: UnixListener,
        /// Socket file, removed on drop
        path:     PathBuf,
    },
    /// TCP listener
    Tcp(TcpListener),
    #[cfg(windows)]
    /// Windows named pipe name
    NamedPipe(String),
}

/// Credentials of the process on the other end of a Unix socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process ID of the peer
    pub pid: u32,
    /// User ID of the peer
    pub uid: u32,
}

impl PlatformSocket {
    /// Set the socket to blocking or non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.set_nonblocking(nonblocking),
            PlatformSocket::Tcp(stream) => stream.set_nonblocking(nonblocking),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                let mode = if nonblocking { PIPE_NOWAIT } else { PIPE_WAIT };

                // SAFETY: SetNamedPipeHandleState is safe with valid handle and mode
                // parameters. Handle is guaranteed valid by enum variant.
                let result = unsafe {
                    SetNamedPipeHandleState(*handle, &mode, ptr::null(), ptr::null())
                };

                if result == 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Set read timeout for the socket
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.set_read_timeout(timeout),
            PlatformSocket::Tcp(stream) => stream.set_read_timeout(timeout),
            // Synchronous pipe handles have no read timeout; the handshake
            // relies on the peer closing instead.
            #[cfg(windows)]
            PlatformSocket::NamedPipe(_handle) => Ok(()),
        }
    }

    /// Close one or both directions without releasing the descriptor
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.shutdown(how),
            PlatformSocket::Tcp(stream) => stream.shutdown(how),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(_handle) => Ok(()),
        }
    }

    /// A second handle on the same endpoint.
    ///
    /// Named pipe handles are not duplicated.
    pub fn try_clone(&self) -> io::Result<PlatformSocket> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.try_clone().map(PlatformSocket::Unix),
            PlatformSocket::Tcp(stream) => stream.try_clone().map(PlatformSocket::Tcp),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(_handle) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "named pipe handles cannot be cloned",
            )),
        }
    }

    /// Wait up to `timeout` (forever when `None`) for the socket to become
    /// readable. End-of-stream counts as readable.
    pub fn poll_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => poll_fd(stream.as_raw_fd(), timeout),
            #[cfg(unix)]
            PlatformSocket::Tcp(stream) => poll_fd(stream.as_raw_fd(), timeout),
            #[cfg(windows)]
            PlatformSocket::Tcp(stream) => peek_tcp(stream, timeout),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => peek_pipe(*handle, timeout),
        }
    }

    /// Extract the peer's credentials (Unix domain sockets only)
    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => unix_peer_credentials(stream),
            _ => Err(IpcError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "peer credentials are only available on Unix domain sockets",
            ))),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn unix_peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let creds = getsockopt(stream, sockopt::PeerCredentials).map_err(io::Error::from)?;
    Ok(PeerCredentials {
        pid: creds.pid() as u32,
        uid: creds.uid(),
    })
}

#[cfg(target_os = "macos")]
fn unix_peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    // SAFETY: getpeereid is safe to call with valid file descriptor and mutable
    // references to uid_t and gid_t living on the stack.
    if unsafe { libc::getpeereid(fd, &mut uid, &mut gid) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    let mut pid: libc::pid_t = 0;
    let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
    // SAFETY: getsockopt is called with a valid fd, a valid level/option pair
    // and a buffer whose size matches pid_len.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut pid_len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(PeerCredentials {
        pid: pid as u32,
        uid,
    })
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android", target_os = "macos"))))]
fn unix_peer_credentials(_stream: &UnixStream) -> Result<PeerCredentials> {
    Err(IpcError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "peer credentials are not supported on this Unix platform",
    )))
}

#[cfg(unix)]
fn poll_fd(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Round up so a sub-millisecond wait still waits.
                remaining.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32
            }
        };

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: poll is given a pointer to exactly one initialised pollfd on
        // the stack and a matching count of 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

#[cfg(windows)]
fn peek_tcp(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<bool> {
    let immediate = timeout.is_some_and(|t| t.is_zero());
    if immediate {
        stream.set_nonblocking(true)?;
    } else {
        stream.set_read_timeout(timeout)?;
    }

    let mut probe = [0u8; 1];
    let result = stream.peek(&mut probe);

    if immediate {
        stream.set_nonblocking(false)?;
    } else {
        stream.set_read_timeout(None)?;
    }

    match result {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(windows)]
fn peek_pipe(handle: HANDLE, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let mut available = 0u32;
        // SAFETY: PeekNamedPipe is called with a valid handle, no data buffer
        // and a pointer to a stack u32 for the available byte count.
        let ok = unsafe {
            PeekNamedPipe(
                handle,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut available,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
                return Ok(true);
            }
            return Err(err);
        }
        if available > 0 {
            return Ok(true);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl Read for PlatformSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.read(buf),
            PlatformSocket::Tcp(stream) => stream.read(buf),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                let mut bytes_read = 0u32;
                // SAFETY: ReadFile is safe when called with:
                // - Valid handle (guaranteed by enum variant)
                // - Valid buffer pointer and size (buf is a valid slice)
                // - Valid pointer to bytes_read (stack variable)
                // - null overlapped pointer for synchronous operation
                let result = unsafe {
                    ReadFile(
                        *handle,
                        buf.as_mut_ptr(),
                        buf.len() as u32,
                        &mut bytes_read,
                        ptr::null_mut(),
                    )
                };

                if result == 0 {
                    let err = io::Error::last_os_error();
                    // The writer closing its end is end-of-stream, not an error.
                    if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
                        return Ok(0);
                    }
                    Err(err)
                } else {
                    Ok(bytes_read as usize)
                }
            }
        }
    }
}

impl Write for PlatformSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.write(buf),
            PlatformSocket::Tcp(stream) => stream.write(buf),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                let mut bytes_written = 0u32;
                // SAFETY: WriteFile is safe when called with:
                // - Valid handle (guaranteed by enum variant)
                // - Valid buffer pointer and size (buf is a valid slice)
                // - Valid pointer to bytes_written (stack variable)
                // - null overlapped pointer for synchronous operation
                let result = unsafe {
                    WriteFile(
                        *handle,
                        buf.as_ptr(),
                        buf.len() as u32,
                        &mut bytes_written,
                        ptr::null_mut(),
                    )
                };

                if result == 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(bytes_written as usize)
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.flush(),
            PlatformSocket::Tcp(stream) => stream.flush(),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                // SAFETY: FlushFileBuffers is safe when called with a valid handle.
                // The handle is guaranteed valid by the enum variant.
                let result = unsafe { FlushFileBuffers(*handle) };
                if result == 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(windows)]
impl Drop for PlatformSocket {
    fn drop(&mut self) {
        if let PlatformSocket::NamedPipe(handle) = self {
            // SAFETY: CloseHandle is safe with valid handle to clean up resources.
            // Handle is guaranteed valid by enum variant construction and is
            // closed exactly once here.
            unsafe {
                CloseHandle(*handle);
            }
        }
    }
}

impl PlatformListener {
    /// Create a listener bound to `address`
    pub fn bind(address: &Address) -> Result<Self> {
        match address {
            Address::Inet { host, port } => {
                tracing::debug!("Binding TCP listener on {}:{}", host, port);
                let listener = TcpListener::bind((host.as_str(), *port))?;
                tracing::info!("Bound TCP listener on {}", listener.local_addr()?);
                Ok(PlatformListener::Tcp(listener))
            }
            #[cfg(unix)]
            Address::Unix(path) => bind_unix(path),
            #[cfg(not(unix))]
            Address::Unix(path) => Err(IpcError::Address(format!(
                "Unix domain sockets are not available on this platform: {}",
                path.display()
            ))),
            #[cfg(windows)]
            Address::Pipe(name) => {
                tracing::info!("Serving named pipe {}", name);
                Ok(PlatformListener::NamedPipe(name.clone()))
            }
            #[cfg(not(windows))]
            Address::Pipe(name) => Err(IpcError::Address(format!(
                "named pipes are only available on Windows: {name}"
            ))),
        }
    }

    /// The address peers should connect to; reports the real port when bound
    /// to port 0.
    pub fn local_address(&self) -> Result<Address> {
        match self {
            #[cfg(unix)]
            PlatformListener::Unix { path, .. } => Ok(Address::Unix(path.clone())),
            PlatformListener::Tcp(listener) => Ok(listener.local_addr()?.into()),
            #[cfg(windows)]
            PlatformListener::NamedPipe(name) => Ok(Address::Pipe(name.clone())),
        }
    }

    /// Switch accept between blocking and non-blocking. Named pipes always
    /// block.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformListener::Unix { listener, .. } => listener.set_nonblocking(nonblocking),
            PlatformListener::Tcp(listener) => listener.set_nonblocking(nonblocking),
            #[cfg(windows)]
            PlatformListener::NamedPipe(_) => Ok(()),
        }
    }

    /// Accept one incoming connection with blocking I/O configured
    pub fn accept(&self) -> Result<PlatformSocket> {
        match self {
            #[cfg(unix)]
            PlatformListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                let socket = PlatformSocket::Unix(stream);
                socket.set_nonblocking(false)?;
                Ok(socket)
            }
            PlatformListener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                tracing::debug!("Accepted TCP connection from {}", peer);
                stream.set_nodelay(true)?;
                let socket = PlatformSocket::Tcp(stream);
                socket.set_nonblocking(false)?;
                Ok(socket)
            }
            #[cfg(windows)]
            PlatformListener::NamedPipe(pipe_name) => accept_pipe(pipe_name),
        }
    }

    /// Get iterator over incoming connections
    pub fn incoming(&self) -> IncomingConnections<'_> {
        IncomingConnections { listener: self }
    }
}

impl Drop for PlatformListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let PlatformListener::Unix { path, .. } = self {
            match std::fs::remove_file(path.as_path()) {
                Ok(()) => tracing::debug!("Removed socket file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove socket file {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> Result<PlatformListener> {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    tracing::debug!("Setting up Unix socket listener at {}", path.display());

    // A socket file left behind by a dead listener blocks bind.
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            tracing::warn!("Existing socket file found at {}, removing it", path.display());
            std::fs::remove_file(path)?;
        }
        Ok(_) => {
            return Err(IpcError::Address(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Err(_) => tracing::debug!("No existing socket file found"),
    }

    let listener = UnixListener::bind(path).map_err(|e| {
        tracing::error!("Failed to bind to socket: {} (kind: {:?})", e, e.kind());
        let detail = match e.kind() {
            io::ErrorKind::PermissionDenied => format!(
                "Permission denied creating socket '{}'. Check the parent directory permissions.",
                path.display()
            ),
            io::ErrorKind::AddrInUse => format!(
                "Socket '{}' is already in use by another listener.",
                path.display()
            ),
            io::ErrorKind::InvalidInput => format!(
                "Invalid socket path '{}'. Check that the path is valid and not too long.",
                path.display()
            ),
            _ => format!("Unexpected error binding to socket '{}': {}", path.display(), e),
        };
        IpcError::Io(io::Error::new(e.kind(), detail))
    })?;

    // Owner read/write only
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set socket permissions: {}", e);
    }

    tracing::info!("Bound Unix socket listener on {}", path.display());
    Ok(PlatformListener::Unix {
        listener,
        path: path.to_path_buf(),
    })
}

#[cfg(windows)]
fn accept_pipe(pipe_name: &str) -> Result<PlatformSocket> {
    let pipe_name_cstr =
        CString::new(pipe_name.as_bytes()).map_err(|e| IpcError::Address(e.to_string()))?;

    // SAFETY: CreateNamedPipeA is called with a valid NUL-terminated name and
    // null security attributes (default DACL, owner and administrators only).
    let pipe_handle = unsafe {
        CreateNamedPipeA(
            pipe_name_cstr.as_ptr() as *const u8,
            PIPE_ACCESS_DUPLEX,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
            PIPE_UNLIMITED_INSTANCES,
            64 * 1024, // Out buffer size
            64 * 1024, // In buffer size
            0,         // Default client wait timeout
            ptr::null(),
        )
    };

    if pipe_handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error().into());
    }

    // SAFETY: ConnectNamedPipe is safe with valid pipe handle and null overlapped
    // pointer
    let connected = unsafe { ConnectNamedPipe(pipe_handle, ptr::null_mut()) };

    if connected == 0 {
        // SAFETY: GetLastError() is always safe to call
        let error = unsafe { GetLastError() };
        if error != ERROR_PIPE_CONNECTED {
            // SAFETY: CloseHandle is safe with valid handle to prevent resource leak
            unsafe {
                CloseHandle(pipe_handle);
            }
            return Err(io::Error::from_raw_os_error(error as i32).into());
        }
    }

    Ok(PlatformSocket::NamedPipe(pipe_handle))
}

/// Iterator over incoming connections
pub struct IncomingConnections<'a> {
    listener: &'a PlatformListener,
}

impl Iterator for IncomingConnections<'_> {
    type Item = Result<PlatformSocket>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.listener.accept())
    }
}

/// Connect to `address` with blocking I/O configured
pub fn connect_socket(address: &Address) -> Result<PlatformSocket> {
    tracing::debug!("Connecting to {}", address);
    match address {
        Address::Inet { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))?;
            stream.set_nodelay(true)?;
            Ok(PlatformSocket::Tcp(stream))
        }
        #[cfg(unix)]
        Address::Unix(path) => {
            let stream = UnixStream::connect(path).map_err(|e| {
                tracing::error!("Connection failed: {} (kind: {:?})", e, e.kind());
                let detail = match e.kind() {
                    io::ErrorKind::NotFound => format!(
                        "Socket file not found at '{}'. The listener may have stopped or never \
                         started.",
                        path.display()
                    ),
                    io::ErrorKind::PermissionDenied => format!(
                        "Permission denied accessing socket '{}'.",
                        path.display()
                    ),
                    io::ErrorKind::ConnectionRefused => format!(
                        "Connection refused to socket '{}'. The listener may be shutting down.",
                        path.display()
                    ),
                    _ => format!("Unexpected error connecting to '{}': {}", path.display(), e),
                };
                IpcError::Io(io::Error::new(e.kind(), detail))
            })?;
            Ok(PlatformSocket::Unix(stream))
        }
        #[cfg(not(unix))]
        Address::Unix(path) => Err(IpcError::Address(format!(
            "Unix domain sockets are not available on this platform: {}",
            path.display()
        ))),
        #[cfg(windows)]
        Address::Pipe(pipe_name) => connect_pipe(pipe_name),
        #[cfg(not(windows))]
        Address::Pipe(name) => Err(IpcError::Address(format!(
            "named pipes are only available on Windows: {name}"
        ))),
    }
}

#[cfg(windows)]
fn connect_pipe(pipe_name: &str) -> Result<PlatformSocket> {
    let pipe_name_cstr =
        CString::new(pipe_name.as_bytes()).map_err(|e| IpcError::Address(e.to_string()))?;

    // SAFETY: WaitNamedPipeA is safe with valid pipe name C string and timeout
    // value
    let wait_result =
        unsafe { WaitNamedPipeA(pipe_name_cstr.as_ptr() as *const u8, NMPWAIT_WAIT_FOREVER) };

    if wait_result == 0 {
        return Err(io::Error::last_os_error().into());
    }

    // SAFETY: CreateFileA is safe when called with:
    // - Valid pipe name C string
    // - Valid access flags (GENERIC_READ | GENERIC_WRITE)
    // - Null security attributes and template handle for named pipes
    let pipe_handle = unsafe {
        CreateFileA(
            pipe_name_cstr.as_ptr() as *const u8,
            GENERIC_READ | GENERIC_WRITE,
            0,
            ptr::null(),
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };

    if pipe_handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error().into());
    }

    tracing::debug!("Connected to named pipe {}", pipe_name);
    Ok(PlatformSocket::NamedPipe(pipe_handle))
}

/// A connected pair of endpoints within this process
pub fn socket_pair() -> Result<(PlatformSocket, PlatformSocket)> {
    #[cfg(unix)]
    {
        let (a, b) = UnixStream::pair()?;
        Ok((PlatformSocket::Unix(a), PlatformSocket::Unix(b)))
    }

    #[cfg(not(unix))]
    {
        // Loopback TCP stands in for socketpair(2).
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let a = TcpStream::connect(listener.local_addr()?)?;
        let (b, _) = listener.accept()?;
        a.set_nodelay(true)?;
        b.set_nodelay(true)?;
        Ok((PlatformSocket::Tcp(a), PlatformSocket::Tcp(b)))
    }
}
