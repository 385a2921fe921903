//! The shared listening socket.
//!
//! The supervisor binds exactly one socket and every worker process inherits
//! it at descriptor [`LISTEN_FD`]. Workers never bind on their own, so there
//! is no port race between them, and the kernel hands each accepted
//! connection to exactly one worker.
//!
//! `SO_REUSEADDR` is set so a restarted supervisor can rebind while old
//! connections sit in TIME_WAIT. `SO_REUSEPORT` is deliberately left unset: a
//! second supervisor on the same address must fail with
//! [`BindError::AddressInUse`].

use std::io;
use std::net::{SocketAddr, TcpListener};
use tokio::net::TcpSocket;
use tracing::{debug, info};

use crate::error::BindError;

/// Descriptor number the listener is installed at in worker processes
pub const LISTEN_FD: i32 = 3;

/// Environment variable telling the worker which descriptor to adopt
pub const LISTEN_FD_ENV: &str = "PREFORK_LISTEN_FD";

/// The one listening socket of a supervisor, plus its bound address
#[derive(Debug)]
pub struct ListenerHandle {
    listener: TcpListener,
    addr: SocketAddr,
}

/// Bind the shared listener.
///
/// Must be called from within a tokio runtime.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<ListenerHandle, BindError> {
    let io_err = |source: io::Error| {
        if source.kind() == io::ErrorKind::AddrInUse {
            BindError::AddressInUse { addr }
        } else {
            BindError::Io { addr, source }
        }
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(io_err)?;

    socket.set_reuseaddr(true).map_err(io_err)?;
    socket.bind(addr).map_err(io_err)?;
    let listener = socket.listen(backlog).map_err(io_err)?;
    let listener = listener.into_std().map_err(io_err)?;
    let bound = listener.local_addr().map_err(io_err)?;

    info!(addr = %bound, backlog, "Shared listener bound");

    Ok(ListenerHandle {
        listener,
        addr: bound,
    })
}

/// Parse and bind in one step
pub fn bind_str(address: &str, backlog: u32) -> Result<ListenerHandle, BindError> {
    let addr: SocketAddr = address.parse().map_err(|e: std::net::AddrParseError| {
        BindError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        }
    })?;
    bind(addr, backlog)
}

impl ListenerHandle {
    /// The bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// An independent descriptor for the same socket
    pub fn try_clone_std(&self) -> io::Result<TcpListener> {
        self.listener.try_clone()
    }

    /// A tokio listener sharing this socket's accept queue
    pub fn to_tokio(&self) -> io::Result<tokio::net::TcpListener> {
        let std_listener = self.try_clone_std()?;
        std_listener.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(std_listener)
    }

    /// Arrange for a spawned child to receive this socket at [`LISTEN_FD`]
    #[cfg(unix)]
    pub fn prepare_inheritance(&self, cmd: &mut tokio::process::Command) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let fd = self.listener.as_raw_fd();

        // Runs in the forked child before exec: only async-signal-safe calls.
        unsafe {
            cmd.pre_exec(move || {
                if fd == LISTEN_FD {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, LISTEN_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.env(LISTEN_FD_ENV, LISTEN_FD.to_string());
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn prepare_inheritance(&self, _cmd: &mut tokio::process::Command) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "listener inheritance requires a unix platform",
        ))
    }
}

/// Adopt the listener a supervisor passed down to this worker process
#[cfg(unix)]
pub fn inherit_from_env() -> Result<ListenerHandle, BindError> {
    use std::os::unix::io::FromRawFd;

    let fd = match std::env::var(LISTEN_FD_ENV) {
        Ok(value) => value
            .parse::<i32>()
            .map_err(|e| BindError::NotInherited(format!("{}={}: {}", LISTEN_FD_ENV, value, e)))?,
        Err(_) => {
            return Err(BindError::NotInherited(format!(
                "{} is not set; workers must be started by the supervisor",
                LISTEN_FD_ENV
            )))
        }
    };

    // The descriptor is owned by this process from here on.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    let addr = listener
        .local_addr()
        .map_err(|e| BindError::NotInherited(format!("descriptor {} is not a TCP listener: {}", fd, e)))?;

    // Keep it away from anything this worker spawns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }

    debug!(fd, addr = %addr, "Adopted inherited listener");
    Ok(ListenerHandle { listener, addr })
}

#[cfg(not(unix))]
pub fn inherit_from_env() -> Result<ListenerHandle, BindError> {
    Err(BindError::NotInherited(
        "listener inheritance requires a unix platform".to_string(),
    ))
}
