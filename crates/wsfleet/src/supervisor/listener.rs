//! The listening socket shared by every worker.

use std::io;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::ToSocketAddrs;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;

use crate::error::BindError;

#[derive(Debug)]
pub struct SharedListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl SharedListener {
    /// Binds `addr` and marks the descriptor inheritable so exec'd workers
    /// receive it.
    pub fn bind(addr: &str) -> Result<Self, BindError> {
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| BindError::InvalidAddress {
                addr: addr.to_string(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| BindError::InvalidAddress {
                addr: addr.to_string(),
                message: "no resolved address".to_string(),
            })?;

        let io_error = |operation: &'static str| {
            move |source: io::Error| BindError::Io {
                addr: addr.to_string(),
                operation,
                source,
            }
        };

        let listener = TcpListener::bind(resolved).map_err(io_error("bind"))?;
        let local_addr = listener.local_addr().map_err(io_error("read local address of"))?;
        clear_cloexec(listener.as_raw_fd()).map_err(io_error("share descriptor of"))?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by this process; only flag bits change.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
