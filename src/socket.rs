//! Socket wrapper.
//!
//! [`Socket`] owns a descriptor and routes every potentially blocking
//! operation through the hook layer, so that inside a fiber a call like
//! [`Socket::recv`] parks the fiber instead of the thread. Stream sockets
//! are created lazily (on bind/connect), datagram sockets eagerly.

use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use libc::c_int;
use log::{debug, warn};
use nix::errno::Errno;

use crate::address;
use crate::fd_manager::fd_manager;
use crate::hook::{self, origin};
use crate::io::{Event, IoManager};

fn to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// A family/type/protocol socket delegating I/O through the hook layer.
pub struct Socket {
    fd: RawFd,
    family: c_int,
    ty: c_int,
    protocol: c_int,
    connected: bool,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl Socket {
    /// IPv4 TCP socket; the descriptor is created on first bind/connect.
    pub fn tcp() -> Socket {
        Socket::from_parts(libc::AF_INET, libc::SOCK_STREAM, 0)
    }

    /// IPv6 TCP socket.
    pub fn tcp6() -> Socket {
        Socket::from_parts(libc::AF_INET6, libc::SOCK_STREAM, 0)
    }

    /// IPv4 UDP socket, created immediately and usable at once.
    pub fn udp() -> io::Result<Socket> {
        let mut sock = Socket::from_parts(libc::AF_INET, libc::SOCK_DGRAM, 0);
        sock.ensure_fd().map_err(to_io)?;
        sock.connected = true;
        Ok(sock)
    }

    /// IPv6 UDP socket.
    pub fn udp6() -> io::Result<Socket> {
        let mut sock = Socket::from_parts(libc::AF_INET6, libc::SOCK_DGRAM, 0);
        sock.ensure_fd().map_err(to_io)?;
        sock.connected = true;
        Ok(sock)
    }

    fn from_parts(family: c_int, ty: c_int, protocol: c_int) -> Socket {
        Socket {
            fd: -1,
            family,
            ty,
            protocol,
            connected: false,
            local: None,
            remote: None,
        }
    }

    /// Wrap a descriptor handed back by `accept`.
    fn from_accepted(fd: RawFd, family: c_int, ty: c_int, protocol: c_int) -> io::Result<Socket> {
        match fd_manager().get(fd, true) {
            Some(entry) if entry.is_socket() && !entry.is_closed() => {}
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "not an open socket")),
        }
        let mut sock = Socket {
            fd,
            family,
            ty,
            protocol,
            connected: true,
            local: None,
            remote: None,
        };
        sock.apply_default_options();
        let _ = sock.local_endpoint();
        let _ = sock.peer_endpoint();
        Ok(sock)
    }

    fn ensure_fd(&mut self) -> nix::Result<()> {
        if self.fd >= 0 {
            return Ok(());
        }
        self.fd = hook::socket(self.family, self.ty, self.protocol)?;
        self.apply_default_options();
        Ok(())
    }

    fn apply_default_options(&self) {
        let one: c_int = 1;
        let rc = origin::setsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const c_int as *const libc::c_void,
            mem::size_of::<c_int>() as libc::socklen_t,
        );
        if let Err(err) = rc {
            warn!("SO_REUSEADDR on fd {} failed: {}", self.fd, err);
        }
        if self.ty == libc::SOCK_STREAM {
            let _ = origin::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const c_int as *const libc::c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            );
        }
    }

    fn check_family(&self, addr: &SocketAddr) -> io::Result<()> {
        let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        if family != self.family {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address family does not match the socket",
            ));
        }
        Ok(())
    }

    pub fn bind(&mut self, addr: &SocketAddr) -> io::Result<()> {
        self.ensure_fd().map_err(to_io)?;
        self.check_family(addr)?;
        let (storage, len) = address::to_sockaddr(addr);
        origin::bind(
            self.fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
        .map_err(to_io)?;
        self.local = None;
        let _ = self.local_endpoint();
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        if self.fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket not created"));
        }
        origin::listen(self.fd, backlog).map_err(to_io)
    }

    /// Accept one connection, parking the calling fiber until it arrives.
    pub fn accept(&self) -> io::Result<Socket> {
        let fd = hook::accept(self.fd).map_err(to_io)?;
        Socket::from_accepted(fd, self.family, self.ty, self.protocol)
    }

    /// Connect, parking the calling fiber; `None` waits without bound.
    pub fn connect(&mut self, addr: &SocketAddr, timeout_ms: Option<u64>) -> io::Result<()> {
        self.remote = Some(*addr);
        self.ensure_fd().map_err(to_io)?;
        self.check_family(addr)?;
        if let Err(err) = hook::connect_with_timeout(self.fd, addr, timeout_ms) {
            debug!("connect {} failed: {}", addr, err);
            self.close();
            return Err(to_io(err));
        }
        self.connected = true;
        self.local = None;
        let _ = self.local_endpoint();
        Ok(())
    }

    /// Re-run `connect` against the last remote endpoint.
    pub fn reconnect(&mut self, timeout_ms: Option<u64>) -> io::Result<()> {
        let Some(remote) = self.remote else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no remote endpoint"));
        };
        self.local = None;
        self.connect(&remote, timeout_ms)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.send_flags(buf, 0)
    }

    pub fn send_flags(&self, buf: &[u8], flags: c_int) -> io::Result<usize> {
        if !self.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        hook::send(self.fd, buf, flags).map_err(to_io)
    }

    /// Send every byte of `buf`, parking as needed.
    pub fn send_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send(&buf[sent..])?;
        }
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_flags(buf, 0)
    }

    pub fn recv_flags(&self, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
        if !self.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        hook::recv(self.fd, buf, flags).map_err(to_io)
    }

    /// Gathering send over `sendmsg`.
    pub fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        if !self.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        hook::send_vectored(self.fd, bufs, 0).map_err(to_io)
    }

    /// Scattering receive over `recvmsg`.
    pub fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        if !self.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        hook::recv_vectored(self.fd, bufs, 0).map_err(to_io)
    }

    /// Datagram send to an explicit destination.
    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        hook::send_to(self.fd, buf, addr, 0).map_err(to_io)
    }

    /// Datagram receive reporting the sender.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        hook::recv_from(self.fd, buf, 0).map_err(to_io)
    }

    /// Receive timeout consulted by the hooked `recv` path.
    pub fn set_recv_timeout(&self, ms: Option<u64>) -> io::Result<()> {
        hook::set_socket_timeout(self.fd, libc::SO_RCVTIMEO, ms).map_err(to_io)
    }

    pub fn recv_timeout(&self) -> Option<u64> {
        fd_manager().get(self.fd, false)?.timeout(Event::READ)
    }

    /// Send timeout consulted by the hooked `send` path.
    pub fn set_send_timeout(&self, ms: Option<u64>) -> io::Result<()> {
        hook::set_socket_timeout(self.fd, libc::SO_SNDTIMEO, ms).map_err(to_io)
    }

    pub fn send_timeout(&self) -> Option<u64> {
        fd_manager().get(self.fd, false)?.timeout(Event::WRITE)
    }

    /// Pending socket error (`SO_ERROR`), 0 when clear.
    pub fn take_error(&self) -> io::Result<i32> {
        origin::getsockopt_int(self.fd, libc::SOL_SOCKET, libc::SO_ERROR).map_err(to_io)
    }

    pub fn local_endpoint(&mut self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.local {
            return Ok(addr);
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        Errno::result(unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        })
        .map_err(to_io)?;
        let addr = address::from_sockaddr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))?;
        self.local = Some(addr);
        Ok(addr)
    }

    pub fn peer_endpoint(&mut self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.remote {
            return Ok(addr);
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        Errno::result(unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        })
        .map_err(to_io)?;
        let addr = address::from_sockaddr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))?;
        self.remote = Some(addr);
        Ok(addr)
    }

    /// Resume a fiber parked on this socket's read direction.
    pub fn cancel_read(&self) -> bool {
        IoManager::current().map_or(false, |io| io.cancel_event(self.fd, Event::READ))
    }

    /// Resume a fiber parked on this socket's write direction.
    pub fn cancel_write(&self) -> bool {
        IoManager::current().map_or(false, |io| io.cancel_event(self.fd, Event::WRITE))
    }

    /// Resume fibers parked on either direction.
    pub fn cancel_all(&self) -> bool {
        IoManager::current().map_or(false, |io| io.cancel_all(self.fd))
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            let _ = hook::close(self.fd);
            self.fd = -1;
        }
        self.connected = false;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Socket fd={} family={} type={} connected={}",
            self.fd, self.family, self.ty, self.connected
        )?;
        if let Some(local) = &self.local {
            write!(f, " local={}", local)?;
        }
        if let Some(remote) = &self.remote {
            write!(f, " remote={}", remote)?;
        }
        write!(f, "]")
    }
}
