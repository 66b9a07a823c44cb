//! Coroutine-aware renditions of the blocking syscalls.
//!
//! Each function here mirrors a kernel entry point (`socket`, `connect`,
//! `accept`, `send`, `recv`, `close`, `fcntl`, `sleep`, ...) and either
//! delegates straight to the untouched original or takes the coroutine
//! path: register interest with the current I/O manager, park the calling
//! fiber, and retry once readiness (or a timeout, or a cancellation)
//! resumes it.
//!
//! The coroutine path is taken only when all of these hold: the per-thread
//! [`hook_enabled`] switch is on, the descriptor is tracked by the fd
//! registry, it is a socket, and the user has not asked for explicit
//! non-blocking mode. Everything else falls through to [`origin`], the
//! module-private table of real entry points (the dynamic-lookup "original
//! function" binding, rendered as direct libc calls).
//!
//! Timeouts are conditional timers: the timer callback flips a shared
//! cancel flag to `ETIMEDOUT` and cancels the fd's event, which resumes the
//! parked fiber; the post-resume check turns the flag into the errno the
//! caller sees. A wait that races its timeout resolves to exactly one
//! visible outcome through that flag.

use std::cell::Cell;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use libc::c_int;
use log::{trace, warn};
use nix::errno::Errno;

use crate::address;
use crate::fd_manager::fd_manager;
use crate::fiber::Fiber;
use crate::io::{Event, IoManager};
use crate::scheduler::Scheduler;

/// Default timeout applied when `connect` is called without an explicit one.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread takes the coroutine path in hooked calls.
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|h| h.set(on));
}

/// The untouched entry points.
pub(crate) mod origin {
    use super::*;

    pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> nix::Result<RawFd> {
        Errno::result(unsafe { libc::socket(domain, ty, protocol) })
    }

    pub fn connect(fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> nix::Result<()> {
        Errno::result(unsafe { libc::connect(fd, addr, len) }).map(drop)
    }

    pub fn accept(fd: RawFd) -> nix::Result<RawFd> {
        Errno::result(unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) })
    }

    pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> nix::Result<usize> {
        Errno::result(unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
        })
        .map(|n| n as usize)
    }

    pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> nix::Result<usize> {
        Errno::result(unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
        })
        .map(|n| n as usize)
    }

    pub fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> nix::Result<usize> {
        Errno::result(unsafe { libc::recvmsg(fd, msg, flags) }).map(|n| n as usize)
    }

    pub fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: c_int) -> nix::Result<usize> {
        Errno::result(unsafe { libc::sendmsg(fd, msg, flags) }).map(|n| n as usize)
    }

    pub fn close(fd: RawFd) -> nix::Result<()> {
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }

    pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> nix::Result<c_int> {
        Errno::result(unsafe { libc::fcntl(fd, cmd, arg) })
    }

    pub fn getsockopt_int(fd: RawFd, level: c_int, opt: c_int) -> nix::Result<c_int> {
        let mut value: c_int = 0;
        let mut len = std::mem::size_of::<c_int>() as libc::socklen_t;
        Errno::result(unsafe {
            libc::getsockopt(
                fd,
                level,
                opt,
                &mut value as *mut c_int as *mut libc::c_void,
                &mut len,
            )
        })?;
        Ok(value)
    }

    pub fn setsockopt(
        fd: RawFd,
        level: c_int,
        opt: c_int,
        value: *const libc::c_void,
        len: libc::socklen_t,
    ) -> nix::Result<()> {
        Errno::result(unsafe { libc::setsockopt(fd, level, opt, value, len) }).map(drop)
    }

    pub fn bind(fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> nix::Result<()> {
        Errno::result(unsafe { libc::bind(fd, addr, len) }).map(drop)
    }

    pub fn listen(fd: RawFd, backlog: c_int) -> nix::Result<()> {
        Errno::result(unsafe { libc::listen(fd, backlog) }).map(drop)
    }
}

/// Cancel flag shared between a parked waiter and its timeout timer.
struct CancelState {
    cancelled: AtomicI32,
}

/// The hooked-I/O template shared by accept/recv/send and friends.
///
/// `op` performs the real (non-blocking) syscall; on `EAGAIN` the calling
/// fiber parks on `direction` readiness, optionally bounded by the fd's
/// configured timeout.
pub(crate) fn do_io<F>(fd: RawFd, direction: Event, mut op: F) -> nix::Result<usize>
where
    F: FnMut() -> nix::Result<usize>,
{
    if !hook_enabled() {
        return op();
    }
    let Some(entry) = fd_manager().get(fd, false) else {
        return op();
    };
    if entry.is_closed() {
        return Err(Errno::EBADF);
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return op();
    }

    let timeout = entry.timeout(direction);
    loop {
        let mut result = op();
        while result == Err(Errno::EINTR) {
            result = op();
        }
        match result {
            Err(Errno::EAGAIN) => {}
            other => return other,
        }

        let io = match IoManager::current() {
            // Only a resumable fiber can park; elsewhere surface the
            // would-block as-is.
            Some(io) if crate::fiber::in_fiber() => io,
            _ => return Err(Errno::EAGAIN),
        };

        let state = Arc::new(CancelState {
            cancelled: AtomicI32::new(0),
        });
        let timer = timeout.map(|ms| {
            let weak = Arc::downgrade(&state);
            let cond = Arc::downgrade(&state);
            io.add_condition_timer(
                ms,
                move || {
                    let Some(state) = weak.upgrade() else { return };
                    if state.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    state.cancelled.store(Errno::ETIMEDOUT as i32, Ordering::SeqCst);
                    if let Some(io) = IoManager::current() {
                        io.cancel_event(fd, direction);
                    }
                },
                cond,
                false,
            )
        });

        if let Err(err) = io.add_event(fd, direction, None) {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            warn!("do_io: add_event failed for fd {}: {}", fd, err);
            return Err(Errno::from_raw(err.raw_os_error().unwrap_or(libc::EINVAL)));
        }

        trace!("fd {}: parked on {:?}", fd, direction);
        Fiber::yield_hold();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = state.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            return Err(Errno::from_raw(cancelled));
        }
        // Readiness (or a cancellation): retry the real call.
    }
}

/// Park the calling fiber for `seconds`. Outside the runtime this is a
/// plain blocking sleep.
pub fn sleep(seconds: u32) {
    sleep_ms(seconds as u64 * 1000);
}

/// Millisecond-granularity [`sleep`].
pub fn sleep_ms(ms: u64) {
    let (io, fiber) = match (IoManager::current(), Fiber::current()) {
        (Some(io), Some(fiber)) if crate::fiber::in_fiber() => (io, fiber),
        _ => return std::thread::sleep(std::time::Duration::from_millis(ms)),
    };
    let scheduler = Scheduler::current().unwrap_or_else(|| Arc::clone(io.scheduler()));
    io.add_timer(
        ms,
        move || {
            scheduler.schedule(Arc::clone(&fiber));
        },
        false,
    );
    Fiber::yield_hold();
}

/// Create a socket; when hooked, the descriptor is registered with the fd
/// cache (which forces kernel-level non-blocking mode).
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> nix::Result<RawFd> {
    let fd = origin::socket(domain, ty, protocol)?;
    if hook_enabled() {
        fd_manager().get(fd, true);
    }
    Ok(fd)
}

/// Connect with the crate default timeout.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> nix::Result<()> {
    connect_with_timeout(fd, addr, Some(DEFAULT_CONNECT_TIMEOUT_MS))
}

/// Connect, parking the calling fiber until the handshake resolves or
/// `timeout_ms` elapses (`None` waits indefinitely).
pub fn connect_with_timeout(
    fd: RawFd,
    addr: &SocketAddr,
    timeout_ms: Option<u64>,
) -> nix::Result<()> {
    let (storage, len) = address::to_sockaddr(addr);
    let addr_ptr = &storage as *const libc::sockaddr_storage as *const libc::sockaddr;

    if !hook_enabled() {
        return origin::connect(fd, addr_ptr, len);
    }
    let Some(entry) = fd_manager().get(fd, false) else {
        return Err(Errno::EBADF);
    };
    if entry.is_closed() {
        return Err(Errno::EBADF);
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return origin::connect(fd, addr_ptr, len);
    }

    match origin::connect(fd, addr_ptr, len) {
        Ok(()) => return Ok(()),
        Err(Errno::EINPROGRESS) => {}
        Err(err) => return Err(err),
    }

    let io = match IoManager::current() {
        Some(io) if crate::fiber::in_fiber() => io,
        _ => return Err(Errno::EINPROGRESS),
    };
    let state = Arc::new(CancelState {
        cancelled: AtomicI32::new(0),
    });
    let timer = timeout_ms.map(|ms| {
        let weak = Arc::downgrade(&state);
        let cond = Arc::downgrade(&state);
        io.add_condition_timer(
            ms,
            move || {
                let Some(state) = weak.upgrade() else { return };
                if state.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                state.cancelled.store(Errno::ETIMEDOUT as i32, Ordering::SeqCst);
                if let Some(io) = IoManager::current() {
                    io.cancel_event(fd, Event::WRITE);
                }
            },
            cond,
            false,
        )
    });

    match io.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            Fiber::yield_hold();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = state.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                return Err(Errno::from_raw(cancelled));
            }
        }
        Err(_) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
        }
    }

    // The handshake outcome lives in SO_ERROR.
    let err = origin::getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if err == 0 {
        Ok(())
    } else {
        Err(Errno::from_raw(err))
    }
}

/// Accept a connection, parking until one arrives. The accepted descriptor
/// is registered with the fd cache.
pub fn accept(fd: RawFd) -> nix::Result<RawFd> {
    let new_fd = do_io(fd, Event::READ, || origin::accept(fd).map(|f| f as usize))? as RawFd;
    fd_manager().get(new_fd, true);
    Ok(new_fd)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> nix::Result<usize> {
    do_io(fd, Event::READ, || origin::recv(fd, buf, flags))
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> nix::Result<usize> {
    do_io(fd, Event::WRITE, || origin::send(fd, buf, flags))
}

/// Scatter-gather receive through `recvmsg`.
pub fn recv_vectored(fd: RawFd, bufs: &mut [std::io::IoSliceMut<'_>], flags: c_int) -> nix::Result<usize> {
    do_io(fd, Event::READ, || {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        // IoSliceMut is ABI-compatible with iovec.
        msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len();
        origin::recvmsg(fd, &mut msg, flags)
    })
}

/// Scatter-gather send through `sendmsg`.
pub fn send_vectored(fd: RawFd, bufs: &[std::io::IoSlice<'_>], flags: c_int) -> nix::Result<usize> {
    do_io(fd, Event::WRITE, || {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len();
        origin::sendmsg(fd, &msg, flags)
    })
}

/// Datagram send to an explicit destination.
pub fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr, flags: c_int) -> nix::Result<usize> {
    let (storage, len) = address::to_sockaddr(addr);
    do_io(fd, Event::WRITE, || {
        Errno::result(unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        })
        .map(|n| n as usize)
    })
}

/// Datagram receive reporting the sender.
pub fn recv_from(fd: RawFd, buf: &mut [u8], flags: c_int) -> nix::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = do_io(fd, Event::READ, || {
        addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        Errno::result(unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addr_len,
            )
        })
        .map(|n| n as usize)
    })?;
    Ok((n, address::from_sockaddr(&storage)))
}

/// Close, tearing down any pending events and the fd-cache record first.
pub fn close(fd: RawFd) -> nix::Result<()> {
    if hook_enabled() {
        if let Some(entry) = fd_manager().get(fd, false) {
            entry.set_closed();
            if let Some(io) = IoManager::current() {
                io.cancel_all(fd);
            }
            fd_manager().del(fd);
        }
    }
    origin::close(fd)
}

/// `fcntl(F_SETFL)`: remember the user's O_NONBLOCK wish, but keep the
/// kernel-level flag that the runtime depends on.
pub fn fcntl_setfl(fd: RawFd, mut flags: c_int) -> nix::Result<c_int> {
    match fd_manager().get(fd, false) {
        Some(entry) if entry.is_socket() && !entry.is_closed() => {
            entry.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if entry.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            origin::fcntl(fd, libc::F_SETFL, flags)
        }
        _ => origin::fcntl(fd, libc::F_SETFL, flags),
    }
}

/// `fcntl(F_GETFL)`: report the O_NONBLOCK state the user configured, not
/// the one the runtime forced.
pub fn fcntl_getfl(fd: RawFd) -> nix::Result<c_int> {
    let flags = origin::fcntl(fd, libc::F_GETFL, 0)?;
    match fd_manager().get(fd, false) {
        Some(entry) if entry.is_socket() && !entry.is_closed() => {
            if entry.user_nonblock() {
                Ok(flags | libc::O_NONBLOCK)
            } else {
                Ok(flags & !libc::O_NONBLOCK)
            }
        }
        _ => Ok(flags),
    }
}

/// `setsockopt`: SO_RCVTIMEO/SO_SNDTIMEO are recorded in the fd cache so
/// the coroutine path honors them; everything is forwarded to the kernel.
pub fn set_socket_timeout(fd: RawFd, opt: c_int, ms: Option<u64>) -> nix::Result<()> {
    debug_assert!(opt == libc::SO_RCVTIMEO || opt == libc::SO_SNDTIMEO);
    if let Some(entry) = fd_manager().get(fd, false) {
        let direction = if opt == libc::SO_RCVTIMEO {
            Event::READ
        } else {
            Event::WRITE
        };
        entry.set_timeout(direction, ms);
    }
    let ms_value = ms.unwrap_or(0);
    let tv = libc::timeval {
        tv_sec: (ms_value / 1000) as libc::time_t,
        tv_usec: ((ms_value % 1000) * 1000) as libc::suseconds_t,
    };
    origin::setsockopt(
        fd,
        libc::SOL_SOCKET,
        opt,
        &tv as *const libc::timeval as *const libc::c_void,
        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_flag_is_per_thread() {
        set_hook_enabled(true);
        assert!(hook_enabled());
        let other = std::thread::spawn(hook_enabled).join().unwrap();
        assert!(!other, "hook flag leaked across threads");
        set_hook_enabled(false);
        assert!(!hook_enabled());
    }

    #[test]
    fn sleep_ms_outside_the_runtime_blocks() {
        let start = std::time::Instant::now();
        sleep_ms(30);
        assert!(start.elapsed() >= std::time::Duration::from_millis(25));
    }

    #[test]
    fn fcntl_getfl_masks_the_forced_nonblock() {
        set_hook_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        // The runtime forced O_NONBLOCK, but the user never asked for it.
        let flags = fcntl_getfl(fd).unwrap();
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        fcntl_setfl(fd, flags | libc::O_NONBLOCK).unwrap();
        assert!(fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK != 0);
        close(fd).unwrap();
        set_hook_enabled(false);
    }

    #[test]
    fn socket_timeouts_land_in_the_fd_cache() {
        set_hook_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        set_socket_timeout(fd, libc::SO_RCVTIMEO, Some(150)).unwrap();
        let entry = fd_manager().get(fd, false).unwrap();
        assert_eq!(entry.timeout(Event::READ), Some(150));
        assert_eq!(entry.timeout(Event::WRITE), None);
        close(fd).unwrap();
        set_hook_enabled(false);
    }
}
