//! Process-global descriptor metadata cache.
//!
//! The hook layer consults this registry to decide whether a descriptor
//! takes the coroutine path: only open sockets that the user has not put in
//! explicit non-blocking mode are parked on readiness. Records are created
//! on demand; creating one for a socket forces the kernel-level
//! `O_NONBLOCK` flag so the real syscalls can never block a worker thread.

use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log::trace;

use crate::io::Event;
use crate::sync::RwLock;

/// Sentinel for "no timeout configured".
const NO_TIMEOUT: u64 = u64::MAX;

/// Per-descriptor metadata record.
pub struct FdEntry {
    fd: RawFd,
    is_socket: bool,
    /// Kernel-level O_NONBLOCK, forced on sockets at record creation.
    sys_nonblock: bool,
    /// O_NONBLOCK as last requested by the user through the hooked fcntl.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdEntry {
    fn probe(fd: RawFd) -> FdEntry {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }
        trace!("fd {} tracked, socket={}", fd, is_socket);

        FdEntry {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Timeout in ms for the given direction, `None` if unlimited.
    pub fn timeout(&self, direction: Event) -> Option<u64> {
        let raw = if direction == Event::READ {
            self.recv_timeout.load(Ordering::SeqCst)
        } else {
            self.send_timeout.load(Ordering::SeqCst)
        };
        (raw != NO_TIMEOUT).then_some(raw)
    }

    pub fn set_timeout(&self, direction: Event, ms: Option<u64>) {
        let raw = ms.unwrap_or(NO_TIMEOUT);
        if direction == Event::READ {
            self.recv_timeout.store(raw, Ordering::SeqCst);
        } else {
            self.send_timeout.store(raw, Ordering::SeqCst);
        }
    }
}

/// The registry: an fd-indexed slot vector grown geometrically.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up the record for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read();
            match slots.get(fd as usize) {
                Some(Some(entry)) => return Some(Arc::clone(entry)),
                Some(None) | None if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if fd as usize >= slots.len() {
            let new_len = (fd as usize * 3 / 2).max(slots.len()) + 1;
            slots.resize(new_len, None);
        }
        let slot = &mut slots[fd as usize];
        if slot.is_none() {
            *slot = Some(Arc::new(FdEntry::probe(fd)));
        }
        slot.clone()
    }

    /// Release the record for `fd`.
    pub fn del(&self, fd: RawFd) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            slot.take();
        }
    }
}

/// The process-wide registry, initialized at first use.
pub fn fd_manager() -> &'static FdManager {
    static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();
    FD_MANAGER.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_records_force_nonblock() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let entry = fd_manager().get(fd, true).unwrap();
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        assert!(!entry.user_nonblock());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0, "kernel nonblock not forced");

        fd_manager().del(fd);
        assert!(fd_manager().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn pipe_fds_are_tracked_but_not_sockets() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let entry = fd_manager().get(fds[0], true).unwrap();
        assert!(!entry.is_socket());
        assert!(!entry.sys_nonblock());
        fd_manager().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn get_without_auto_create_misses() {
        assert!(fd_manager().get(100_000, false).is_none());
        assert!(fd_manager().get(-1, true).is_none());
    }

    #[test]
    fn timeouts_round_trip() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        let entry = fd_manager().get(fd, true).unwrap();
        assert_eq!(entry.timeout(Event::READ), None);
        entry.set_timeout(Event::READ, Some(250));
        entry.set_timeout(Event::WRITE, Some(500));
        assert_eq!(entry.timeout(Event::READ), Some(250));
        assert_eq!(entry.timeout(Event::WRITE), Some(500));
        entry.set_timeout(Event::READ, None);
        assert_eq!(entry.timeout(Event::READ), None);
        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }
}
