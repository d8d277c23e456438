//! Readiness primitives: descriptor sets and a `select` wrapper.
//!
//! The engine never blocks. It publishes the descriptors it wants watched
//! as two [`FdSet`]s (readable sockets and TCP sockets awaiting async
//! connect completion); the host waits on them with [`select`] or any
//! equivalent mechanism and hands the ready sets back to
//! `NatEngine::handle_fd`.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// Thin copyable wrapper around `libc::fd_set`.
#[derive(Clone, Copy)]
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> Self {
        let mut raw = unsafe { mem::zeroed::<libc::fd_set>() };
        unsafe { libc::FD_ZERO(&mut raw) };
        Self { raw }
    }

    pub fn insert(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.raw) };
    }

    pub fn remove(&mut self, fd: RawFd) {
        unsafe { libc::FD_CLR(fd, &mut self.raw) };
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until a descriptor in `rd` or `wr` becomes ready, or until
/// `timeout` elapses (`None` blocks indefinitely). Returns the number of
/// ready descriptors; the sets are updated in place.
pub fn select(
    max_fd: RawFd,
    rd: &mut FdSet,
    wr: &mut FdSet,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let mut tv = timeout.map(|t| libc::timeval {
        tv_sec: t.as_secs() as libc::time_t,
        tv_usec: t.subsec_micros() as libc::suseconds_t,
    });
    let rc = unsafe {
        libc::select(
            max_fd + 1,
            rd.as_mut_ptr(),
            wr.as_mut_ptr(),
            ptr::null_mut(),
            tv.as_mut().map_or(ptr::null_mut(), |tv| tv as *mut _),
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_contains() {
        let mut set = FdSet::new();
        assert!(!set.contains(5));
        set.insert(5);
        set.insert(9);
        assert!(set.contains(5));
        assert!(set.contains(9));
        set.remove(5);
        assert!(!set.contains(5));
        assert!(set.contains(9));
    }

    #[test]
    fn copies_are_independent() {
        let mut set = FdSet::new();
        set.insert(3);
        let mut snapshot = set;
        snapshot.remove(3);
        assert!(set.contains(3));
        assert!(!snapshot.contains(3));
    }

    #[test]
    fn select_times_out_on_empty_sets() {
        let mut rd = FdSet::new();
        let mut wr = FdSet::new();
        let n = select(0, &mut rd, &mut wr, Some(Duration::from_millis(1))).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn select_reports_readable_socket() {
        use std::net::UdpSocket;
        use std::os::unix::io::AsRawFd;

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        sock.send_to(b"x", addr).unwrap();

        let fd = sock.as_raw_fd();
        let mut rd = FdSet::new();
        rd.insert(fd);
        let mut wr = FdSet::new();
        let n = select(fd, &mut rd, &mut wr, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(n, 1);
        assert!(rd.contains(fd));
    }
}
