// src/syscalls.rs
use crate::error::{ServerError, ServerResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::ptr;

// ---- socket / fd primitives ----

/// Enable TCP keepalive.
pub fn set_keepalive(fd: c_int) -> ServerResult<()> {
    let optval: c_int = 1;
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const c_void,
            mem::size_of_val(&optval) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Toggle O_NONBLOCK on.
pub fn set_nonblocking(fd: c_int) -> ServerResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Toggle O_NONBLOCK off. The responder uses this around its body-streaming
/// write loop: with the fd briefly blocking, a short write only happens on a
/// genuine error, never on EWOULDBLOCK, so "sent <= 0" unambiguously means dead.
pub fn set_blocking(fd: c_int) -> ServerResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Query file size via fstat.
pub fn file_size(fd: c_int) -> ServerResult<i64> {
    unsafe {
        let mut st: libc::stat = mem::zeroed();
        if libc::fstat(fd, &mut st) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(st.st_size as i64)
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- listener setup ----

/// Create the single non-blocking IPv4 listening socket shared by the whole
/// pool. There is exactly one of these per process; workers hand its fd
/// around the leader-token ring rather than each binding their own.
pub fn create_listen_socket(host: &str, port: u16, backlog: c_int) -> ServerResult<c_int> {
    let ip: std::net::Ipv4Addr = if host.is_empty() || host == "0.0.0.0" {
        std::net::Ipv4Addr::UNSPECIFIED
    } else {
        host.parse()
            .map_err(|_| ServerError::Other(format!("invalid bind host: {host}")))?
    };

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if let Err(e) = set_keepalive(fd) {
            libc::close(fd);
            return Err(e);
        }
        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e);
        }

        let reuse: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const c_void,
            mem::size_of_val(&reuse) as socklen_t,
        );

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(ip.octets()),
            },
            sin_zero: [0; 8],
            #[cfg(target_os = "macos")]
            sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
        };

        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept a single pending connection, non-blocking. `Ok(None)` means no
/// connection was waiting.
pub fn accept_connection(listen_fd: c_int) -> ServerResult<Option<(c_int, std::net::Ipv4Addr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;

        let fd = libc::accept(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err.into()),
            };
        }

        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e);
        }
        let _ = set_keepalive(fd);

        let octets = addr.sin_addr.s_addr.to_ne_bytes();
        let peer = std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        Ok(Some((fd, peer)))
    }
}

/// Query the port a listening socket is actually bound to — useful when it
/// was bound to port 0 and the OS assigned an ephemeral one.
pub fn local_port(fd: c_int) -> ServerResult<u16> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(addr.sin_port))
    }
}

// ---- readiness: epoll on Linux, kqueue elsewhere ----

#[cfg(target_os = "linux")]
pub use linux_readiness::Readiness;

#[cfg(target_os = "linux")]
mod linux_readiness {
    use super::*;
    use libc::epoll_event;
    use std::cell::RefCell;

    pub struct Readiness {
        fd: c_int,
        /// Scratch kernel-facing buffer, sized once at construction and
        /// reused by every `wait` call so the hot path never allocates.
        events: RefCell<Vec<epoll_event>>,
    }

    impl Readiness {
        /// `capacity` bounds how many events a single `wait` can report;
        /// pass the worker's connection-table capacity plus its fixed tokens.
        pub fn new(capacity: usize) -> ServerResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                let events = vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)];
                Ok(Self {
                    fd,
                    events: RefCell::new(events),
                })
            }
        }

        /// Register `fd` for edge-triggered readability under `token`.
        pub fn add(&self, fd: c_int, token: u64) -> ServerResult<()> {
            let mut event = epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLET) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> ServerResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        /// Fills `out` with the tokens that became ready this call (clearing
        /// it first), or leaves it empty on timeout. Reuses the internal
        /// event buffer across calls instead of allocating one per wait.
        pub fn wait(&self, out: &mut Vec<u64>, timeout_ms: i32) -> ServerResult<()> {
            out.clear();
            let mut events = self.events.borrow_mut();
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(());
                    }
                    return Err(err.into());
                }
                out.extend(events[..res as usize].iter().map(|e| e.u64));
            }
            Ok(())
        }
    }

    impl Drop for Readiness {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use kqueue_readiness::Readiness;

#[cfg(not(target_os = "linux"))]
mod kqueue_readiness {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, kevent, kqueue, timespec};
    use std::cell::RefCell;

    /// Mirrors the Linux `Readiness` API surface over kqueue so the worker
    /// loop doesn't need a cfg split of its own.
    pub struct Readiness {
        fd: c_int,
        /// Scratch kernel-facing buffer, sized once at construction and
        /// reused by every `wait` call so the hot path never allocates.
        events: RefCell<Vec<kevent>>,
    }

    impl Readiness {
        /// `capacity` bounds how many events a single `wait` can report;
        /// pass the worker's connection-table capacity plus its fixed tokens.
        pub fn new(capacity: usize) -> ServerResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                let events: Vec<kevent> = vec![mem::zeroed(); capacity.max(1)];
                Ok(Self {
                    fd,
                    events: RefCell::new(events),
                })
            }
        }

        pub fn add(&self, fd: c_int, token: u64) -> ServerResult<()> {
            self.change(fd, token, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: c_int) -> ServerResult<()> {
            self.change(fd, 0, EV_DELETE)
        }

        fn change(&self, fd: c_int, token: u64, flags: u16) -> ServerResult<()> {
            let change = kevent {
                ident: fd as usize,
                filter: EVFILT_READ,
                flags,
                fflags: 0,
                data: 0,
                udata: token as *mut c_void,
            };
            unsafe {
                let res = libc::kevent(self.fd, &change, 1, ptr::null_mut(), 0, ptr::null());
                if res < 0 && flags != EV_DELETE {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        /// Fills `out` with the tokens that became ready this call (clearing
        /// it first), or leaves it empty on timeout. Reuses the internal
        /// event buffer across calls instead of allocating one per wait.
        pub fn wait(&self, out: &mut Vec<u64>, timeout_ms: i32) -> ServerResult<()> {
            out.clear();
            let mut kevents = self.events.borrow_mut();
            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    kevents.len() as c_int,
                    &ts,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(());
                    }
                    return Err(err.into());
                }
                out.extend(kevents[..res as usize].iter().map(|e| e.udata as u64));
            }
            Ok(())
        }
    }

    impl Drop for Readiness {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- non-blocking read/write ----

/// Reads once from a non-blocking fd. `Ok(None)` means EWOULDBLOCK (try
/// later); `Ok(Some(0))` is a genuine EOF; `Ok(Some(n))` is `n` bytes of data.
/// Collapsing EOF and WouldBlock into the same return value would make a
/// closed peer indistinguishable from a quiet one.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> ServerResult<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Write a single syscall's worth of bytes. Returns `Ok(0)` on EWOULDBLOCK;
/// callers streaming to a nonblocking fd must treat that as "stop, don't retry".
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> ServerResult<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(0)
            } else {
                Err(err.into())
            }
        } else {
            Ok(res as usize)
        }
    }
}

// ---- leader-token pipe ring ----

/// Create a pipe whose read end is non-blocking. Returns (read_fd, write_fd).
pub fn create_pipe() -> ServerResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    if let Err(e) = set_nonblocking(fds[0]) {
        close_fd(fds[0]);
        close_fd(fds[1]);
        return Err(e);
    }
    Ok((fds[0], fds[1]))
}

/// Hand the listener fd to the successor. The pipe never holds more than one
/// token in flight, so this blocking 4-byte write never actually blocks.
pub fn send_token(pipe_write_fd: c_int, listener_fd: c_int) -> ServerResult<()> {
    let bytes = listener_fd.to_ne_bytes();
    unsafe {
        let n = libc::write(pipe_write_fd, bytes.as_ptr() as *const c_void, 4);
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Non-blocking read of one token. `Ok(None)` means nothing has arrived yet.
pub fn recv_token(pipe_read_fd: c_int) -> ServerResult<Option<c_int>> {
    let mut buf = [0u8; 4];
    unsafe {
        let n = libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, 4);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else if n == 4 {
            Ok(Some(c_int::from_ne_bytes(buf)))
        } else {
            Ok(None)
        }
    }
}

// ---- rlimit ----

/// Raise RLIMIT_NOFILE to its hard limit and return the resulting soft limit.
pub fn raise_and_query_fd_limit() -> ServerResult<u64> {
    unsafe {
        let mut lim: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        lim.rlim_cur = lim.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &lim) < 0 {
            if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(lim.rlim_cur as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_socket_binds_ephemeral_port() {
        let fd = create_listen_socket("127.0.0.1", 0, 16).expect("bind should succeed");
        assert!(fd >= 0);
        close_fd(fd);
    }

    #[test]
    fn pipe_token_round_trip() {
        let (read_fd, write_fd) = create_pipe().expect("pipe creation should succeed");
        assert_eq!(recv_token(read_fd).unwrap(), None);
        send_token(write_fd, 42).unwrap();
        assert_eq!(recv_token(read_fd).unwrap(), Some(42));
        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[test]
    fn readiness_wait_times_out_with_no_events() {
        let readiness = Readiness::new(16).expect("readiness creation should succeed");
        let mut tokens = Vec::new();
        readiness.wait(&mut tokens, 10).expect("wait should not error");
        assert!(tokens.is_empty());
    }
}
