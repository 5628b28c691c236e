// src/conn.rs
use crate::syscalls;

/// Matches INET_ADDRSTRLEN; enough for "255.255.255.255\0".
pub const ADDR_BUF_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Slot unused, owns nothing.
    Clean,
    /// Owns `client_fd`, eligible for I/O.
    Alive,
    /// Marked for close; still owns `client_fd` until the next sweep.
    Dead,
    /// Sentinel returned when popping an empty table. Must never appear in a slot.
    None,
}

/// One keep-alive client connection, owned exclusively by its worker.
pub struct Conn {
    pub client_fd: i32,
    pub state: ConnState,
    pub last_alive: u32,
    addr_buf: [u8; ADDR_BUF_SIZE],
    addr_len: u8,
}

impl Conn {
    pub fn empty() -> Self {
        Self {
            client_fd: -1,
            state: ConnState::Clean,
            last_alive: 0,
            addr_buf: [0; ADDR_BUF_SIZE],
            addr_len: 0,
        }
    }

    /// Initializes a previously-CLEAN slot with a freshly accepted fd.
    pub fn open(&mut self, fd: i32, addr: std::net::Ipv4Addr, now: u32) {
        let rendered = addr.to_string();
        let bytes = rendered.as_bytes();
        let n = bytes.len().min(ADDR_BUF_SIZE);
        self.addr_buf[..n].copy_from_slice(&bytes[..n]);
        self.addr_len = n as u8;

        self.client_fd = fd;
        self.state = ConnState::Alive;
        self.last_alive = now;
    }

    pub fn peer_addr(&self) -> &str {
        std::str::from_utf8(&self.addr_buf[..self.addr_len as usize]).unwrap_or("")
    }

    /// Records a successful recv or send.
    pub fn revitalize(&mut self, now: u32) {
        self.last_alive = now;
    }

    /// Returns whether the connection is still usable this iteration,
    /// transitioning ALIVE -> DEAD in place when the TTL has elapsed.
    pub fn check_alive(&mut self, now: u32, ttl: u32) -> bool {
        match self.state {
            ConnState::Dead | ConnState::Clean => false,
            _ => {
                if now.wrapping_sub(self.last_alive) >= ttl {
                    self.state = ConnState::Dead;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Idempotent: closes the fd and returns to CLEAN, returning the prior state.
    pub fn close(&mut self) -> ConnState {
        let prior = self.state;
        if prior != ConnState::Clean {
            syscalls::close_fd(self.client_fd);
            self.client_fd = -1;
            self.state = ConnState::Clean;
        }
        prior
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_marks_alive_and_stamps_time() {
        let mut conn = Conn::empty();
        conn.open(3, std::net::Ipv4Addr::new(127, 0, 0, 1), 100);
        assert_eq!(conn.state, ConnState::Alive);
        assert_eq!(conn.last_alive, 100);
        assert_eq!(conn.peer_addr(), "127.0.0.1");
    }

    #[test]
    fn check_alive_transitions_to_dead_past_ttl() {
        let mut conn = Conn::empty();
        conn.open(3, std::net::Ipv4Addr::new(10, 0, 0, 1), 0);
        assert!(conn.check_alive(10, 60));
        assert_eq!(conn.state, ConnState::Alive);
        assert!(!conn.check_alive(60, 60));
        assert_eq!(conn.state, ConnState::Dead);
    }

    #[test]
    fn check_alive_false_once_clean_or_dead() {
        let mut conn = Conn::empty();
        assert!(!conn.check_alive(0, 60));
        conn.open(3, std::net::Ipv4Addr::new(10, 0, 0, 1), 0);
        conn.state = ConnState::Dead;
        assert!(!conn.check_alive(5, 60));
    }

    #[test]
    fn close_is_idempotent_and_reports_prior_state() {
        let mut conn = Conn::empty();
        conn.client_fd = -1;
        // Closing an already-CLEAN slot is a no-op and reports CLEAN.
        assert_eq!(conn.close(), ConnState::Clean);

        // Using a real fd (stdin duplicate) so close() has something valid to act on.
        let fd = unsafe { libc::dup(0) };
        conn.open(fd, std::net::Ipv4Addr::new(0, 0, 0, 0), 0);
        assert_eq!(conn.close(), ConnState::Alive);
        assert_eq!(conn.state, ConnState::Clean);
        // Second close is a no-op, doesn't double-close the fd.
        assert_eq!(conn.close(), ConnState::Clean);
    }
}
