// src/worker.rs
use crate::config::ServerConfig;
use crate::conn::ConnState;
use crate::metrics::WorkerMetrics;
use crate::parser;
use crate::response;
use crate::route::RouteTable;
use crate::syscalls::{self, Readiness};
use crate::table::ConnectionTable;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const LISTENER_TOKEN: u64 = u64::MAX;
const PIPE_TOKEN: u64 = u64::MAX - 1;

/// One per CPU core. Owns its connection table and readiness set exclusively;
/// the only cross-worker communication is the leader-token pipe pair.
pub struct Worker {
    id: usize,
    config: Arc<ServerConfig>,
    routes: Arc<RouteTable>,
    metrics: Arc<WorkerMetrics>,
    readiness: Readiness,
    table: ConnectionTable,
    listener_fd: Option<i32>,
    token_in: i32,
    token_out: i32,
    /// Reused across iterations so the event loop never allocates in steady state.
    ready_tokens: Vec<u64>,
    sweep_scratch: Vec<usize>,
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as u32
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<ServerConfig>,
        routes: Arc<RouteTable>,
        metrics: Arc<WorkerMetrics>,
        capacity: usize,
        listener_fd: Option<i32>,
        token_in: i32,
        token_out: i32,
    ) -> crate::error::ServerResult<Self> {
        // +2 for the listener and pipe tokens alongside the client slots.
        let readiness_capacity = capacity + 2;
        let readiness = Readiness::new(readiness_capacity)?;
        readiness.add(token_in, PIPE_TOKEN)?;
        if let Some(fd) = listener_fd {
            readiness.add(fd, LISTENER_TOKEN)?;
        }
        Ok(Self {
            id,
            config,
            routes,
            metrics,
            readiness,
            table: ConnectionTable::new(capacity),
            listener_fd,
            token_in,
            token_out,
            ready_tokens: Vec::with_capacity(readiness_capacity),
            sweep_scratch: Vec::new(),
        })
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        tracing::info!(worker = self.id, "worker entering event loop");

        while !shutdown.load(Ordering::Acquire) {
            let now = now_secs();
            self.sweep_expired(now);

            if let Err(e) = self
                .readiness
                .wait(&mut self.ready_tokens, self.config.readiness_timeout_ms)
            {
                tracing::error!(worker = self.id, error = %e, "readiness wait failed fatally");
                std::process::exit(-1);
            }

            // Index instead of `for token in &self.ready_tokens` so the loop
            // body can still take `&mut self` in the handlers below.
            for i in 0..self.ready_tokens.len() {
                let token = self.ready_tokens[i];
                if token == LISTENER_TOKEN {
                    self.handle_accept(now, &shutdown);
                } else if token == PIPE_TOKEN {
                    self.handle_token_handoff();
                } else {
                    self.handle_client_ready(token as usize, now);
                }
            }
        }

        self.shutdown_cleanup();
        tracing::info!(worker = self.id, "worker exited cleanly");
    }

    /// Walks occupied slots, marking TTL-expired ones DEAD and closing them
    /// in place. This never pops from the table; a slot that goes CLEAN this
    /// way is only reclaimed by a future `push` eviction.
    fn sweep_expired(&mut self, now: u32) {
        self.table.occupied_indices_into(&mut self.sweep_scratch);
        for i in 0..self.sweep_scratch.len() {
            let idx = self.sweep_scratch[i];
            if let Some(conn) = self.table.get_mut(idx) {
                if conn.state != ConnState::Alive {
                    continue;
                }
                let fd = conn.client_fd;
                if !conn.check_alive(now, self.config.ttl_secs) {
                    let _ = self.readiness.delete(fd);
                    conn.close();
                    self.metrics.dec_conn();
                }
            }
        }
    }

    fn handle_accept(&mut self, now: u32, shutdown: &Arc<AtomicBool>) {
        let listener_fd = match self.listener_fd {
            Some(fd) => fd,
            None => return,
        };
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        match syscalls::accept_connection(listener_fd) {
            Ok(Some((client_fd, peer))) => {
                // Hand off the token before anything else so the successor
                // can start accepting as soon as possible.
                if let Err(e) = syscalls::send_token(self.token_out, listener_fd) {
                    tracing::error!(worker = self.id, error = %e, "token handoff failed fatally");
                    std::process::exit(-1);
                }
                let _ = self.readiness.delete(listener_fd);
                self.listener_fd = None;

                let (idx, evicted) = self.table.push(client_fd, peer, now);
                if evicted == ConnState::Alive {
                    // `push` evicted a still-live slot to make room; its fd
                    // closed but never went through the usual close paths, so
                    // the gauge needs the decrement here. A slot that was
                    // already Dead (or unoccupied) was already accounted for
                    // by whichever path put it in that state.
                    self.metrics.dec_conn();
                }
                if let Err(e) = self.readiness.add(client_fd, idx as u64) {
                    tracing::warn!(worker = self.id, error = %e, "failed to register client fd");
                    if let Some(conn) = self.table.get_mut(idx) {
                        conn.close();
                    }
                    return;
                }
                self.metrics.inc_conn();
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker = self.id, error = %e, "accept failed");
            }
        }
    }

    fn handle_token_handoff(&mut self) {
        match syscalls::recv_token(self.token_in) {
            Ok(Some(fd)) if fd >= 0 => {
                self.listener_fd = Some(fd);
                if let Err(e) = self.readiness.add(fd, LISTENER_TOKEN) {
                    tracing::error!(worker = self.id, error = %e, "failed to register listener fd");
                    std::process::exit(-1);
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(worker = self.id, error = %e, "token pipe read failed fatally");
                std::process::exit(-1);
            }
        }
    }

    fn handle_client_ready(&mut self, idx: usize, now: u32) {
        let mut buf = [0u8; crate::config::REQUEST_BUF_SIZE];
        let fd = match self.table.get_mut(idx) {
            Some(conn) if conn.state == ConnState::Alive => conn.client_fd,
            _ => return,
        };

        match syscalls::read_nonblocking(fd, &mut buf) {
            Ok(Some(0)) => {
                // Genuine EOF: close immediately rather than waiting for TTL.
                let _ = self.readiness.delete(fd);
                if let Some(conn) = self.table.get_mut(idx) {
                    conn.close();
                }
                self.metrics.dec_conn();
            }
            Ok(Some(n)) => {
                let request = match parser::parse_request(&buf[..n]) {
                    Ok(req) => req,
                    Err(_) => return,
                };

                let served_ok = match self.table.get_mut(idx) {
                    Some(conn) => response::serve(conn, &request, &self.routes, &self.metrics),
                    None => return,
                };
                self.metrics.inc_request();

                if served_ok {
                    if let Some(conn) = self.table.get_mut(idx) {
                        conn.revitalize(now);
                    }
                } else {
                    let _ = self.readiness.delete(fd);
                    if let Some(conn) = self.table.get_mut(idx) {
                        conn.close();
                    }
                    self.metrics.dec_conn();
                }
            }
            Ok(None) => {
                // Nothing to read right now; leave it for TTL or the next event.
            }
            Err(_) => {
                // Left to age out via TTL, per the resolved read-failure policy.
            }
        }
    }

    fn shutdown_cleanup(&mut self) {
        if let Some(fd) = self.listener_fd.take() {
            syscalls::close_fd(fd);
        }
        self.table.occupied_indices_into(&mut self.sweep_scratch);
        for i in 0..self.sweep_scratch.len() {
            let idx = self.sweep_scratch[i];
            if let Some(conn) = self.table.get_mut(idx) {
                conn.close();
            }
        }
    }
}
