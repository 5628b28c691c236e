// src/response.rs
use crate::conn::Conn;
use crate::metrics::WorkerMetrics;
use crate::parser::{Method, Request};
use crate::route::RouteTable;
use crate::syscalls;
use std::fs::File;
use std::io::Read as _;
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub const SERVER_TOKEN: &str = "Server: ringhttpd/0.1.0\r\n";
pub const NOT_IMPLEMENTED_BODY: &[u8] = b"Not implemented.\r\n";
pub const NOT_FOUND_BODY: &[u8] = b"404\r\n";

/// Determines Content-Type purely from the mapped filename's final extension.
fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        _ => "text",
    }
}

/// Writes a fixed status line + body. Returns whether the send succeeded and
/// the number of bytes actually placed on the wire (header-only if the body
/// write failed), so the caller can still account for partial sends.
fn send_fixed(fd: i32, status_line: &str, content_type: &str, body: &[u8]) -> (bool, u64) {
    let header = format!(
        "{status_line}{SERVER_TOKEN}Content-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    if write_all(fd, header.as_bytes()).is_err() {
        return (false, 0);
    }
    let header_len = header.len() as u64;
    if write_all(fd, body).is_err() {
        return (false, header_len);
    }
    (true, header_len + body.len() as u64)
}

/// Writes `buf` in full, using one syscall-level blocking write. Returns an
/// error on the first non-positive result, matching the upstream responder's
/// "sent <= 0 => dead" rule.
fn write_all(fd: i32, mut buf: &[u8]) -> Result<(), ()> {
    while !buf.is_empty() {
        match syscalls::write_nonblocking(fd, buf) {
            Ok(0) => return Err(()),
            Ok(n) => buf = &buf[n..],
            Err(_) => return Err(()),
        }
    }
    Ok(())
}

/// Serves one request on an already-ALIVE connection. Returns `true` if the
/// connection should remain alive, `false` if it must be marked DEAD. Every
/// byte actually placed on the wire (headers and body, including a partial
/// send before a failure) is reported to `metrics`.
///
/// Writes happen with the client fd briefly toggled blocking: a short write
/// can then only mean a genuine error, never EWOULDBLOCK, so a non-positive
/// result always means the connection is dead.
pub fn serve(conn: &mut Conn, request: &Request, routes: &RouteTable, metrics: &WorkerMetrics) -> bool {
    let fd = conn.client_fd;

    if syscalls::set_blocking(fd).is_err() {
        return false;
    }
    let (ok, bytes) = serve_inner(fd, request, routes);
    metrics.add_bytes(bytes);
    let _ = syscalls::set_nonblocking(fd);
    ok
}

fn serve_inner(fd: i32, request: &Request, routes: &RouteTable) -> (bool, u64) {
    if request.method != Method::Get {
        return send_fixed(
            fd,
            "HTTP/1.1 501 Method Not Implemented\r\n",
            "text",
            NOT_IMPLEMENTED_BODY,
        );
    }

    let fs_path = match routes.lookup(&request.resource) {
        Some(p) => p,
        None => {
            return send_fixed(fd, "HTTP/1.1 404 Not Found\r\n", "text/html", NOT_FOUND_BODY);
        }
    };

    let mut file = match File::open(fs_path) {
        Ok(f) => f,
        Err(_) => {
            return send_fixed(fd, "HTTP/1.1 404 Not Found\r\n", "text/html", NOT_FOUND_BODY);
        }
    };

    let size = match syscalls::file_size(file.as_raw_fd()) {
        Ok(n) => n,
        Err(_) => {
            return send_fixed(fd, "HTTP/1.1 404 Not Found\r\n", "text/html", NOT_FOUND_BODY);
        }
    };

    let content_type = content_type_for(fs_path);
    let header = format!(
        "HTTP/1.1 200 OK\r\n{SERVER_TOKEN}Content-Type: {content_type}\r\nContent-Length: {size}\r\nConnection: keep-alive\r\n\r\n"
    );
    if write_all(fd, header.as_bytes()).is_err() {
        return (false, 0);
    }
    let mut written = header.len() as u64;

    let mut buf = [0u8; crate::config::REQUEST_BUF_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if write_all(fd, &buf[..n]).is_err() {
            return (false, written);
        }
        written += n as u64;
    }

    (true, written)
}
