use ringhttpd::bootstrap;
use ringhttpd::config::ServerConfig;
use ringhttpd::route::RouteTable;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/html")
}

struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(worker_count: usize, ttl_secs: u32) -> Self {
        let root = fixtures_root();
        let mut routes = RouteTable::new();
        routes.add("/", root.join("index.html"));
        routes.add("/common.css", root.join("common.css"));
        routes.add("/a.js", root.join("a.js"));

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            worker_count,
            ttl_secs,
            readiness_timeout_ms: 200,
            listen_backlog: 16,
            html_root: root,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let (port_tx, port_rx) = mpsc::channel();
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("test-server".to_string())
            .spawn(move || {
                bootstrap::run_with_shutdown_reporting_port(
                    config,
                    routes,
                    thread_shutdown,
                    Some(port_tx),
                )
                .expect("server should start cleanly");
            })
            .expect("failed to spawn test server thread");

        let port = port_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("server never reported its bound port");

        TestServer {
            port,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).expect("should connect to test server")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn send_and_read(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                // A fixed-size static file response: once we've read some
                // headers and body, further reads would just block waiting
                // on keep-alive, so stop once the first response is in hand.
                if buf.windows(4).any(|w| w == b"\r\n\r\n") && n < chunk.len() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[test]
fn happy_path_serves_index() {
    let server = TestServer::start(2, 60);
    let mut stream = server.connect();
    let response = send_and_read(&mut stream, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Type: text/html; charset=utf8\r\n"));
    assert!(response.contains("it works"));
}

#[test]
fn unknown_route_yields_404() {
    let server = TestServer::start(2, 60);
    let mut stream = server.connect();
    let response = send_and_read(&mut stream, "GET /missing HTTP/1.1\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    assert!(response.ends_with("404\r\n"));
}

#[test]
fn unsupported_method_yields_501() {
    let server = TestServer::start(2, 60);
    let mut stream = server.connect();
    let response = send_and_read(&mut stream, "POST / HTTP/1.1\r\n\r\n");

    assert!(
        response.starts_with("HTTP/1.1 501 Method Not Implemented\r\n"),
        "{response}"
    );
    assert!(response.ends_with("Not implemented.\r\n"));
}

#[test]
fn mime_type_follows_extension() {
    let server = TestServer::start(2, 60);
    let mut stream = server.connect();
    let response = send_and_read(&mut stream, "GET /a.js HTTP/1.1\r\n\r\n");

    assert!(response.contains("Content-Type: application/javascript\r\n"), "{response}");
}

#[test]
fn keep_alive_connection_is_closed_after_ttl() {
    let server = TestServer::start(1, 1);
    let mut stream = server.connect();
    let first = send_and_read(&mut stream, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

    thread::sleep(Duration::from_millis(1500));

    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "expected EOF from a TTL-expired connection");
}

#[test]
fn accept_fairness_serves_concurrent_clients_on_a_small_pool() {
    let server = TestServer::start(2, 60);
    let mut a = server.connect();
    let mut b = server.connect();

    let resp_a = send_and_read(&mut a, "GET / HTTP/1.1\r\n\r\n");
    let resp_b = send_and_read(&mut b, "GET /common.css HTTP/1.1\r\n\r\n");

    assert!(resp_a.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp_b.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp_b.contains("Content-Type: text/css\r\n"));
}
