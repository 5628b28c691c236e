// src/config.rs

/// Per-connection keep-alive time-to-live.
pub const TTL_SECS: u32 = 60;
/// Readiness-wait timeout driving the TTL sweep in the absence of traffic.
pub const READINESS_TIMEOUT_MS: i32 = 5_000;
/// Largest single `recv`/file-chunk buffer. A request line longer than this
/// is silently truncated, matching the upstream design.
pub const REQUEST_BUF_SIZE: usize = 4096;
/// Listen backlog passed to `listen(2)`.
pub const LISTEN_BACKLOG: i32 = 16;
/// Metrics reporter wake interval.
pub const METRICS_INTERVAL_SECS: u64 = 5;
/// Default bind port when none is given on the CLI.
pub const DEFAULT_PORT: u16 = 80;

/// Immutable, resolved once at startup and shared by reference into every
/// worker. The only field ever overridden from the CLI is `port`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub worker_count: usize,
    pub ttl_secs: u32,
    pub readiness_timeout_ms: i32,
    pub listen_backlog: i32,
    pub html_root: std::path::PathBuf,
}

impl ServerConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let port = match args.get(1) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| format!("invalid port argument: {raw}"))
                .and_then(|p| {
                    if (p as u32) <= 65534 {
                        Ok(p)
                    } else {
                        Err(format!("port out of range [0, 65534]: {p}"))
                    }
                })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: "0.0.0.0".to_string(),
            port,
            worker_count: num_cpus::get_physical().max(1),
            ttl_secs: TTL_SECS,
            readiness_timeout_ms: READINESS_TIMEOUT_MS,
            listen_backlog: LISTEN_BACKLOG,
            html_root: std::path::PathBuf::from("html"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_port_80_with_no_args() {
        let cfg = ServerConfig::from_args(&["ringhttpd".to_string()]).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_valid_port_arg() {
        let cfg =
            ServerConfig::from_args(&["ringhttpd".to_string(), "9090".to_string()]).unwrap();
        assert_eq!(cfg.port, 9090);
    }

    #[test]
    fn rejects_non_numeric_port() {
        let err =
            ServerConfig::from_args(&["ringhttpd".to_string(), "abc".to_string()]).unwrap_err();
        assert!(err.contains("invalid port"));
    }

    #[test]
    fn rejects_out_of_range_port() {
        let err =
            ServerConfig::from_args(&["ringhttpd".to_string(), "65535".to_string()]).unwrap_err();
        assert!(err.contains("out of range"));
    }
}
