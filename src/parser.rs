// src/parser.rs

pub const WORD_BUF_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Head,
    Options,
    Delete,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"DELETE" => Method::Delete,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }
}

/// The request line's method plus resource path, nothing else. Headers,
/// query strings and bodies are never parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub resource: String,
}

#[derive(Debug)]
pub enum ParseError {
    /// No data to parse at all.
    Empty,
}

/// Scans the first two whitespace-delimited tokens out of `buf`. The
/// resource is truncated (not rejected) at `WORD_BUF_SIZE` bytes, matching
/// the upstream behavior of never emitting a 413 for an oversized line.
pub fn parse_request(buf: &[u8]) -> Result<Request, ParseError> {
    if buf.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut i = 0;
    while i < buf.len() && buf[i] != b' ' {
        i += 1;
    }
    let method = Method::from_bytes(&buf[..i]);

    let mut j = i;
    while j < buf.len() && buf[j] == b' ' {
        j += 1;
    }
    let start = j;
    while j < buf.len() && buf[j] != b' ' && buf[j] != b'\r' && buf[j] != b'\n' {
        j += 1;
    }

    let raw = &buf[start..j];
    let truncated = &raw[..raw.len().min(WORD_BUF_SIZE)];
    let resource = String::from_utf8_lossy(truncated).into_owned();

    Ok(Request { method, resource })
}
