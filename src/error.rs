// src/error.rs
use crate::parser::ParseError;
use std::io;

/// Central error type for the server engine.
#[derive(Debug)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error during HTTP request parsing.
    Parse(ParseError),
    /// Connection table reached its capacity.
    TableFull,
    /// A worker thread failed to start or was poisoned.
    WorkerPanic(String),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Parse(e) => write!(f, "parse error: {:?}", e),
            ServerError::TableFull => write!(f, "connection table is full"),
            ServerError::WorkerPanic(msg) => write!(f, "worker panic: {}", msg),
            ServerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<ParseError> for ServerError {
    fn from(e: ParseError) -> Self {
        ServerError::Parse(e)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
