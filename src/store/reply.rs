//! Backend replies

use bytes::Bytes;

/// A reply from a key-value backend, shaped after RESP2
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple status line such as `OK` or `PONG`
    Status(String),
    Integer(i64),
    Bulk(Bytes),
    /// Null bulk string or null array
    Nil,
    Array(Vec<Reply>),
    /// Error reported by the backend for this command
    Error(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// `+OK`
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s == "OK")
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Short human readable form used in protocol errors
    pub fn describe(&self) -> String {
        match self {
            Reply::Status(s) => format!("status \"{}\"", s),
            Reply::Integer(n) => format!("integer {}", n),
            Reply::Bulk(b) => format!("bulk string of {} bytes", b.len()),
            Reply::Nil => "nil".to_string(),
            Reply::Array(items) => format!("array of {} items", items.len()),
            Reply::Error(e) => format!("error \"{}\"", e),
        }
    }
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Reply::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Option<Bytes>> for Reply {
    fn from(value: Option<Bytes>) -> Self {
        match value {
            Some(bytes) => Reply::Bulk(bytes),
            None => Reply::Nil,
        }
    }
}
