//! Key-value error types

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by config handling, tunnels, connections and commands.
///
/// Config-related variants carry a `path` of bracketed segments
/// (`["test"]["main"]["tunnel"]["user"]`). Segments are prepended with
/// [`KvError::within`] as the error bubbles out of nested structures.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Invalid key-value config{}: {message}", at(.path))]
    ConfigInvalid { path: String, message: String },

    #[error("Key-value config not found: {0}")]
    ConfigNotFound(String),

    #[error("Key-value config error{}: No environment variable matching \"{var}\" found", at(.path))]
    MissingEnvVar { path: String, var: String },

    #[error("Key-value config error{}: Environment variable matching \"{var}\" is empty", at(.path))]
    EmptyEnvVar { path: String, var: String },

    #[error("Could not create SSH tunnel: Maximum retries reached ({attempts} attempts from local port {first_port})")]
    TunnelExhausted { attempts: u32, first_port: u16 },

    #[error("SSH tunnel error: {0}")]
    TunnelError(String),

    #[error("Could not connect: {0}")]
    ConnectError(String),

    #[error(
        "Key-value command \"{command}\" on \"{store}\" timed out after {}ms",
        millis(.timeout)
    )]
    CommandTimeout {
        store: String,
        command: String,
        timeout: Duration,
    },

    #[error("Key-value store \"{0}\" not connected")]
    NotConnected(String),

    #[error("Invalid command: \"{0}\"")]
    UnsupportedCommand(String),

    #[error("Invalid key-value response for \"{key}\": {reason}")]
    CorruptValue { key: String, reason: String },

    #[error("Key-value store \"{0}\" already connected")]
    DuplicateStore(String),

    #[error("Key-value store \"{0}\" is not connected; call connect() or add_store() first")]
    StoreNotConnected(String),

    #[error("Invalid key-value response for \"{command}\": {reply}")]
    Protocol { command: String, reply: String },

    #[error("Key-value backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn millis(timeout: &Duration) -> u128 {
    timeout.as_millis()
}

fn at(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!(" at {}", path)
    }
}

impl KvError {
    /// Build a `ConfigInvalid` error at the root of the current structure
    pub fn invalid(message: impl Into<String>) -> Self {
        KvError::ConfigInvalid {
            path: String::new(),
            message: message.into(),
        }
    }

    /// Prepend a field-path segment to config errors; other variants pass through
    pub fn within(self, segment: &str) -> Self {
        let prefix = format!("[\"{}\"]", segment);
        match self {
            KvError::ConfigInvalid { path, message } => KvError::ConfigInvalid {
                path: prefix + &path,
                message,
            },
            KvError::MissingEnvVar { path, var } => KvError::MissingEnvVar {
                path: prefix + &path,
                var,
            },
            KvError::EmptyEnvVar { path, var } => KvError::EmptyEnvVar {
                path: prefix + &path,
                var,
            },
            other => other,
        }
    }

    /// Field path for config errors
    pub fn path(&self) -> Option<&str> {
        match self {
            KvError::ConfigInvalid { path, .. }
            | KvError::MissingEnvVar { path, .. }
            | KvError::EmptyEnvVar { path, .. } => Some(path),
            _ => None,
        }
    }
}
