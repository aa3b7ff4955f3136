//! Command Dispatcher
//!
//! Runs primitive commands against a connected lifecycle, each raced against
//! the per-command timeout, and layers the JSON, raw and binary operations on
//! top.
//!
//! A command whose timer fires releases the caller with `CommandTimeout`. The
//! request itself stays queued on the connection; its reply is discarded when
//! it eventually arrives.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use super::connection::Request;
use super::reply::Reply;
use crate::error::KvError;
use crate::session::ConnectionLifecycle;

/// One or more keys for a batched delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keys(Vec<String>);

impl Keys {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<&str> for Keys {
    fn from(key: &str) -> Self {
        Keys(vec![key.to_string()])
    }
}

impl From<String> for Keys {
    fn from(key: String) -> Self {
        Keys(vec![key])
    }
}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Keys(keys)
    }
}

impl From<Vec<&str>> for Keys {
    fn from(keys: Vec<&str>) -> Self {
        Keys(keys.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Keys {
    fn from(keys: &[&str]) -> Self {
        Keys(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Keys {
    fn from(keys: [&str; N]) -> Self {
        Keys(keys.iter().map(|k| k.to_string()).collect())
    }
}

/// Timeout-guarded command execution for one adapter instance
pub struct CommandDispatcher {
    lifecycle: Arc<ConnectionLifecycle>,
    command_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(lifecycle: Arc<ConnectionLifecycle>, command_timeout: Duration) -> Self {
        Self {
            lifecycle,
            command_timeout,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Run one primitive command.
    ///
    /// Error replies from the backend surface as `KvError::Backend`.
    pub async fn command(&self, name: &str, args: Vec<Bytes>) -> Result<Reply, KvError> {
        let connection = self.lifecycle.connection()?;
        let request = Request::new(name).args(args);
        if !connection.supports(&request.command) {
            return Err(KvError::UnsupportedCommand(name.to_string()));
        }

        let command = request.command.clone();
        let pending = connection.submit(request);
        match tokio::time::timeout(self.command_timeout, pending).await {
            Err(_) => {
                debug!(
                    "\"{}\" on \"{}\" timed out; a late reply will be discarded",
                    command,
                    self.lifecycle.name()
                );
                Err(KvError::CommandTimeout {
                    store: self.lifecycle.name().to_string(),
                    command,
                    timeout: self.command_timeout,
                })
            }
            Ok(Err(_)) => Err(KvError::Backend(format!(
                "connection dropped \"{}\" before replying",
                command
            ))),
            Ok(Ok(Ok(Reply::Error(message)))) => Err(KvError::Backend(message)),
            Ok(Ok(result)) => result,
        }
    }

    /// Store `value` as JSON; `null` clears the key. Returns `value`.
    pub async fn set(&self, key: &str, value: Value) -> Result<Value, KvError> {
        if value.is_null() {
            self.clear(key).await?;
            return Ok(Value::Null);
        }
        let encoded = serde_json::to_string(&value).map_err(|e| KvError::CorruptValue {
            key: key.to_string(),
            reason: format!("Could not encode JSON: {}", e),
        })?;
        self.store(key, Bytes::from(encoded)).await?;
        Ok(value)
    }

    /// Read a JSON value; absent keys and stored `null` yield `default`
    pub async fn get(&self, key: &str, default: Value) -> Result<Value, KvError> {
        let Some(bytes) = self.fetch(key).await? else {
            return Ok(default);
        };
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| KvError::CorruptValue {
            key: key.to_string(),
            reason: format!("Invalid JSON: {}", e),
        })?;
        Ok(if value.is_null() { default } else { value })
    }

    /// Delete every key in one batched command; returns the number removed
    pub async fn clear(&self, keys: impl Into<Keys>) -> Result<i64, KvError> {
        let keys = keys.into();
        if keys.is_empty() {
            return Ok(0);
        }
        let args = keys.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())).collect();
        let reply = self.command("DEL", args).await?;
        reply.as_integer().ok_or_else(|| KvError::Protocol {
            command: "DEL".to_string(),
            reply: reply.describe(),
        })
    }

    /// Store a string verbatim; `None` clears the key
    pub async fn set_raw(&self, key: &str, value: Option<String>) -> Result<Option<String>, KvError> {
        let Some(value) = value else {
            self.clear(key).await?;
            return Ok(None);
        };
        self.store(key, Bytes::from(value.clone())).await?;
        Ok(Some(value))
    }

    /// Read a string verbatim
    pub async fn get_raw(&self, key: &str, default: Option<String>) -> Result<Option<String>, KvError> {
        match self.fetch(key).await? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| KvError::CorruptValue {
                    key: key.to_string(),
                    reason: "Invalid UTF-8".to_string(),
                }),
            None => Ok(default),
        }
    }

    /// Store bytes verbatim; `None` clears the key
    pub async fn set_buffer(&self, key: &str, value: Option<Bytes>) -> Result<Option<Bytes>, KvError> {
        let Some(value) = value else {
            self.clear(key).await?;
            return Ok(None);
        };
        self.store(key, value.clone()).await?;
        Ok(Some(value))
    }

    /// Read bytes verbatim
    pub async fn get_buffer(&self, key: &str, default: Option<Bytes>) -> Result<Option<Bytes>, KvError> {
        Ok(self.fetch(key).await?.or(default))
    }

    async fn store(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        let reply = self
            .command("SET", vec![Bytes::copy_from_slice(key.as_bytes()), value])
            .await?;
        if !reply.is_ok() {
            return Err(KvError::Protocol {
                command: "SET".to_string(),
                reply: reply.describe(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        match self
            .command("GET", vec![Bytes::copy_from_slice(key.as_bytes())])
            .await?
        {
            Reply::Nil => Ok(None),
            Reply::Bulk(bytes) => Ok(Some(bytes)),
            other => Err(KvError::Protocol {
                command: "GET".to_string(),
                reply: other.describe(),
            }),
        }
    }
}
