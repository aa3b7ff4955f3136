//! In-process backend
//!
//! Serves GET, SET, DEL, EXISTS and PING from a shared map. The map belongs to
//! the driver, so data survives close and reconnect of the same adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use super::connection::{ready, Connection, Driver, PendingReply, Request};
use super::reply::Reply;
use crate::config::ConnectionSettings;
use crate::error::KvError;
use crate::session::ReconnectPolicy;

/// Commands the in-process backend executes
pub const MEMORY_COMMANDS: &[&str] = &["GET", "SET", "DEL", "EXISTS", "PING"];

type Data = Arc<RwLock<HashMap<Bytes, Bytes>>>;

/// Driver for the in-process backend
#[derive(Default)]
pub struct MemoryDriver {
    data: Data,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(
        &self,
        settings: &ConnectionSettings,
        _timeout: Duration,
        _reconnect: &ReconnectPolicy,
    ) -> Result<Arc<dyn Connection>, KvError> {
        debug!(
            "Opening in-process store for {}:{}",
            settings.host, settings.port
        );
        Ok(Arc::new(MemoryConnection {
            data: self.data.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

/// Connection to the in-process backend
pub struct MemoryConnection {
    data: Data,
    open: AtomicBool,
}

impl MemoryConnection {
    fn execute(&self, request: &Request) -> Reply {
        let args = &request.args;
        match request.command.as_str() {
            "PING" => match args.as_slice() {
                [] => Reply::Status("PONG".into()),
                [message] => Reply::Bulk(message.clone()),
                _ => wrong_arity("ping"),
            },
            "GET" => match args.as_slice() {
                [key] => self.data.read().get(key).cloned().into(),
                _ => wrong_arity("get"),
            },
            "SET" => match args.as_slice() {
                [key, value] => {
                    self.data.write().insert(key.clone(), value.clone());
                    Reply::ok()
                }
                _ => wrong_arity("set"),
            },
            "DEL" if !args.is_empty() => {
                let mut data = self.data.write();
                let removed = args.iter().filter(|key| data.remove(*key).is_some()).count();
                Reply::Integer(removed as i64)
            }
            "EXISTS" if !args.is_empty() => {
                let data = self.data.read();
                let found = args.iter().filter(|key| data.contains_key(*key)).count();
                Reply::Integer(found as i64)
            }
            "DEL" | "EXISTS" => wrong_arity(&request.command.to_ascii_lowercase()),
            other => Reply::Error(format!("ERR unknown command '{}'", other.to_ascii_lowercase())),
        }
    }
}

fn wrong_arity(command: &str) -> Reply {
    Reply::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        command
    ))
}

#[async_trait]
impl Connection for MemoryConnection {
    fn supports(&self, command: &str) -> bool {
        MEMORY_COMMANDS.contains(&command)
    }

    fn submit(&self, request: Request) -> PendingReply {
        if !self.open.load(Ordering::SeqCst) {
            return ready(Err(KvError::Backend("connection is closed".to_string())));
        }
        ready(Ok(self.execute(&request)))
    }

    async fn disconnect(&self) -> Result<(), KvError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(driver: &MemoryDriver) -> Arc<dyn Connection> {
        driver
            .connect(
                &ConnectionSettings::default(),
                Duration::from_secs(1),
                &ReconnectPolicy::default(),
            )
            .await
            .unwrap()
    }

    async fn run(connection: &Arc<dyn Connection>, request: Request) -> Reply {
        connection.submit(request).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_commands() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver).await;

        assert_eq!(run(&conn, Request::new("GET").arg("a")).await, Reply::Nil);
        assert!(run(&conn, Request::new("SET").arg("a").arg("1")).await.is_ok());
        assert_eq!(run(&conn, Request::new("GET").arg("a")).await, Reply::from("1"));
        assert_eq!(
            run(&conn, Request::new("EXISTS").arg("a").arg("b")).await,
            Reply::Integer(1)
        );
        assert_eq!(
            run(&conn, Request::new("DEL").arg("a").arg("b")).await,
            Reply::Integer(1)
        );
        assert_eq!(run(&conn, Request::new("PING")).await, Reply::Status("PONG".into()));
    }

    #[tokio::test]
    async fn test_wrong_arity_is_an_error_reply() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver).await;
        assert!(matches!(run(&conn, Request::new("GET")).await, Reply::Error(_)));
        assert!(matches!(run(&conn, Request::new("DEL")).await, Reply::Error(_)));
        assert!(!conn.supports("KEYS"));
    }

    #[tokio::test]
    async fn test_data_survives_reconnect() {
        let driver = MemoryDriver::new();
        let first = connect(&driver).await;
        run(&first, Request::new("SET").arg("k").arg("v")).await;
        first.disconnect().await.unwrap();
        first.disconnect().await.unwrap();
        assert!(first.submit(Request::new("PING")).await.unwrap().is_err());

        let second = connect(&driver).await;
        assert_eq!(run(&second, Request::new("GET").arg("k")).await, Reply::from("v"));
        assert_eq!(driver.len(), 1);
    }
}
