//! Backend connection seam
//!
//! A `Driver` dials a backend and hands back a `Connection`. Requests are
//! submitted synchronously so they reach the backend in issue order; the
//! reply arrives later on a oneshot channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use super::reply::Reply;
use crate::config::ConnectionSettings;
use crate::error::KvError;
use crate::session::ReconnectPolicy;

/// One primitive command and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Upper-case command name
    pub command: String,
    pub args: Vec<Bytes>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_ascii_uppercase(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Receiver for the reply to a submitted request
pub type PendingReply = oneshot::Receiver<Result<Reply, KvError>>;

/// Build a reply receiver that is already resolved
pub fn ready(result: Result<Reply, KvError>) -> PendingReply {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

/// A live connection to a backend
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether `command` (upper-case) is a primitive this backend executes
    fn supports(&self, command: &str) -> bool;

    /// Queue a request; never suspends
    fn submit(&self, request: Request) -> PendingReply;

    /// Close the connection; closing twice is not an error
    async fn disconnect(&self) -> Result<(), KvError>;
}

/// Dials connections for one kind of backend
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the initial connection within `timeout`
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        timeout: Duration,
        reconnect: &ReconnectPolicy,
    ) -> Result<Arc<dyn Connection>, KvError>;
}
