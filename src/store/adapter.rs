//! Store adapters
//!
//! `KvStore` is the capability every backend exposes. `Adapter` implements it
//! for any `Driver` by composing a `ConnectionLifecycle` with a
//! `CommandDispatcher`; a backend that needs more control can implement
//! `KvStore` itself and register an `AdapterFactory` for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::connection::Driver;
use super::dispatcher::{CommandDispatcher, Keys};
use super::reply::Reply;
use crate::config::{ConnectionSettings, StoreConfig};
use crate::error::KvError;
use crate::forwarding::TunnelManager;
use crate::session::{ConnectionLifecycle, ConnectionState, ReconnectPolicy};

/// Timeouts and reconnect pacing shared by adapter instances
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Capability interface of a key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ConnectionState;

    async fn connect(&self, timeout: Option<Duration>) -> Result<(), KvError>;

    /// Best-effort close; never fails
    async fn close(&self);

    async fn command(&self, name: &str, args: Vec<Bytes>) -> Result<Reply, KvError>;

    async fn set(&self, key: &str, value: Value) -> Result<Value, KvError>;

    async fn get(&self, key: &str, default: Value) -> Result<Value, KvError>;

    async fn clear(&self, keys: Keys) -> Result<i64, KvError>;

    async fn set_raw(&self, key: &str, value: Option<String>) -> Result<Option<String>, KvError>;

    async fn get_raw(&self, key: &str, default: Option<String>) -> Result<Option<String>, KvError>;

    async fn set_buffer(&self, key: &str, value: Option<Bytes>) -> Result<Option<Bytes>, KvError>;

    async fn get_buffer(&self, key: &str, default: Option<Bytes>) -> Result<Option<Bytes>, KvError>;
}

/// Builds store instances for one backend kind
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        config: &StoreConfig,
        tunnels: Arc<TunnelManager>,
        options: &AdapterOptions,
    ) -> Result<Arc<dyn KvStore>, KvError>;
}

/// Factory producing `Adapter`s over a fresh driver per instance
pub struct DriverFactory {
    make_driver: Box<dyn Fn() -> Arc<dyn Driver> + Send + Sync>,
}

impl DriverFactory {
    pub fn new<F>(make_driver: F) -> Self
    where
        F: Fn() -> Arc<dyn Driver> + Send + Sync + 'static,
    {
        Self {
            make_driver: Box::new(make_driver),
        }
    }
}

impl AdapterFactory for DriverFactory {
    fn create(
        &self,
        name: &str,
        config: &StoreConfig,
        tunnels: Arc<TunnelManager>,
        options: &AdapterOptions,
    ) -> Result<Arc<dyn KvStore>, KvError> {
        let adapter = Adapter::new(name, config, (self.make_driver)(), tunnels, options)?;
        Ok(Arc::new(adapter))
    }
}

/// One bound store: resolved settings, lifecycle and dispatcher
pub struct Adapter {
    id: Uuid,
    lifecycle: Arc<ConnectionLifecycle>,
    dispatcher: CommandDispatcher,
}

impl Adapter {
    /// Resolve `config` into connection settings; reads the tunnel key file if one is named
    pub fn new(
        name: &str,
        config: &StoreConfig,
        driver: Arc<dyn Driver>,
        tunnels: Arc<TunnelManager>,
        options: &AdapterOptions,
    ) -> Result<Self, KvError> {
        let settings = ConnectionSettings::from_config(config).map_err(|e| e.within(name))?;
        let id = Uuid::new_v4();
        debug!("Created {} adapter {} for \"{}\": {:?}", driver.name(), id, name, settings);

        let lifecycle = Arc::new(ConnectionLifecycle::new(
            name,
            settings,
            driver,
            tunnels,
            options.connect_timeout,
            options.reconnect.clone(),
        ));
        let dispatcher = CommandDispatcher::new(lifecycle.clone(), options.command_timeout);
        Ok(Self {
            id,
            lifecycle,
            dispatcher,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &ConnectionSettings {
        self.lifecycle.settings()
    }

    pub fn tunnel_port(&self) -> Option<u16> {
        self.lifecycle.tunnel_port()
    }
}

#[async_trait]
impl KvStore for Adapter {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    async fn connect(&self, timeout: Option<Duration>) -> Result<(), KvError> {
        self.lifecycle.connect(timeout).await
    }

    async fn close(&self) {
        self.lifecycle.close().await
    }

    async fn command(&self, name: &str, args: Vec<Bytes>) -> Result<Reply, KvError> {
        self.dispatcher.command(name, args).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<Value, KvError> {
        self.dispatcher.set(key, value).await
    }

    async fn get(&self, key: &str, default: Value) -> Result<Value, KvError> {
        self.dispatcher.get(key, default).await
    }

    async fn clear(&self, keys: Keys) -> Result<i64, KvError> {
        self.dispatcher.clear(keys).await
    }

    async fn set_raw(&self, key: &str, value: Option<String>) -> Result<Option<String>, KvError> {
        self.dispatcher.set_raw(key, value).await
    }

    async fn get_raw(&self, key: &str, default: Option<String>) -> Result<Option<String>, KvError> {
        self.dispatcher.get_raw(key, default).await
    }

    async fn set_buffer(&self, key: &str, value: Option<Bytes>) -> Result<Option<Bytes>, KvError> {
        self.dispatcher.set_buffer(key, value).await
    }

    async fn get_buffer(&self, key: &str, default: Option<Bytes>) -> Result<Option<Bytes>, KvError> {
        self.dispatcher.get_buffer(key, default).await
    }
}
