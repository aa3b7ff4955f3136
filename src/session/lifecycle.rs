//! Connection Lifecycle
//!
//! Drives one adapter instance through `Disconnected -> Connecting ->
//! Connected`. Owns the backend connection and, for tunnelled stores, the
//! `TunnelHandle` that carries it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::reconnect::ReconnectPolicy;
use super::state::ConnectionState;
use crate::config::ConnectionSettings;
use crate::error::KvError;
use crate::forwarding::{TunnelHandle, TunnelManager};
use crate::store::{Connection, Driver};

#[derive(Default)]
struct Handles {
    connection: Option<Arc<dyn Connection>>,
    tunnel: Option<TunnelHandle>,
}

/// Per-instance connection state machine
pub struct ConnectionLifecycle {
    name: String,
    settings: ConnectionSettings,
    driver: Arc<dyn Driver>,
    tunnels: Arc<TunnelManager>,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    state: RwLock<ConnectionState>,
    handles: Mutex<Handles>,
    /// Serializes connect and close
    op_lock: tokio::sync::Mutex<()>,
}

impl ConnectionLifecycle {
    pub fn new(
        name: impl Into<String>,
        settings: ConnectionSettings,
        driver: Arc<dyn Driver>,
        tunnels: Arc<TunnelManager>,
        connect_timeout: Duration,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            driver,
            tunnels,
            connect_timeout,
            reconnect,
            state: RwLock::new(ConnectionState::Disconnected),
            handles: Mutex::new(Handles::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Local port of the tunnel carrying this connection, if any
    pub fn tunnel_port(&self) -> Option<u16> {
        self.handles.lock().tunnel.as_ref().map(TunnelHandle::local_port)
    }

    /// The live connection; fails unless connected
    pub fn connection(&self) -> Result<Arc<dyn Connection>, KvError> {
        if self.state() != ConnectionState::Connected {
            return Err(KvError::NotConnected(self.name.clone()));
        }
        self.handles
            .lock()
            .connection
            .clone()
            .ok_or_else(|| KvError::NotConnected(self.name.clone()))
    }

    /// Establish the connection, opening a tunnel first when configured.
    ///
    /// The whole attempt is bounded by a watchdog of twice `timeout`. On
    /// failure every partially created resource is released before the error
    /// is returned. Connecting an already connected instance is a no-op.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<(), KvError> {
        let _op = self.op_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            debug!("\"{}\" already connected", self.name);
            return Ok(());
        }

        let timeout = timeout.unwrap_or(self.connect_timeout);
        let watchdog = timeout.saturating_mul(2);
        self.set_state(ConnectionState::Connecting);

        let result = match tokio::time::timeout(watchdog, self.establish(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(KvError::ConnectError(format!(
                "\"{}\" did not connect within {}ms",
                self.name,
                watchdog.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Key-value store \"{}\" connected", self.name);
                Ok(())
            }
            Err(e) => {
                warn!("Key-value store \"{}\" failed to connect: {}", self.name, e);
                self.teardown().await;
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self, timeout: Duration) -> Result<(), KvError> {
        let settings = match &self.settings.tunnel {
            Some(tunnel) => {
                let handle = self
                    .tunnels
                    .open_for(&self.settings.host, self.settings.port, tunnel)
                    .await?;
                let rewritten = self.settings.through_local_port(handle.local_port());
                self.handles.lock().tunnel = Some(handle);
                rewritten
            }
            None => self.settings.clone(),
        };

        debug!(
            "Connecting \"{}\" to {}:{} with the {} driver",
            self.name,
            settings.host,
            settings.port,
            self.driver.name()
        );

        let connection =
            tokio::time::timeout(timeout, self.driver.connect(&settings, timeout, &self.reconnect))
                .await
                .map_err(|_| {
                    KvError::ConnectError(format!(
                        "\"{}\" at {}:{} timed out after {}ms",
                        self.name,
                        settings.host,
                        settings.port,
                        timeout.as_millis()
                    ))
                })?
                .map_err(|e| match e {
                    KvError::ConnectError(_) => e,
                    other => KvError::ConnectError(format!(
                        "\"{}\" at {}:{}: {}",
                        self.name, settings.host, settings.port, other
                    )),
                })?;

        self.handles.lock().connection = Some(connection);
        Ok(())
    }

    /// Disconnect and release the tunnel; never fails
    pub async fn close(&self) {
        let _op = self.op_lock.lock().await;
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        debug!("Key-value store \"{}\" closed", self.name);
    }

    async fn teardown(&self) {
        let (connection, tunnel) = {
            let mut handles = self.handles.lock();
            (handles.connection.take(), handles.tunnel.take())
        };

        if let Some(connection) = connection {
            if let Err(e) = connection.disconnect().await {
                warn!("Ignoring disconnect failure for \"{}\": {}", self.name, e);
            }
        }
        if let Some(tunnel) = tunnel {
            tunnel.close();
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            debug!("\"{}\": unexpected transition {} -> {}", self.name, *state, next);
        }
        *state = next;
    }
}
