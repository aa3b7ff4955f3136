//! Store Registry
//!
//! Maps logical store names to bound adapter instances. A name is reserved
//! before its adapter connects, so two concurrent `add_store` calls for the
//! same name cannot both succeed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::adapter::{AdapterFactory, AdapterOptions, DriverFactory, KvStore};
use super::connection::Driver;
use super::memory::MemoryDriver;
use super::resp::RespDriver;
use crate::config::{validate, ConfigManager, StoreConfig};
use crate::error::KvError;
use crate::forwarding::TunnelManager;

/// Name of the implicit default store
pub const MAIN_STORE: &str = "main";

/// Adapter used when none is named
pub const DEFAULT_ADAPTER: &str = "redis";

enum Slot {
    /// Reserved by the `add_store` holding this ticket
    Connecting(u64),
    Bound(Arc<dyn KvStore>),
}

/// Reserved name that is released on drop unless bound
struct SlotReservation<'a> {
    stores: &'a DashMap<String, Slot>,
    name: String,
    ticket: u64,
    bound: bool,
}

impl SlotReservation<'_> {
    fn owns(&self, slot: &Slot) -> bool {
        matches!(slot, Slot::Connecting(ticket) if *ticket == self.ticket)
    }

    /// Bind `store` if the reservation survived; hands the store back otherwise
    fn bind(mut self, store: Arc<dyn KvStore>) -> Result<(), Arc<dyn KvStore>> {
        let stores = self.stores;
        let result = match stores.get_mut(&self.name) {
            Some(mut slot) if self.owns(&slot) => {
                *slot = Slot::Bound(store);
                Ok(())
            }
            _ => Err(store),
        };
        self.bound = result.is_ok();
        result
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.bound {
            self.stores.remove_if(&self.name, |_, slot| self.owns(slot));
        }
    }
}

/// Registry of named key-value stores
pub struct StoreRegistry {
    stores: DashMap<String, Slot>,
    adapters: DashMap<String, Arc<dyn AdapterFactory>>,
    tunnels: Arc<TunnelManager>,
    options: AdapterOptions,
    next_ticket: AtomicU64,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreRegistry {
    /// Registry with the `redis` and `memory` adapters and SSH tunnelling
    pub fn new() -> Self {
        Self::with_tunnels(Arc::new(TunnelManager::ssh()))
    }

    /// Registry using `tunnels` for every tunnelled store
    pub fn with_tunnels(tunnels: Arc<TunnelManager>) -> Self {
        let registry = Self {
            stores: DashMap::new(),
            adapters: DashMap::new(),
            tunnels,
            options: AdapterOptions::default(),
            next_ticket: AtomicU64::new(0),
        };
        registry.register_adapter(
            "redis",
            Arc::new(DriverFactory::new(|| Arc::new(RespDriver::new()) as Arc<dyn Driver>)),
        );
        registry.register_adapter(
            "memory",
            Arc::new(DriverFactory::new(|| Arc::new(MemoryDriver::new()) as Arc<dyn Driver>)),
        );
        registry
    }

    pub fn with_options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Make an adapter available under `name`, replacing any previous one
    pub fn register_adapter(&self, name: impl Into<String>, factory: Arc<dyn AdapterFactory>) {
        let name = name.into();
        debug!("Registered key-value adapter \"{}\"", name);
        self.adapters.insert(name, factory);
    }

    /// Bind and connect `name` with the default adapter
    pub async fn add_store(&self, name: &str, config: StoreConfig) -> Result<Arc<dyn KvStore>, KvError> {
        self.add_store_with(name, config, DEFAULT_ADAPTER).await
    }

    /// Validate a raw JSON config, then bind and connect it
    pub async fn add_store_json(&self, name: &str, raw: &Value) -> Result<Arc<dyn KvStore>, KvError> {
        let config = validate(raw, false).map_err(|e| e.within(name))?;
        self.add_store(name, config).await
    }

    /// Bind and connect `name` with the adapter registered as `adapter`
    pub async fn add_store_with(
        &self,
        name: &str,
        config: StoreConfig,
        adapter: &str,
    ) -> Result<Arc<dyn KvStore>, KvError> {
        let reservation = self.reserve(name)?;

        let factory = self
            .adapters
            .get(adapter)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KvError::invalid(format!("Unknown key-value adapter \"{}\"", adapter)))?;

        let store = factory.create(name, &config, self.tunnels.clone(), &self.options)?;
        store.connect(None).await?;

        if let Err(orphan) = reservation.bind(store.clone()) {
            // the registry was reset while this store was connecting
            orphan.close().await;
            warn!("Key-value store \"{}\" discarded: registry reset while connecting", name);
            return Err(KvError::ConnectError(format!(
                "\"{}\" was unbound while connecting",
                name
            )));
        }
        info!("Key-value store \"{}\" bound with the {} adapter", name, adapter);
        Ok(store)
    }

    /// Bind the `main` store
    pub async fn connect(&self, config: StoreConfig) -> Result<Arc<dyn KvStore>, KvError> {
        self.add_store(MAIN_STORE, config).await
    }

    /// Bind the `main` store from a `redis[s]://` connection string
    pub async fn connect_url(&self, url: &str) -> Result<Arc<dyn KvStore>, KvError> {
        self.connect(StoreConfig::from_connection_string(url)).await
    }

    /// Bind the `main` store from the persisted config for the runtime environment
    pub async fn connect_from_config(&self, manager: &ConfigManager) -> Result<Arc<dyn KvStore>, KvError> {
        let config = manager.read(manager.runtime_env(), MAIN_STORE, None).await?;
        self.connect(config).await
    }

    /// The store bound as `name`
    pub fn store(&self, name: &str) -> Result<Arc<dyn KvStore>, KvError> {
        match self.stores.get(name).as_deref() {
            Some(Slot::Bound(store)) => Ok(store.clone()),
            _ => Err(KvError::StoreNotConnected(name.to_string())),
        }
    }

    /// The `main` store
    pub fn main(&self) -> Result<Arc<dyn KvStore>, KvError> {
        self.store(MAIN_STORE)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.store(name).is_ok()
    }

    /// Names of bound stores, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stores
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Bound(_)))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Close and unbind one store
    pub async fn close_store(&self, name: &str) -> Result<(), KvError> {
        let removed = self
            .stores
            .remove_if(name, |_, slot| matches!(slot, Slot::Bound(_)));
        match removed {
            Some((_, Slot::Bound(store))) => {
                store.close().await;
                info!("Key-value store \"{}\" closed", name);
                Ok(())
            }
            _ => Err(KvError::StoreNotConnected(name.to_string())),
        }
    }

    /// Close every bound store, `main` last, and empty the registry.
    ///
    /// Stores still connecting lose their reservation; they are closed when
    /// their connect finishes instead of being bound.
    pub async fn disconnect_all(&self) {
        self.stores
            .retain(|_, slot| !matches!(slot, Slot::Connecting(_)));

        let mut names = self.names();
        // main goes last
        names.sort_by_key(|name| name == MAIN_STORE);

        for name in names {
            if let Err(e) = self.close_store(&name).await {
                warn!("Ignoring failure closing \"{}\": {}", name, e);
            }
        }
        debug!("Key-value registry cleared");
    }

    fn reserve(&self, name: &str) -> Result<SlotReservation<'_>, KvError> {
        match self.stores.entry(name.to_string()) {
            Entry::Occupied(_) => Err(KvError::DuplicateStore(name.to_string())),
            Entry::Vacant(slot) => {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                slot.insert(Slot::Connecting(ticket));
                Ok(SlotReservation {
                    stores: &self.stores,
                    name: name.to_string(),
                    ticket,
                    bound: false,
                })
            }
        }
    }
}
