//! kvlink - named key-value stores behind optional SSH tunnels
//!
//! Per-environment store configuration with `{{ VAR }}` interpolation,
//! tunnelled or direct connections with background reconnect, and
//! timeout-guarded JSON, raw and binary operations.
//!
//! ```no_run
//! # async fn demo() -> Result<(), kvlink::KvError> {
//! let registry = kvlink::StoreRegistry::new();
//! let kv = registry.connect_url("redis://localhost:6379").await?;
//! kv.set("greeting", serde_json::json!({"hello": "world"})).await?;
//! registry.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod forwarding;
pub mod session;
pub mod ssh;
pub mod store;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConfigManager, ConnectionSettings, SslMode, StoreConfig, TunnelConfig};
pub use error::KvError;
pub use forwarding::{PortRegistry, TunnelHandle, TunnelManager};
pub use session::{ConnectionLifecycle, ConnectionState, ReconnectPolicy};
pub use store::{
    AdapterFactory, AdapterOptions, Keys, KvStore, Reply, StoreRegistry, DEFAULT_ADAPTER,
    MAIN_STORE,
};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
