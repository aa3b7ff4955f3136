//! Configuration Management Module
//!
//! Handles validation, `{{ VAR }}` interpolation and persistent storage of
//! per-environment store configurations, and normalizes them into the
//! settings an adapter connects with.

pub mod schema;
pub mod settings;
pub mod storage;
pub mod template;
pub mod types;

pub use schema::validate;
pub use settings::{
    load_private_key, parse_connection_string, ConnectionSettings, TunnelSettings, DEFAULT_HOST,
    DEFAULT_PORT, DEFAULT_USER,
};
pub use storage::{
    runtime_env, ConfigManager, CONFIG_DIR, CONFIG_FILE, DEVELOPMENT_ENV, RUNTIME_ENV_VAR,
};
pub use template::{interpolate, EnvSource, ProcessEnv};
pub use types::{
    ConnectionStringConfig, DiscreteConfig, PortSetting, SslMode, StoreConfig, TunnelConfig,
};
