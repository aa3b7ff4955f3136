//! Store configuration types
//!
//! A store config has exactly one active shape: either a single
//! `connectionString` or the discrete `host`/`port`/... fields. Both shapes may
//! carry `in_vpc` and an SSH `tunnel`.

use serde::{Serialize, Serializer};

/// Default local SSH port for tunnels
pub const DEFAULT_SSH_PORT: u16 = 22;

/// TLS mode for the store connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disabled,
    Enabled,
    /// TLS without certificate verification
    Unauthorized,
}

impl SslMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, SslMode::Disabled)
    }
}

impl Serialize for SslMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            SslMode::Disabled => serializer.serialize_bool(false),
            SslMode::Enabled => serializer.serialize_bool(true),
            SslMode::Unauthorized => serializer.serialize_str("unauthorized"),
        }
    }
}

/// A port that is either concrete or still an unresolved `{{ VAR }}` template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PortSetting {
    Number(u16),
    Template(String),
}

impl PortSetting {
    /// Concrete port, if resolved
    pub fn number(&self) -> Option<u16> {
        match self {
            PortSetting::Number(port) => Some(*port),
            PortSetting::Template(_) => None,
        }
    }
}

impl From<u16> for PortSetting {
    fn from(port: u16) -> Self {
        PortSetting::Number(port)
    }
}

/// SSH intermediary used to reach the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfig {
    pub user: String,
    pub host: String,
    pub port: PortSetting,
    /// Raw key material or a path to a key file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl TunnelConfig {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: PortSetting::Number(DEFAULT_SSH_PORT),
            private_key: None,
        }
    }

    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = PortSetting::Number(port);
        self
    }
}

/// Store reached through a single connection string
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStringConfig {
    #[serde(rename = "connectionString")]
    pub connection_string: String,
    pub in_vpc: bool,
    pub tunnel: Option<TunnelConfig>,
}

/// Store reached through discrete connection fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscreteConfig {
    pub host: String,
    pub port: PortSetting,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl: SslMode,
    pub in_vpc: bool,
    pub tunnel: Option<TunnelConfig>,
}

impl DiscreteConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: PortSetting::Number(port),
            user: String::new(),
            password: String::new(),
            database: String::new(),
            ssl: SslMode::Disabled,
            in_vpc: false,
            tunnel: None,
        }
    }
}

/// Validated store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StoreConfig {
    ConnectionString(ConnectionStringConfig),
    Discrete(DiscreteConfig),
}

impl StoreConfig {
    pub fn from_connection_string(url: impl Into<String>) -> Self {
        StoreConfig::ConnectionString(ConnectionStringConfig {
            connection_string: url.into(),
            in_vpc: false,
            tunnel: None,
        })
    }

    pub fn discrete(host: impl Into<String>, port: u16) -> Self {
        StoreConfig::Discrete(DiscreteConfig::new(host, port))
    }

    pub fn with_tunnel(mut self, tunnel: TunnelConfig) -> Self {
        match &mut self {
            StoreConfig::ConnectionString(cfg) => cfg.tunnel = Some(tunnel),
            StoreConfig::Discrete(cfg) => cfg.tunnel = Some(tunnel),
        }
        self
    }

    pub fn in_vpc(&self) -> bool {
        match self {
            StoreConfig::ConnectionString(cfg) => cfg.in_vpc,
            StoreConfig::Discrete(cfg) => cfg.in_vpc,
        }
    }

    pub fn tunnel(&self) -> Option<&TunnelConfig> {
        match self {
            StoreConfig::ConnectionString(cfg) => cfg.tunnel.as_ref(),
            StoreConfig::Discrete(cfg) => cfg.tunnel.as_ref(),
        }
    }

    /// Drop the tunnel settings (store is reached directly)
    pub fn strip_tunnel(&mut self) {
        match self {
            StoreConfig::ConnectionString(cfg) => cfg.tunnel = None,
            StoreConfig::Discrete(cfg) => cfg.tunnel = None,
        }
    }

    pub fn connection_string(&self) -> Option<&str> {
        match self {
            StoreConfig::ConnectionString(cfg) => Some(&cfg.connection_string),
            StoreConfig::Discrete(_) => None,
        }
    }
}
