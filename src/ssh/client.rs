//! SSH Client implementation using russh
//!
//! Opens an authenticated SSH session to the tunnel intermediary. Only
//! public-key authentication with in-memory key material is used.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::error::SshError;

/// SSH intermediary to authenticate against
#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// PEM/OpenSSH private key material
    pub private_key: Arc<String>,
    pub timeout: Duration,
}

/// Connect and authenticate, returning the session handle
pub async fn connect_with_key(target: &SshTarget) -> Result<Handle<ClientHandler>, SshError> {
    let addr = format!("{}:{}", target.host, target.port);

    info!("Connecting to SSH server at {}", addr);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
        .next()
        .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler::new(target.host.clone(), target.port);

    let mut handle = tokio::time::timeout(
        target.timeout,
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

    debug!("SSH handshake completed");

    let key = russh::keys::decode_secret_key(&target.private_key, None)
        .map_err(|e| SshError::KeyError(e.to_string()))?;
    let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

    let authenticated = handle
        .authenticate_publickey(&target.username, key_with_hash)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(
            "Authentication rejected by server".to_string(),
        ));
    }

    info!("SSH authentication successful as \"{}\"", target.username);
    Ok(handle)
}

/// SHA256 fingerprint in OpenSSH format
pub fn fingerprint(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Client handler for russh callbacks
///
/// Tunnel intermediaries are trusted on connect; the host key fingerprint is
/// logged so it can be audited.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{} accepted (fingerprint: {})",
            self.host,
            self.port,
            fingerprint(server_public_key)
        );
        Ok(true)
    }
}
