//! SSH tunnels
//!
//! `TunnelManager` picks a local port, asks a `ForwardTransport` to open a
//! forwarding session on it and retries on the next port while the transport
//! reports the address as taken.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::local::{start_local_forward, LocalForwardHandle};
use super::ports::{PortRegistry, PortReservation, TUNNEL_BASE_PORT};
use crate::config::TunnelSettings;
use crate::error::KvError;
use crate::ssh::{connect_with_key, spawn_handle_owner_task, HandleController, SshError, SshTarget};

/// Attempts made before giving up on finding a free local port
pub const TUNNEL_MAX_ATTEMPTS: u32 = 100;

const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a transport needs to open one forwarding session
#[derive(Clone)]
pub struct ForwardRequest {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub private_key: Arc<String>,
}

/// A live forwarding session
pub trait ForwardSession: Send + Sync {
    /// Release the session; must tolerate repeated calls
    fn close(&self);
}

/// Opens forwarding sessions on a given local port
#[async_trait]
pub trait ForwardTransport: Send + Sync {
    /// Fails with an address-in-use error when `local_port` is taken
    async fn open(&self, request: &ForwardRequest) -> Result<Box<dyn ForwardSession>, SshError>;
}

/// Forwarding over a russh session with a local TCP listener
pub struct SshForwardTransport {
    connect_timeout: Duration,
}

impl SshForwardTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SshForwardTransport {
    fn default() -> Self {
        Self::new(DEFAULT_SSH_TIMEOUT)
    }
}

struct SshForwardSession {
    forward: LocalForwardHandle,
    controller: HandleController,
}

impl ForwardSession for SshForwardSession {
    fn close(&self) {
        self.forward.stop();
        self.controller.disconnect();
    }
}

#[async_trait]
impl ForwardTransport for SshForwardTransport {
    async fn open(&self, request: &ForwardRequest) -> Result<Box<dyn ForwardSession>, SshError> {
        let listener = TcpListener::bind(("127.0.0.1", request.local_port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => SshError::AddrInUse(request.local_port),
                _ => SshError::ConnectionFailed(format!(
                    "Failed to bind to 127.0.0.1:{}: {}",
                    request.local_port, e
                )),
            })?;

        let target = SshTarget {
            host: request.ssh_host.clone(),
            port: request.ssh_port,
            username: request.ssh_user.clone(),
            private_key: request.private_key.clone(),
            timeout: self.connect_timeout,
        };
        let handle = connect_with_key(&target).await?;
        let controller = spawn_handle_owner_task(
            handle,
            format!("{}@{}:{}", request.ssh_user, request.ssh_host, request.ssh_port),
        );

        let forward = match start_local_forward(
            listener,
            controller.clone(),
            request.remote_host.clone(),
            request.remote_port,
        ) {
            Ok(forward) => forward,
            Err(e) => {
                controller.disconnect();
                return Err(e);
            }
        };

        Ok(Box::new(SshForwardSession {
            forward,
            controller,
        }))
    }
}

/// An open tunnel; exclusively owned by the connection that created it
pub struct TunnelHandle {
    local_port: u16,
    session: Box<dyn ForwardSession>,
    ports: Arc<PortRegistry>,
    closed: AtomicBool,
}

impl TunnelHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Untrack the port and release the session; later calls are no-ops
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ports.release(self.local_port);
        self.session.close();
        debug!("Closed SSH tunnel on local port {}", self.local_port);
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("local_port", &self.local_port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens tunnels and tracks the local ports they hold
pub struct TunnelManager {
    transport: Arc<dyn ForwardTransport>,
    ports: Arc<PortRegistry>,
    base_port: u16,
    max_attempts: u32,
}

impl TunnelManager {
    pub fn new(transport: Arc<dyn ForwardTransport>, ports: Arc<PortRegistry>) -> Self {
        Self {
            transport,
            ports,
            base_port: TUNNEL_BASE_PORT,
            max_attempts: TUNNEL_MAX_ATTEMPTS,
        }
    }

    /// Manager backed by russh with its own port registry
    pub fn ssh() -> Self {
        Self::new(
            Arc::new(SshForwardTransport::default()),
            Arc::new(PortRegistry::new()),
        )
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    /// Open a tunnel for resolved tunnel settings
    pub async fn open_for(
        &self,
        remote_host: &str,
        remote_port: u16,
        tunnel: &TunnelSettings,
    ) -> Result<TunnelHandle, KvError> {
        self.open(
            remote_host,
            remote_port,
            &tunnel.private_key,
            &tunnel.user,
            &tunnel.host,
            tunnel.port,
        )
        .await
    }

    /// Forward a local port to `remote_host:remote_port` via `ssh_user@ssh_host:ssh_port`
    pub async fn open(
        &self,
        remote_host: &str,
        remote_port: u16,
        private_key: &str,
        ssh_user: &str,
        ssh_host: &str,
        ssh_port: u16,
    ) -> Result<TunnelHandle, KvError> {
        info!("Attempting to create SSH tunnel ...");
        info!("From: \"localhost\"");
        info!("Via:  \"{}@{}:{}\"", ssh_user, ssh_host, ssh_port);
        info!("To:   \"{}:{}\"", remote_host, remote_port);

        let mut reservation = PortReservation::acquire(&self.ports, self.base_port)
            .ok_or(KvError::TunnelExhausted {
                attempts: 0,
                first_port: self.base_port,
            })?;
        let first_port = reservation.port();
        let mut request = ForwardRequest {
            local_port: first_port,
            remote_host: remote_host.to_string(),
            remote_port,
            ssh_user: ssh_user.to_string(),
            ssh_host: ssh_host.to_string(),
            ssh_port,
            private_key: Arc::new(private_key.to_string()),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            request.local_port = reservation.port();

            match self.transport.open(&request).await {
                Ok(session) => {
                    let local_port = reservation.keep();
                    info!(
                        "Created SSH tunnel from \"localhost:{}\" to \"{}:{}\"",
                        local_port, remote_host, remote_port
                    );
                    return Ok(TunnelHandle {
                        local_port,
                        session,
                        ports: self.ports.clone(),
                        closed: AtomicBool::new(false),
                    });
                }
                Err(e) if e.is_addr_in_use() => {
                    debug!("Local port {} in use, trying next", request.local_port);
                    if attempts >= self.max_attempts {
                        break;
                    }
                    let next = request
                        .local_port
                        .checked_add(1)
                        .and_then(|start| PortReservation::acquire(&self.ports, start));
                    match next {
                        Some(next) => reservation = next,
                        None => break,
                    }
                }
                Err(e) => {
                    warn!("SSH tunnel failed: {}", e);
                    return Err(KvError::TunnelError(format!(
                        "Could not connect to \"{}:{}\" via SSH tunnel \"{}@{}:{}\": {}",
                        remote_host, remote_port, ssh_user, ssh_host, ssh_port, e
                    )));
                }
            }
        }

        warn!("Could not create SSH tunnel after {} attempts", attempts);
        Err(KvError::TunnelExhausted {
            attempts,
            first_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    /// Transport that fails on busy ports and records what it was asked
    #[derive(Default)]
    struct FakeTransport {
        pub busy: Mutex<HashSet<u16>>,
        pub fail_with: Mutex<Option<String>>,
        pub requests: Mutex<Vec<u16>>,
        pub closes: Arc<AtomicUsize>,
    }

    struct FakeSession {
        closes: Arc<AtomicUsize>,
    }

    impl ForwardSession for FakeSession {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ForwardTransport for FakeTransport {
        async fn open(&self, request: &ForwardRequest) -> Result<Box<dyn ForwardSession>, SshError> {
            self.requests.lock().push(request.local_port);
            if let Some(message) = self.fail_with.lock().clone() {
                return Err(SshError::AuthenticationFailed(message));
            }
            if self.busy.lock().contains(&request.local_port) {
                return Err(SshError::AddrInUse(request.local_port));
            }
            Ok(Box::new(FakeSession {
                closes: self.closes.clone(),
            }))
        }
    }

    fn manager(transport: Arc<FakeTransport>) -> TunnelManager {
        TunnelManager::new(transport, Arc::new(PortRegistry::new()))
    }

    async fn open(manager: &TunnelManager) -> Result<TunnelHandle, KvError> {
        manager
            .open("db.internal", 6379, "key", "deploy", "bastion", 22)
            .await
    }

    #[tokio::test]
    async fn test_first_tunnel_uses_base_port() {
        let transport = Arc::new(FakeTransport::default());
        let manager = manager(transport.clone());
        let handle = open(&manager).await.unwrap();
        assert_eq!(handle.local_port(), TUNNEL_BASE_PORT);
        assert!(manager.ports().is_tracked(TUNNEL_BASE_PORT));
    }

    #[tokio::test]
    async fn test_tracked_port_is_skipped() {
        let transport = Arc::new(FakeTransport::default());
        let manager = manager(transport.clone());
        let first = open(&manager).await.unwrap();
        let second = open(&manager).await.unwrap();
        assert_ne!(first.local_port(), second.local_port());
        assert_eq!(*transport.requests.lock(), vec![TUNNEL_BASE_PORT, TUNNEL_BASE_PORT + 1]);
    }

    #[tokio::test]
    async fn test_retries_on_addr_in_use() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .busy
            .lock()
            .extend([TUNNEL_BASE_PORT, TUNNEL_BASE_PORT + 1]);
        let manager = manager(transport.clone());

        let handle = open(&manager).await.unwrap();
        assert_eq!(handle.local_port(), TUNNEL_BASE_PORT + 2);
        assert_eq!(manager.ports().tracked(), vec![TUNNEL_BASE_PORT + 2]);
        assert_eq!(transport.requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausts_retry_budget() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .busy
            .lock()
            .extend(TUNNEL_BASE_PORT..TUNNEL_BASE_PORT + 10);
        let manager = manager(transport.clone()).with_max_attempts(3);

        let err = open(&manager).await.unwrap_err();
        match err {
            KvError::TunnelExhausted {
                attempts,
                first_port,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(first_port, TUNNEL_BASE_PORT);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(manager.ports().is_empty());
    }

    #[tokio::test]
    async fn test_other_failures_propagate_immediately() {
        let transport = Arc::new(FakeTransport::default());
        *transport.fail_with.lock() = Some("denied".into());
        let manager = manager(transport.clone());

        let err = open(&manager).await.unwrap_err();
        assert!(matches!(err, KvError::TunnelError(ref m) if m.contains("deploy@bastion:22")));
        assert_eq!(transport.requests.lock().len(), 1);
        assert!(manager.ports().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(FakeTransport::default());
        let manager = manager(transport.clone());
        let handle = open(&manager).await.unwrap();
        let port = handle.local_port();

        handle.close();
        assert!(!manager.ports().is_tracked(port));
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

        // a port reused by another tunnel must survive the stale handle's close
        let other = open(&manager).await.unwrap();
        assert_eq!(other.local_port(), port);
        handle.close();
        drop(handle);
        assert!(manager.ports().is_tracked(port));
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_closes_tunnel() {
        let transport = Arc::new(FakeTransport::default());
        let manager = manager(transport.clone());
        drop(open(&manager).await.unwrap());
        assert!(manager.ports().is_empty());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    fn ssh_request(local_port: u16, ssh_port: u16) -> ForwardRequest {
        ForwardRequest {
            local_port,
            remote_host: "db.internal".into(),
            remote_port: 6379,
            ssh_user: "deploy".into(),
            ssh_host: "127.0.0.1".into(),
            ssh_port,
            private_key: Arc::new("not a key".into()),
        }
    }

    #[tokio::test]
    async fn test_ssh_transport_reports_bound_port_as_in_use() {
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();
        let transport = SshForwardTransport::new(Duration::from_secs(1));

        match transport.open(&ssh_request(port, 22)).await {
            Err(SshError::AddrInUse(busy)) => assert_eq!(busy, port),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bound port was reused"),
        }
    }

    #[tokio::test]
    async fn test_ssh_transport_other_failures_are_not_in_use() {
        let free = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let local_port = free.local_addr().unwrap().port();
        let closed = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let ssh_port = closed.local_addr().unwrap().port();
        drop(free);
        drop(closed);
        let transport = SshForwardTransport::new(Duration::from_secs(1));

        match transport.open(&ssh_request(local_port, ssh_port)).await {
            Err(e) => assert!(!e.is_addr_in_use(), "{}", e),
            Ok(_) => panic!("no SSH server is listening"),
        }
    }
}
