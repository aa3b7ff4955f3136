//! Local Port Forwarding
//!
//! Forwards connections from a bound local port to a remote host:port through
//! SSH. This is the data path behind every tunnel.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ssh::{HandleController, SshError};

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    /// Bound local address
    pub bound_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
}

impl LocalForwardHandle {
    /// Signal the forward loop to stop; in-flight connections finish on their own
    pub fn stop(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        info!("Stopping local port forward on {}", self.bound_addr);
    }
}

/// Start local port forwarding on an already bound listener.
///
/// Spawns a task that accepts local connections and bridges each one to a
/// direct-tcpip channel opened through `handle_controller`. The task ends when
/// stopped or when the SSH session goes away, and then disconnects the session.
pub fn start_local_forward(
    listener: TcpListener,
    handle_controller: HandleController,
    remote_host: String,
    remote_port: u16,
) -> Result<LocalForwardHandle, SshError> {
    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, remote_host, remote_port
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut disconnect_rx = handle_controller.subscribe_disconnect();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("Local port forward stopped: SSH disconnected");
                    break;
                }

                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        info!("Local port forward stopped by request");
                        break;
                    }
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("Accepted connection from {} for forward", peer_addr);

                            let controller = handle_controller.clone();
                            let remote_host = remote_host.clone();

                            tokio::spawn(async move {
                                let result = handle_forward_connection(
                                    controller,
                                    stream,
                                    &remote_host,
                                    remote_port,
                                )
                                .await;

                                if let Err(e) = result {
                                    warn!("Forward connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        handle_controller.disconnect();
        info!("Local port forward task exited");
    });

    Ok(LocalForwardHandle { bound_addr, stop_tx })
}

/// Bridge a single local connection to the remote endpoint
async fn handle_forward_connection(
    handle_controller: HandleController,
    mut local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), SshError> {
    let channel = handle_controller
        .open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
        .await?;

    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    let mut channel_stream = channel.into_stream();
    let (sent, received) =
        tokio::io::copy_bidirectional(&mut local_stream, &mut channel_stream).await?;

    debug!("Forward connection closed ({} bytes out, {} bytes in)", sent, received);
    Ok(())
}
