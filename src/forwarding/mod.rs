//! Port Forwarding Module
//!
//! SSH tunnels for stores that sit behind a bastion host: a local listener per
//! tunnel, forwarded to the store through a direct-tcpip channel.

mod local;
mod ports;
mod tunnel;

pub use local::{start_local_forward, LocalForwardHandle};
pub use ports::{PortRegistry, PortReservation, TUNNEL_BASE_PORT};
pub use tunnel::{
    ForwardRequest, ForwardSession, ForwardTransport, SshForwardTransport, TunnelHandle,
    TunnelManager, TUNNEL_MAX_ATTEMPTS,
};
