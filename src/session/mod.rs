//! Session Management Module
//!
//! Connection state machine for adapter instances:
//! - `ConnectionLifecycle` drives connect/close, consuming tunnels when configured
//! - `ReconnectPolicy` paces background redials after the first connect

mod lifecycle;
mod reconnect;
mod state;

pub use lifecycle::ConnectionLifecycle;
pub use reconnect::{ReconnectError, ReconnectPolicy};
pub use state::ConnectionState;
