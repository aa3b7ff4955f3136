//! SSH module - authenticated sessions to tunnel intermediaries
//!
//! Uses the russh library. The session handle is owned by a single task
//! (see `handle_owner`); local forwards talk to it through a controller.

mod client;
mod error;
mod handle_owner;

pub use client::{connect_with_key, fingerprint, ClientHandler, SshTarget};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
