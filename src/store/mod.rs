//! Key-value stores
//!
//! Backend seam (`Driver`/`Connection`), the timeout-guarded dispatcher, the
//! adapter capability interface and the registry of named stores.

mod adapter;
mod connection;
mod dispatcher;
mod memory;
mod registry;
mod reply;
pub mod resp;

pub use adapter::{Adapter, AdapterFactory, AdapterOptions, DriverFactory, KvStore};
pub use connection::{ready, Connection, Driver, PendingReply, Request};
pub use dispatcher::{CommandDispatcher, Keys};
pub use memory::{MemoryConnection, MemoryDriver, MEMORY_COMMANDS};
pub use registry::{StoreRegistry, DEFAULT_ADAPTER, MAIN_STORE};
pub use reply::Reply;
pub use resp::{RespConnection, RespDriver, RESP_COMMANDS};
