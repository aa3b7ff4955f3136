//! RESP2 backend
//!
//! Speaks the Redis serialization protocol over plain TCP.

mod codec;
mod connection;

pub use codec::{decode, encode_reply, encode_request, MAX_BULK_SIZE, MAX_NESTING_DEPTH};
pub use connection::{RespConnection, RespDriver, RESP_COMMANDS};
