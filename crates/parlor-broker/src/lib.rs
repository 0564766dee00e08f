//! The parlor broker: an append-only newline-delimited JSON log per room,
//! served over the framed wire protocol. The broker computes no state; it
//! stamps, stores, and fans out posts.

pub mod server;
pub mod store;

pub use server::{Broker, BrokerConfig};
pub use store::{LogRecord, RoomStore, StoreError};
