//! Wire protocol and broker connectivity: line-delimited JSON framing, the
//! `$`-tagged message schema, and the TCP client that implements the
//! engine's transport seam.

pub mod client;
pub mod framing;
pub mod wire;

pub use client::BrokerClient;
pub use framing::{read_frame, write_frame, FrameConfig, FrameError};
pub use wire::{decode, encode, Message, WireError};
