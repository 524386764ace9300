//! services/reader/src/channel/mod.rs
//!
//! The duplex messaging channel between the reader and the server.

pub mod client;
pub mod message;

pub use client::{reconnect_delay, ChannelConfig, ChannelEvent, DuplexChannel};
pub use message::{kinds, Message};
