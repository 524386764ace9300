pub mod adapters;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod streaming;
