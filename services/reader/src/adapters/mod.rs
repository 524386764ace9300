pub mod clock;
pub mod http;
pub mod memory;
pub mod sink;
pub mod ws;

pub use clock::SimulatedClock;
pub use http::HttpChunkSource;
pub use memory::{MemoryConnection, MemoryServer, MemoryTransport};
pub use sink::LogSessionSink;
pub use ws::WsTransport;
