pub mod buffer;

pub use buffer::{BufferConfig, BufferEvent, StreamBuffer};
