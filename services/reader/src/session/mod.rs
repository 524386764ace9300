pub mod orchestrator;
pub mod protocol;
pub mod state;

pub use orchestrator::{SessionConfig, SessionNotification, SessionOrchestrator, SessionPorts};
pub use state::{reduce, Effect, SessionEvent, Transition};
