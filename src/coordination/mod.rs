//! Cross-task coordination: engine phase tracking and OS signal wiring.

pub mod shutdown;

pub use shutdown::{install_signal_handlers, EnginePhase, ShutdownController, ShutdownToken};
