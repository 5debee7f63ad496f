//! In-process message bus for autocrew agents.
//!
//! Typed fan-in/fan-out with one FIFO queue per recipient, a poll-with-
//! timeout surface, and per-run file persistence that gives at-least-once
//! delivery within a single run.

pub mod bus;
pub mod message;

pub use bus::{BusError, MessageBus, DEFAULT_POLL_TIMEOUT};
pub use message::{AgentMessage, MessageKind};
