//! Language-model adapter layer for autocrew.
//!
//! Defines the [`Adapter`] trait the decomposer, manager and merger speak,
//! plus concrete backends (Ollama native API, OpenAI-compatible local
//! servers), a scripted mock for tests, and the explicitly constructed
//! [`registry::AdapterRegistry`] that replaces any process-wide default.

pub mod adapter;
pub mod local;
pub mod mock;
pub mod ollama;
pub mod registry;

pub use adapter::{Adapter, AdapterError, ChatMessage, ChatRole, Completion, ToolSpec};
pub use mock::MockAdapter;
pub use registry::AdapterRegistry;
