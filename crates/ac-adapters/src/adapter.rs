use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by a language-model adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Connection-level failure (DNS, refused, TLS).
    #[error("connection error: {0}")]
    Connection(String),

    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The backend answered with a non-success status.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The response body could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),

    /// The operation is not supported by this backend.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else if err.is_connect() {
            AdapterError::Connection(err.to_string())
        } else {
            AdapterError::Connection(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Tool description for backends that support tool calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Completion content plus token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub tokens: u64,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Async contract every language-model backend implements.
///
/// `chat_with_tools` has a default body returning
/// [`AdapterError::Unsupported`]; only backends with native tool calling
/// override it.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Human-readable backend name (used by the registry and in logs).
    fn name(&self) -> &str;

    /// One-shot completion from a single prompt.
    async fn generate(&self, prompt: &str) -> Result<Completion>;

    /// Multi-turn completion.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<Completion>;

    /// Multi-turn completion with tool definitions.
    async fn chat_with_tools(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<Completion> {
        Err(AdapterError::Unsupported(format!(
            "{} does not support tool calling",
            self.name()
        )))
    }

    /// Cheap availability probe; `false` means requests will fail fast.
    async fn is_available(&self) -> bool;
}
