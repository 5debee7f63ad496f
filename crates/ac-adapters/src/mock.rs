//! A scripted adapter for tests.
//!
//! Returns pre-configured completions in FIFO order; an empty queue yields
//! a default completion. Requests are captured for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::adapter::{Adapter, AdapterError, ChatMessage, Completion, Result};

pub struct MockAdapter {
    responses: Arc<Mutex<VecDeque<Result<Completion>>>>,
    captured_prompts: Arc<Mutex<Vec<String>>>,
    available: bool,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured_prompts: Arc::new(Mutex::new(Vec::new())),
            available: true,
        }
    }

    /// Queue a successful completion with the given content.
    pub fn with_content(self, content: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(Ok(Completion {
            content: content.into(),
            model: "mock".to_string(),
            tokens: 42,
        }));
        self
    }

    /// Queue a full completion.
    pub fn with_completion(self, completion: Completion) -> Self {
        self.responses.lock().unwrap().push_back(Ok(completion));
        self
    }

    /// Queue an error.
    pub fn with_error(self, error: AdapterError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// Make `is_available` answer `false`.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Prompts (or flattened chats) seen so far, in call order.
    pub fn captured_prompts(&self) -> Vec<String> {
        self.captured_prompts.lock().unwrap().clone()
    }

    fn next(&self, seen: String) -> Result<Completion> {
        self.captured_prompts.lock().unwrap().push(seen);
        let mut queue = self.responses.lock().unwrap();
        match queue.pop_front() {
            Some(r) => r,
            None => Ok(Completion {
                content: "mock response".to_string(),
                model: "mock".to_string(),
                tokens: 10,
            }),
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, prompt: &str) -> Result<Completion> {
        self.next(prompt.to_string())
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let flat = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.next(flat)
    }

    async fn is_available(&self) -> bool {
        self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_then_default() {
        let mock = MockAdapter::new().with_content("first");
        let r1 = mock.generate("p1").await.unwrap();
        assert_eq!(r1.content, "first");
        let r2 = mock.generate("p2").await.unwrap();
        assert_eq!(r2.content, "mock response");
    }

    #[tokio::test]
    async fn errors_pop_in_order() {
        let mock = MockAdapter::new()
            .with_error(AdapterError::Timeout)
            .with_content("recovered");
        assert!(matches!(
            mock.generate("p").await,
            Err(AdapterError::Timeout)
        ));
        assert_eq!(mock.generate("p").await.unwrap().content, "recovered");
    }

    #[tokio::test]
    async fn captures_chat_flattened() {
        let mock = MockAdapter::new();
        mock.chat(&[ChatMessage::system("sys"), ChatMessage::user("usr")])
            .await
            .unwrap();
        let captured = mock.captured_prompts();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].contains("system: sys"));
        assert!(captured[0].contains("user: usr"));
    }

    #[tokio::test]
    async fn availability_flag() {
        assert!(MockAdapter::new().is_available().await);
        assert!(!MockAdapter::new().unavailable().is_available().await);
    }

    #[tokio::test]
    async fn tool_calling_unsupported_by_default() {
        let mock = MockAdapter::new();
        let result = mock.chat_with_tools(&[], &[]).await;
        assert!(matches!(result, Err(AdapterError::Unsupported(_))));
    }
}
