//! Backend for local inference servers that expose an OpenAI-compatible
//! chat completions endpoint (llama.cpp server, vllm, text-generation-
//! inference, Ollama's `/v1` shim).
//!
//! Authentication is optional — most local servers run without API keys.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::adapter::{Adapter, AdapterError, ChatMessage, Completion, Result};

pub struct LocalAdapter {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl LocalAdapter {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
        }
    }

    /// Attach a bearer token for servers started with an API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty() && key != "none").then_some(key);
        self
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.endpoint.trim_end_matches('/')
        )
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    model: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl LocalAdapter {
    async fn complete(&self, api_messages: Vec<serde_json::Value>) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
        });

        let mut req = self.client.post(self.chat_url()).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout
            } else if e.is_connect() {
                AdapterError::Connection(format!(
                    "cannot connect to local inference server at {}: {}",
                    self.endpoint, e
                ))
            } else {
                AdapterError::Connection(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Api { status, message });
        }

        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        let choice = api
            .choices
            .first()
            .ok_or_else(|| AdapterError::Parse("no choices in response".into()))?;

        let usage = api.usage.as_ref();
        let tokens = usage.and_then(|u| u.prompt_tokens).unwrap_or(0)
            + usage.and_then(|u| u.completion_tokens).unwrap_or(0);

        Ok(Completion {
            content: choice.message.content.clone().unwrap_or_default(),
            model: api.model.unwrap_or_else(|| self.model.clone()),
            tokens,
        })
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &str {
        "local"
    }

    async fn generate(&self, prompt: &str) -> Result<Completion> {
        self.complete(vec![serde_json::json!({
            "role": "user",
            "content": prompt,
        })])
        .await
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let api_messages = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.to_string(),
                    "content": m.content,
                })
            })
            .collect();
        self.complete(api_messages).await
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/v1/models", self.endpoint.trim_end_matches('/'));
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_filtering() {
        let a = LocalAdapter::new("http://localhost:8000", "m").with_api_key("");
        assert!(a.api_key.is_none());
        let b = LocalAdapter::new("http://localhost:8000", "m").with_api_key("none");
        assert!(b.api_key.is_none());
        let c = LocalAdapter::new("http://localhost:8000", "m").with_api_key("sk-x");
        assert_eq!(c.api_key.as_deref(), Some("sk-x"));
    }

    #[test]
    fn response_with_missing_usage_parses() {
        let api: ApiResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "ok"}}], "model": null, "usage": null}"#,
        )
        .unwrap();
        assert_eq!(api.choices[0].message.content.as_deref(), Some("ok"));
        assert!(api.usage.is_none());
    }
}
