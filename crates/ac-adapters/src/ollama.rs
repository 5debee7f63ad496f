//! Ollama backend speaking the native `/api/generate` and `/api/chat`
//! endpoints.
//!
//! The endpoint defaults to `http://localhost:11434` and is usually taken
//! from `OLLAMA_HOST` by the daemon's settings layer. Availability is
//! probed via `/api/tags`, which answers quickly whether or not a model is
//! loaded.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::adapter::{Adapter, AdapterError, ChatMessage, Completion, Result};

pub struct OllamaAdapter {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaAdapter {
    /// `endpoint` is the server base URL, e.g. `http://localhost:11434`.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120)) // local inference can be slow
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }
}

// Ollama reports token counts as eval counts rather than a usage object.
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(AdapterError::Api { status, message });
    }
    Ok(resp)
}

#[async_trait]
impl Adapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let api: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        Ok(Completion {
            content: api.response,
            model: self.model.clone(),
            tokens: api.prompt_eval_count + api.eval_count,
        })
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.to_string(),
                    "content": m.content,
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
            "stream": false,
        });

        let resp = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let api: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        Ok(Completion {
            content: api.message.content,
            model: self.model.clone(),
            tokens: api.prompt_eval_count + api.eval_count,
        })
    }

    async fn is_available(&self) -> bool {
        match self.client.get(self.url("/api/tags")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "ollama probe failed");
                false
            }
        }
    }
}
