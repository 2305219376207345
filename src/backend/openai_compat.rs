//! OpenAI-Compatible Backend Adapter
//!
//! HTTP adapter for providers exposing an OpenAI-style chat-completions API
//! (ZhipuAI GLM, Baichuan, local Ollama in compatibility mode, and most
//! hosted gateways).
//!
//! # Wire Format
//!
//! - `POST {base_url}/chat/completions` with `model`, `messages`, `stream`
//! - non-streaming: `choices[0].message.content`
//! - streaming: SSE lines `data: {json}` carrying `choices[0].delta.content`,
//!   terminated by `data: [DONE]`

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{BackendIdentity, LmBackend, StreamFragment};

/// Default request timeout for backend HTTP calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Channel capacity for streamed fragments
const STREAM_BUFFER: usize = 100;

/// Backend adapter for OpenAI-compatible chat-completions APIs
pub struct OpenAiCompatBackend {
    identity: BackendIdentity,
    base_url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Create a new adapter.
    ///
    /// `base_url` is the API root up to and excluding `/chat/completions`.
    /// `api_key`, when present, is sent as a bearer token.
    pub fn new(
        identity: BackendIdentity,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            identity,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            http_client,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": stream,
        })
    }

    async fn post(&self, prompt: &str, stream: bool) -> anyhow::Result<reqwest::Response> {
        let mut request = self
            .http_client
            .post(self.completions_url())
            .json(&self.request_body(prompt, stream));

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {status}: {body}", self.identity);
        }

        Ok(response)
    }

    /// Extract the delta content from one SSE data line, if any
    fn delta_text(line: &str) -> Option<String> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload == "[DONE]" {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        value["choices"][0]["delta"]["content"]
            .as_str()
            .map(str::to_string)
    }
}

#[async_trait]
impl LmBackend for OpenAiCompatBackend {
    fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    async fn invoke(&self, prompt: &str) -> anyhow::Result<String> {
        let response = self.post(prompt, false).await?;
        let value: serde_json::Value = response.json().await?;

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("{}: response had no content", self.identity))
    }

    async fn stream(&self, prompt: &str) -> anyhow::Result<mpsc::Receiver<StreamFragment>> {
        let response = self.post(prompt, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();

            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        // Parse newline-delimited SSE events
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer = buffer[pos + 1..].to_string();

                            if line.contains("[DONE]") {
                                let _ = tx.send(StreamFragment::Complete).await;
                                return;
                            }

                            if let Some(text) = Self::delta_text(&line) {
                                if tx.send(StreamFragment::Text(text)).await.is_err() {
                                    // Receiver dropped, stop streaming
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(StreamFragment::Error(e.to_string())).await;
                        return;
                    }
                }
            }

            // Stream ended without a [DONE] marker
            let _ = tx.send(StreamFragment::Complete).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_text_extracts_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#;
        assert_eq!(OpenAiCompatBackend::delta_text(line), Some("hi".to_string()));
    }

    #[test]
    fn test_delta_text_ignores_done_and_noise() {
        assert_eq!(OpenAiCompatBackend::delta_text("data: [DONE]"), None);
        assert_eq!(OpenAiCompatBackend::delta_text(""), None);
        assert_eq!(OpenAiCompatBackend::delta_text(": keepalive"), None);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend = OpenAiCompatBackend::new(
            BackendIdentity::new("glm4", "glm-4"),
            "https://example.test/v1/",
            "glm-4",
            None,
        )
        .unwrap();
        assert_eq!(
            backend.completions_url(),
            "https://example.test/v1/chat/completions"
        );
    }
}
