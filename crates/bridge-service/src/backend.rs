use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde_json::{json, Value};

use bridge_core::{BackendError, ConversationBackend, ConversationHandle};

/// HTTP client for an OpenCode-style conversation service.
///
/// - `POST {base}/session {"title"}` → `{"id"}`
/// - `POST {base}/session/{id}/message {"parts":[{"type":"text","text"}]}` →
///   `{"parts":[…]}`
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nostr-dm-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let req = self.client.post(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl ConversationBackend for ApiClient {
    async fn create_conversation(&self, title: &str) -> Result<ConversationHandle, BackendError> {
        let res = self
            .post("/session")
            .json(&json!({ "title": title }))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let body = read_json(res).await?;
        body.get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(ConversationHandle::new)
            .ok_or_else(|| BackendError::InvalidResponse("session response has no id".into()))
    }

    async fn send_prompt(
        &self,
        conversation: &ConversationHandle,
        text: &str,
    ) -> Result<String, BackendError> {
        let res = self
            .post(&format!("/session/{}/message", conversation))
            .json(&json!({ "parts": [{ "type": "text", "text": text }] }))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let body = read_json(res).await?;
        Ok(extract_reply_text(&body))
    }
}

async fn read_json(res: Response) -> Result<Value, BackendError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    res.json()
        .await
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))
}

/// Join the `text` parts of a reply with newlines. Other part types (tool
/// calls, reasoning, …) are skipped.
pub fn extract_reply_text(body: &Value) -> String {
    body.get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
