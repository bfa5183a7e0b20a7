//! Conversation backend contract.
//!
//! The bridge only needs two operations from the service behind it: open a
//! conversation, and send a prompt into one and wait for the reply text.

use async_trait::async_trait;
use thiserror::Error;

/// Opaque id of a conversation on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationHandle(String);

impl ConversationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend transport error: {0}")]
    Transport(String),

    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend response invalid: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<ConversationHandle, BackendError>;

    /// Reply text; may be empty.
    async fn send_prompt(
        &self,
        conversation: &ConversationHandle,
        text: &str,
    ) -> Result<String, BackendError>;
}
