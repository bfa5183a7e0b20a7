//! Inbound DM → backend → reply.
//!
//! Per event:
//!
//! ```text
//! received → allowlist → decrypt → session → prompt → (reply empty?) → seal → publish → touch
//! ```
//!
//! Any failure ends processing of that one event. Other events, and the
//! subscription loop itself, are never affected.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use bridge_core::{Allowlist, BackendError, ConversationBackend, SessionStore};
use dm_crypto::{nip04, CryptoError, KeyMaterial, PublicIdentity};
use dm_proto::{Event, ProtoError, UnsignedEvent};

use crate::relay::{PublishError, RelayEvent, RelayPool, Subscription};

/// Where signed replies go.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// URL of the first relay to accept the event.
    async fn publish(&self, event: &Event) -> Result<String, PublishError>;
}

#[async_trait]
impl EventPublisher for RelayPool {
    async fn publish(&self, event: &Event) -> Result<String, PublishError> {
        RelayPool::publish(self, event).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Sender is not on the allowlist; nothing was decrypted.
    NotAllowed,
    /// Backend answered with nothing; no reply sent.
    EmptyReply,
    Replied { relay: String, event_id: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("decrypt failed: {0}")]
    Decrypt(#[source] CryptoError),

    #[error("backend failed: {0}")]
    Backend(#[from] BackendError),

    #[error("could not seal reply: {0}")]
    Sign(#[from] ProtoError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
}

pub struct Bridge<B, P> {
    identity: Arc<KeyMaterial>,
    allowlist: Allowlist,
    sessions: Arc<SessionStore>,
    backend: Arc<B>,
    publisher: Arc<P>,
}

impl<B, P> Bridge<B, P>
where
    B: ConversationBackend + 'static,
    P: EventPublisher + 'static,
{
    pub fn new(
        identity: Arc<KeyMaterial>,
        allowlist: Allowlist,
        sessions: Arc<SessionStore>,
        backend: Arc<B>,
        publisher: Arc<P>,
    ) -> Self {
        Self {
            identity,
            allowlist,
            sessions,
            backend,
            publisher,
        }
    }

    pub fn identity(&self) -> &PublicIdentity {
        self.identity.public()
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Run one inbound event through the whole pipeline.
    pub async fn handle(&self, event: &Event) -> Result<Outcome, PipelineError> {
        if !self.allowlist.permits_hex(&event.pubkey) {
            return Ok(Outcome::NotAllowed);
        }

        let sender = PublicIdentity::from_hex(&event.pubkey).map_err(PipelineError::Decrypt)?;
        let text = nip04::decrypt_str(&self.identity, &sender, &event.content)
            .map_err(PipelineError::Decrypt)?;
        info!(sender = %sender.short(), event_id = %event.id, "Direct message decrypted");
        debug!(sender = %sender.short(), content = %text, "Message content");

        let title = conversation_title(&sender);
        let conversation = self
            .sessions
            .get_or_create(&sender, || self.backend.create_conversation(&title))
            .await?;

        let reply = self.backend.send_prompt(&conversation, &text).await?;
        if reply.is_empty() {
            return Ok(Outcome::EmptyReply);
        }
        debug!(sender = %sender.short(), conversation = %conversation, reply = %reply, "Backend reply");

        let content = nip04::encrypt_to_string(&self.identity, &sender, &reply)
            .map_err(|e| PipelineError::Sign(e.into()))?;
        let signed =
            UnsignedEvent::direct_message(self.identity.public(), &sender, content).sign(&self.identity)?;

        let relay = self.publisher.publish(&signed).await?;
        self.sessions.touch(&sender);

        Ok(Outcome::Replied {
            relay,
            event_id: signed.id,
        })
    }

    /// Consume `subscription` until it ends or `shutdown` resolves. Each
    /// event runs in its own task.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut inflight: JoinSet<()> = JoinSet::new();

        enum Wake {
            Shutdown,
            Inbound(Option<RelayEvent>),
            Finished(Result<(), JoinError>),
        }

        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                next = subscription.next() => Wake::Inbound(next),
                Some(done) = inflight.join_next(), if !inflight.is_empty() => Wake::Finished(done),
            };

            match wake {
                Wake::Shutdown => {
                    info!("Shutdown requested; closing subscription");
                    break;
                }
                Wake::Inbound(None) => {
                    warn!("Subscription ended");
                    break;
                }
                Wake::Inbound(Some(delivered)) => {
                    let bridge = Arc::clone(&self);
                    inflight.spawn(async move { bridge.process(delivered).await });
                }
                Wake::Finished(Err(err)) if err.is_panic() => {
                    warn!(error = %err, "Message task panicked");
                }
                Wake::Finished(_) => {}
            }
        }

        subscription.close().await;
        if !inflight.is_empty() {
            debug!(count = inflight.len(), "Aborting in-flight messages");
        }
        inflight.shutdown().await;
    }

    async fn process(&self, delivered: RelayEvent) {
        let event = &delivered.event;
        let sender = event.pubkey.get(..8).unwrap_or(event.pubkey.as_str());
        debug!(relay = %delivered.relay, sender = %sender, event_id = %event.id, "Inbound event");

        match self.handle(event).await {
            Ok(Outcome::NotAllowed) => {
                debug!(sender = %sender, "Sender not on allowlist; ignored");
            }
            Ok(Outcome::EmptyReply) => {
                info!(sender = %sender, "Backend reply empty; not responding");
            }
            Ok(Outcome::Replied { relay, event_id }) => {
                info!(sender = %sender, relay = %relay, event_id = %event_id, "Reply published");
            }
            Err(err) => {
                warn!(sender = %sender, event_id = %event.id, error = %err, "Message dropped");
            }
        }
    }
}

/// `Nostr DM: <first 16 chars of npub>...`
pub fn conversation_title(sender: &PublicIdentity) -> String {
    let label = sender
        .to_npub()
        .map(|npub| npub.chars().take(16).collect::<String>())
        .unwrap_or_else(|_| sender.short());
    format!("Nostr DM: {label}...")
}
