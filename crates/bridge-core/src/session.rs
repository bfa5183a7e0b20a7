//! Sender → conversation session table.
//!
//! # Lifetime
//! A session starts on the first message from a sender, is refreshed by
//! every later message and reply, and ends once it has been idle for the
//! store's TTL (`now - last_activity >= ttl`). Expired sessions are dropped
//! lazily on lookup and in bulk by `cleanup_expired`, which the service runs
//! on a timer so senders who never return do not pin memory.
//!
//! # Concurrency
//! Session data sits behind one `parking_lot::Mutex` that is never held
//! across an await. Creating a conversation is slow (a backend round trip),
//! so each sender also gets an async gate: concurrent `get_or_create` calls
//! for the same sender queue on it, and only the first one runs `create`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use dm_crypto::PublicIdentity;

use crate::backend::ConversationHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub sender: PublicIdentity,
    pub conversation: ConversationHandle,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= ttl
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

pub struct SessionStore {
    ttl: Duration,
    slots: Mutex<HashMap<PublicIdentity, Slot>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the sender's live conversation, refreshing its activity, or
    /// run `create` and store a new session.
    ///
    /// A `create` failure is returned unchanged and nothing is stored.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        sender: &PublicIdentity,
        create: F,
    ) -> Result<ConversationHandle, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConversationHandle, E>>,
    {
        let gate = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(*sender).or_default();
            if let Some(handle) = self.resume(sender, slot) {
                return Ok(handle);
            }
            Arc::clone(&slot.gate)
        };

        let _creating = gate.lock().await;

        // Whoever held the gate before us may have created it already.
        let resumed = {
            let mut slots = self.slots.lock();
            slots
                .get_mut(sender)
                .and_then(|slot| self.resume(sender, slot))
        };
        if let Some(handle) = resumed {
            return Ok(handle);
        }

        let conversation = create().await?;

        let now = Instant::now();
        debug!(sender = %sender.short(), conversation = %conversation, "Session created");
        self.slots.lock().entry(*sender).or_default().session = Some(Session {
            sender: *sender,
            conversation: conversation.clone(),
            created_at: now,
            last_activity: now,
        });
        Ok(conversation)
    }

    /// Refresh a live session or drop an expired one.
    fn resume(&self, sender: &PublicIdentity, slot: &mut Slot) -> Option<ConversationHandle> {
        let now = Instant::now();
        match slot.session.as_mut() {
            Some(session) if !session.is_expired(now, self.ttl) => {
                session.last_activity = now;
                Some(session.conversation.clone())
            }
            Some(_) => {
                debug!(sender = %sender.short(), "Session expired");
                slot.session = None;
                None
            }
            None => None,
        }
    }

    /// Mark activity now. No-op when the sender has no session.
    pub fn touch(&self, sender: &PublicIdentity) {
        if let Some(session) = self
            .slots
            .lock()
            .get_mut(sender)
            .and_then(|slot| slot.session.as_mut())
        {
            session.last_activity = Instant::now();
        }
    }

    /// The sender's live session, if any.
    pub fn get(&self, sender: &PublicIdentity) -> Option<Session> {
        let now = Instant::now();
        self.slots
            .lock()
            .get(sender)
            .and_then(|slot| slot.session.as_ref())
            .filter(|s| !s.is_expired(now, self.ttl))
            .cloned()
    }

    /// Every stored session, expired or not.
    pub fn snapshot(&self) -> Vec<Session> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| slot.session.clone())
            .collect()
    }

    /// Remove every session idle for at least the TTL. Returns how many
    /// sessions were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.slots.lock().retain(|_, slot| {
            if let Some(session) = &slot.session {
                if session.is_expired(now, self.ttl) {
                    slot.session = None;
                    removed += 1;
                }
            }
            // Keep empty slots whose gate is held by an in-flight create.
            slot.session.is_some() || Arc::strong_count(&slot.gate) > 1
        });
        removed
    }

    /// Number of stored sessions, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.session.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_crypto::KeyMaterial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sender() -> PublicIdentity {
        *KeyMaterial::generate().public()
    }

    async fn fixed(id: &str) -> Result<ConversationHandle, ()> {
        Ok(ConversationHandle::new(id))
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_lifetime() {
        let store = SessionStore::new(Duration::from_millis(1000));
        let s = sender();

        store.get_or_create(&s, || fixed("conv-1")).await.unwrap();
        tokio::time::advance(Duration::from_millis(900)).await;
        store.touch(&s);
        tokio::time::advance(Duration::from_millis(900)).await;

        assert_eq!(store.get(&s).unwrap().conversation.as_str(), "conv-1");
    }

    #[tokio::test(start_paused = true)]
    async fn touch_without_session_is_noop() {
        let store = SessionStore::new(Duration::from_secs(1));
        store.touch(&sender());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_boundary_is_inclusive() {
        let store = SessionStore::new(Duration::from_millis(1000));
        let s = sender();

        store.get_or_create(&s, || fixed("conv-1")).await.unwrap();
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(store.get(&s).is_some());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get(&s).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_stores_nothing() {
        let store = SessionStore::new(Duration::from_secs(60));
        let s = sender();

        let err = store
            .get_or_create(&s, || async { Err::<ConversationHandle, _>("backend down") })
            .await
            .unwrap_err();
        assert_eq!(err, "backend down");
        assert!(store.get(&s).is_none());

        let calls = AtomicUsize::new(0);
        let handle = store
            .get_or_create(&s, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                fixed("conv-1").await
            })
            .await
            .unwrap();
        assert_eq!(handle.as_str(), "conv-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_empty_slots() {
        let store = SessionStore::new(Duration::from_secs(1));
        let s = sender();
        let _ = store
            .get_or_create(&s, || async { Err::<ConversationHandle, _>(()) })
            .await;
        assert_eq!(store.cleanup_expired(), 0);
        assert!(store.slots.lock().is_empty());
    }
}
