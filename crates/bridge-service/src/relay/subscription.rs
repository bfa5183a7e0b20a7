//! Merged inbound stream.
//!
//! Every endpoint feeds the same channel. The first copy of an event id wins;
//! later copies from slower relays are dropped. The seen-set is bounded so a
//! long-running subscription does not grow without limit.

use std::collections::{HashSet, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::endpoint::EndpointHandle;
use super::RelayEvent;

const SEEN_CAPACITY: usize = 10_000;

pub struct Subscription {
    id: String,
    events: mpsc::Receiver<RelayEvent>,
    endpoints: Vec<EndpointHandle>,
    seen: SeenIds,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        events: mpsc::Receiver<RelayEvent>,
        endpoints: Vec<EndpointHandle>,
    ) -> Self {
        Self {
            id,
            events,
            endpoints,
            seen: SeenIds::new(SEEN_CAPACITY),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event not seen before. `None` once closed, or once every
    /// endpoint has dropped the subscription.
    pub async fn next(&mut self) -> Option<RelayEvent> {
        loop {
            if self.closed {
                return None;
            }
            let delivered = self.events.recv().await?;
            if self.seen.insert(&delivered.event.id) {
                return Some(delivered);
            }
            trace!(relay = %delivered.relay, event_id = %delivered.event.id, "Duplicate event");
        }
    }

    /// Stop delivery, then `CLOSE` on every relay. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        for ep in &self.endpoints {
            ep.unsubscribe(&self.id).await;
        }
        debug!(subscription = %self.id, "Subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        for ep in &self.endpoints {
            ep.unsubscribe_now(&self.id);
        }
    }
}

/// Insertion-ordered set that forgets its oldest entries past `capacity`.
struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// `true` if `id` was not already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}
