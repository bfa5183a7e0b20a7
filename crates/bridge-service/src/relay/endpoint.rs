//! One actor per relay URL.
//!
//! The actor owns the endpoint's only link and all per-relay state:
//! subscriptions (with their advancing `since` cursor) and publishes waiting
//! for an `OK`. It connects lazily when it has work, drops the link once it
//! is idle, and after a connection loss reconnects on the backoff schedule
//! and re-issues every subscription from its cursor.
//!
//! Commands keep flowing while the actor waits out a backoff delay; a
//! publish that arrives then fails fast with `Disconnected` rather than
//! waiting for the link.
//!
//! The cursor never moves past the local clock, so an event stamped in the
//! future cannot hide later messages after a reconnect. A subscription the
//! relay `CLOSED` is parked and re-issued on the backoff schedule, unless the
//! reason is `auth-required:` or `restricted:`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use dm_proto::{ClientMessage, Event, Filter, RelayMessage};

use super::connector::{RelayConnector, RelayLink};
use super::{ReconnectPolicy, RelayError, RelayEvent};

const COMMAND_CAPACITY: usize = 64;

/// `CLOSED` reasons that re-issuing the same `REQ` cannot fix.
const PERMANENT_CLOSE_PREFIXES: [&str; 2] = ["auth-required:", "restricted:"];

type Ack = oneshot::Sender<Result<(), RelayError>>;

pub(crate) enum Command {
    Subscribe {
        id: String,
        filter: Filter,
        events: mpsc::Sender<RelayEvent>,
    },
    Unsubscribe {
        id: String,
        done: oneshot::Sender<()>,
    },
    Publish {
        event: Box<Event>,
        ack: Ack,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct EndpointOptions {
    pub op_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Cheap, cloneable address of an endpoint actor.
#[derive(Clone)]
pub(crate) struct EndpointHandle {
    url: Arc<str>,
    commands: mpsc::Sender<Command>,
}

impl EndpointHandle {
    pub fn spawn<C: RelayConnector>(
        url: &str,
        connector: Arc<C>,
        options: EndpointOptions,
    ) -> (Self, JoinHandle<()>) {
        let url: Arc<str> = Arc::from(url);
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let actor = Endpoint {
            url: Arc::clone(&url),
            connector,
            options,
            subs: HashMap::new(),
            pending: HashMap::new(),
            link: None,
            failures: 0,
            retry_at: None,
            reissue_at: None,
        };
        let task = tokio::spawn(actor.run(rx));
        (Self { url, commands: tx }, task)
    }

    pub fn url(&self) -> &Arc<str> {
        &self.url
    }

    pub async fn subscribe(
        &self,
        id: String,
        filter: Filter,
        events: mpsc::Sender<RelayEvent>,
    ) -> Result<(), RelayError> {
        self.commands
            .send(Command::Subscribe { id, filter, events })
            .await
            .map_err(|_| RelayError::Closed)
    }

    /// Resolves once the actor has forgotten the subscription.
    pub async fn unsubscribe(&self, id: &str) {
        let (done, rx) = oneshot::channel();
        let cmd = Command::Unsubscribe {
            id: id.to_string(),
            done,
        };
        if self.commands.send(cmd).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Fire-and-forget unsubscribe for use in `Drop`. A full command queue
    /// hands the command to a task so it is not lost.
    pub fn unsubscribe_now(&self, id: &str) {
        let (done, _) = oneshot::channel();
        let cmd = Command::Unsubscribe {
            id: id.to_string(),
            done,
        };
        match self.commands.try_send(cmd) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(cmd)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    debug!(relay = %self.url, subscription = %id, "Command queue full; deferring unsubscribe");
                    let commands = self.commands.clone();
                    runtime.spawn(async move {
                        let _ = commands.send(cmd).await;
                    });
                }
                Err(_) => {
                    warn!(relay = %self.url, subscription = %id, "Command queue full outside a runtime; unsubscribe dropped");
                }
            },
        }
    }

    /// Resolves on the relay's `OK`.
    pub async fn publish(&self, event: Event) -> Result<(), RelayError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                event: Box::new(event),
                ack,
            })
            .await
            .map_err(|_| RelayError::Closed)?;
        rx.await.unwrap_or(Err(RelayError::Closed))
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

struct SubState {
    filter: Filter,
    events: mpsc::Sender<RelayEvent>,
    /// Closed by the relay and waiting to be re-issued.
    parked: bool,
    /// Consecutive relay `CLOSED`s without an event in between.
    closes: u32,
}

struct Endpoint<C> {
    url: Arc<str>,
    connector: Arc<C>,
    options: EndpointOptions,
    subs: HashMap<String, SubState>,
    /// Event id → publishers waiting on the relay's `OK`.
    pending: HashMap<String, Vec<Ack>>,
    link: Option<RelayLink>,
    /// Consecutive failed connects (or drops) since the last good connect.
    failures: u32,
    retry_at: Option<Instant>,
    /// When parked subscriptions are next re-issued.
    reissue_at: Option<Instant>,
}

enum Wake {
    Command(Option<Command>),
    Relay(Option<RelayMessage>),
    Retry,
    Reissue,
}

impl<C: RelayConnector> Endpoint<C> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            if self.link.is_none() && !self.subs.is_empty() && self.retry_due() {
                let _ = self.ensure_connected().await;
            }

            let retry_at = self.retry_at;
            let reissue_at = self.reissue_at;
            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Command(cmd),
                msg = recv_link(self.link.as_mut()) => Wake::Relay(msg),
                _ = sleep_opt(retry_at) => Wake::Retry,
                _ = sleep_opt(reissue_at) => Wake::Reissue,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => break,
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Relay(Some(msg)) => self.on_message(msg).await,
                Wake::Relay(None) => self.on_disconnect(),
                Wake::Retry => self.retry_at = None,
                Wake::Reissue => self.reissue_parked().await,
            }
            self.release_if_idle();
        }

        self.link = None;
        for (_, acks) in self.pending.drain() {
            for ack in acks {
                let _ = ack.send(Err(RelayError::Closed));
            }
        }
        debug!(relay = %self.url, "Endpoint stopped");
    }

    fn retry_due(&self) -> bool {
        self.retry_at.map_or(true, |at| at <= Instant::now())
    }

    async fn ensure_connected(&mut self) -> Result<(), RelayError> {
        if self.link.is_some() {
            return Ok(());
        }
        if !self.retry_due() {
            return Err(RelayError::Disconnected);
        }

        let attempt = timeout(self.options.op_timeout, self.connector.connect(&self.url)).await;
        match attempt {
            Ok(Ok(link)) => {
                info!(relay = %self.url, "Connected to relay");
                self.link = Some(link);
                self.failures = 0;
                self.retry_at = None;
                self.resubscribe_all().await;
                if self.link.is_some() {
                    Ok(())
                } else {
                    Err(RelayError::Disconnected)
                }
            }
            Ok(Err(err)) => {
                warn!(relay = %self.url, error = %err, "Relay connect failed");
                self.schedule_retry();
                Err(err)
            }
            Err(_) => {
                warn!(relay = %self.url, "Relay connect timed out");
                self.schedule_retry();
                Err(RelayError::Timeout)
            }
        }
    }

    /// Arm the backoff timer after a failure. Only matters while there are
    /// subscriptions to restore; a publish-only endpoint just tries again on
    /// the next publish.
    fn schedule_retry(&mut self) {
        if self.subs.is_empty() {
            self.failures = 0;
            self.retry_at = None;
            return;
        }

        self.failures += 1;
        if !self.options.reconnect.allows(self.failures) {
            warn!(
                relay = %self.url,
                attempts = self.failures - 1,
                "Giving up on relay; dropping its subscriptions"
            );
            self.subs.clear();
            self.failures = 0;
            self.retry_at = None;
            return;
        }

        let delay = self.options.reconnect.delay(self.failures);
        debug!(relay = %self.url, attempt = self.failures, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn resubscribe_all(&mut self) {
        self.reissue_at = None;
        let frames: Vec<ClientMessage> = self
            .subs
            .iter_mut()
            .map(|(id, sub)| {
                sub.parked = false;
                ClientMessage::Req {
                    subscription_id: id.clone(),
                    filter: sub.filter.clone(),
                }
            })
            .collect();
        for frame in frames {
            if !self.send(frame).await {
                return;
            }
        }
    }

    /// Re-issue every subscription the relay closed. Without a link the next
    /// connect resubscribes everything anyway.
    async fn reissue_parked(&mut self) {
        self.reissue_at = None;
        if self.link.is_none() {
            return;
        }
        let frames: Vec<ClientMessage> = self
            .subs
            .iter_mut()
            .filter(|(_, sub)| sub.parked)
            .map(|(id, sub)| {
                sub.parked = false;
                ClientMessage::Req {
                    subscription_id: id.clone(),
                    filter: sub.filter.clone(),
                }
            })
            .collect();
        for frame in frames {
            debug!(relay = %self.url, "Re-issuing closed subscription");
            if !self.send(frame).await {
                return;
            }
        }
    }

    /// Send on the live link. A dead link is torn down and `false` returned.
    async fn send(&mut self, frame: ClientMessage) -> bool {
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        if link.outgoing.send(frame).await.is_ok() {
            return true;
        }
        self.on_disconnect();
        false
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { id, filter, events } => {
                debug!(relay = %self.url, subscription = %id, "Subscribing");
                self.subs.insert(
                    id.clone(),
                    SubState {
                        filter: filter.clone(),
                        events,
                        parked: false,
                        closes: 0,
                    },
                );
                if self.link.is_some() {
                    self.send(ClientMessage::Req {
                        subscription_id: id,
                        filter,
                    })
                    .await;
                }
            }
            Command::Unsubscribe { id, done } => {
                if self.subs.remove(&id).is_some() && self.link.is_some() {
                    self.send(ClientMessage::Close {
                        subscription_id: id,
                    })
                    .await;
                }
                self.release_if_idle();
                let _ = done.send(());
            }
            Command::Publish { event, ack } => {
                if let Err(err) = self.ensure_connected().await {
                    let _ = ack.send(Err(err));
                    return;
                }
                let event_id = event.id.clone();
                if self.send(ClientMessage::Event(event)).await {
                    self.pending.entry(event_id).or_default().push(ack);
                } else {
                    let _ = ack.send(Err(RelayError::Disconnected));
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn on_message(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.on_event(subscription_id, *event).await,
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let Some(acks) = self.pending.remove(&event_id) else {
                    return;
                };
                let outcome = if accepted {
                    Ok(())
                } else {
                    Err(RelayError::Rejected(message))
                };
                for ack in acks {
                    let _ = ack.send(outcome.clone());
                }
            }
            RelayMessage::Eose { subscription_id } => {
                debug!(relay = %self.url, subscription = %subscription_id, "End of stored events");
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                self.on_closed(subscription_id, message);
            }
            RelayMessage::Notice { message } => {
                info!(relay = %self.url, notice = %message, "Relay notice");
            }
            RelayMessage::Auth { .. } => {
                debug!(relay = %self.url, "Relay requested AUTH; not supported");
            }
        }
    }

    fn on_closed(&mut self, subscription_id: String, reason: String) {
        let Some(sub) = self.subs.get_mut(&subscription_id) else {
            return;
        };

        let permanent = PERMANENT_CLOSE_PREFIXES
            .iter()
            .any(|prefix| reason.starts_with(prefix));
        sub.closes += 1;
        if permanent || !self.options.reconnect.allows(sub.closes) {
            warn!(relay = %self.url, subscription = %subscription_id, reason = %reason, "Relay closed subscription; dropping it");
            self.subs.remove(&subscription_id);
            return;
        }

        sub.parked = true;
        let at = Instant::now() + self.options.reconnect.delay(sub.closes);
        self.reissue_at = Some(self.reissue_at.map_or(at, |current| current.min(at)));
        warn!(relay = %self.url, subscription = %subscription_id, reason = %reason, attempt = sub.closes, "Relay closed subscription; will re-issue");
    }

    async fn on_event(&mut self, subscription_id: String, event: Event) {
        let Some(sub) = self.subs.get_mut(&subscription_id) else {
            debug!(relay = %self.url, subscription = %subscription_id, "Event for unknown subscription");
            return;
        };

        if let Err(err) = event.verify() {
            warn!(relay = %self.url, event_id = %event.id, error = %err, "Dropping invalid event");
            return;
        }
        if !sub.filter.matches(&event) {
            warn!(relay = %self.url, event_id = %event.id, "Dropping event outside subscription filter");
            return;
        }

        let observed = event.created_at.min(chrono::Utc::now().timestamp());
        let cursor = sub.filter.since.unwrap_or(i64::MIN).max(observed);
        sub.filter.since = Some(cursor);
        sub.closes = 0;

        let delivered = RelayEvent {
            relay: Arc::clone(&self.url),
            event,
        };
        if sub.events.send(delivered).await.is_err() {
            // Subscriber went away without unsubscribing.
            self.subs.remove(&subscription_id);
            self.send(ClientMessage::Close { subscription_id }).await;
        }
    }

    fn on_disconnect(&mut self) {
        if self.link.take().is_none() {
            return;
        }
        warn!(relay = %self.url, "Relay connection lost");
        for (_, acks) in self.pending.drain() {
            for ack in acks {
                let _ = ack.send(Err(RelayError::Disconnected));
            }
        }
        self.schedule_retry();
    }

    /// Drop the link when nothing needs it.
    fn release_if_idle(&mut self) {
        self.pending.retain(|_, acks| {
            acks.retain(|ack| !ack.is_closed());
            !acks.is_empty()
        });
        if !self.subs.is_empty() || !self.pending.is_empty() {
            return;
        }
        if self.link.take().is_some() {
            debug!(relay = %self.url, "Endpoint idle; closing connection");
        }
        self.failures = 0;
        self.retry_at = None;
        self.reissue_at = None;
    }
}

async fn recv_link(link: Option<&mut RelayLink>) -> Option<RelayMessage> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
