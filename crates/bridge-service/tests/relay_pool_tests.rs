use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout, Instant};

use bridge_service::relay::{
    PublishError, ReconnectPolicy, RelayConnector, RelayError, RelayLink,
};
use bridge_service::{PoolOptions, RelayPool};
use dm_crypto::{KeyMaterial, PublicIdentity};
use dm_proto::{ClientMessage, Event, Filter, RelayMessage, UnsignedEvent};

// ── In-memory relays ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum OnPublish {
    Accept(Duration),
    Reject,
    Silent,
}

#[derive(Debug, Clone)]
struct MockRelay {
    stored: Vec<Event>,
    on_publish: OnPublish,
    refuse: bool,
    /// Answer this many REQs per connection with `CLOSED` first.
    close_reqs: usize,
    close_reason: &'static str,
}

impl MockRelay {
    fn accepting() -> Self {
        Self {
            stored: Vec::new(),
            on_publish: OnPublish::Accept(Duration::ZERO),
            refuse: false,
            close_reqs: 0,
            close_reason: "",
        }
    }

    fn storing(events: Vec<Event>) -> Self {
        Self {
            stored: events,
            ..Self::accepting()
        }
    }

    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::accepting()
        }
    }

    fn closing_first(events: Vec<Event>, reason: &'static str) -> Self {
        Self {
            close_reqs: 1,
            close_reason: reason,
            ..Self::storing(events)
        }
    }

    fn publish(on_publish: OnPublish) -> Self {
        Self {
            on_publish,
            ..Self::accepting()
        }
    }
}

#[derive(Default)]
struct MockNetwork {
    relays: Mutex<HashMap<String, MockRelay>>,
    open: AtomicUsize,
    connects: Mutex<HashMap<String, usize>>,
    reqs: Mutex<Vec<(String, Filter)>>,
    kills: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MockNetwork {
    fn with(relays: Vec<(&str, MockRelay)>) -> Arc<Self> {
        let net = Self::default();
        {
            let mut map = net.relays.lock().unwrap();
            for (url, relay) in relays {
                map.insert(url.to_string(), relay);
            }
        }
        Arc::new(net)
    }

    fn open_links(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn connects(&self, url: &str) -> usize {
        self.connects.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn reqs_for(&self, url: &str) -> Vec<Filter> {
        self.reqs
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Replace what the relay serves from its next connection on.
    fn set_stored(&self, url: &str, events: Vec<Event>) {
        if let Some(relay) = self.relays.lock().unwrap().get_mut(url) {
            relay.stored = events;
        }
    }

    /// Drop the relay's current connection from the relay side.
    fn kill(&self, url: &str) {
        if let Some(kill) = self.kills.lock().unwrap().get(url) {
            kill.notify_one();
        }
    }
}

struct MockConnector(Arc<MockNetwork>);

#[async_trait]
impl RelayConnector for MockConnector {
    async fn connect(&self, url: &str) -> Result<RelayLink, RelayError> {
        let net = Arc::clone(&self.0);
        *net.connects.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let relay = net
            .relays
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RelayError::Connect(format!("unknown relay {url}")))?;
        if relay.refuse {
            return Err(RelayError::Connect("connection refused".into()));
        }

        let kill = Arc::new(Notify::new());
        net.kills
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::clone(&kill));

        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(64);
        net.open.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(net, url.to_string(), relay, kill, out_rx, in_tx));

        Ok(RelayLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

async fn serve(
    net: Arc<MockNetwork>,
    url: String,
    relay: MockRelay,
    kill: Arc<Notify>,
    mut frames: mpsc::Receiver<ClientMessage>,
    replies: mpsc::Sender<RelayMessage>,
) {
    let mut reqs_seen = 0;
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = kill.notified() => None,
        };
        let Some(frame) = frame else { break };

        match frame {
            ClientMessage::Req {
                subscription_id,
                filter,
            } => {
                net.reqs.lock().unwrap().push((url.clone(), filter));
                reqs_seen += 1;
                if reqs_seen <= relay.close_reqs {
                    let _ = replies
                        .send(RelayMessage::Closed {
                            subscription_id,
                            message: relay.close_reason.to_string(),
                        })
                        .await;
                    continue;
                }
                // Stored events go out unfiltered; the client must check them.
                for event in &relay.stored {
                    let _ = replies
                        .send(RelayMessage::Event {
                            subscription_id: subscription_id.clone(),
                            event: Box::new(event.clone()),
                        })
                        .await;
                }
                let _ = replies.send(RelayMessage::Eose { subscription_id }).await;
            }
            ClientMessage::Event(event) => match relay.on_publish {
                OnPublish::Accept(delay) => {
                    let replies = replies.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        let _ = replies
                            .send(RelayMessage::Ok {
                                event_id: event.id.clone(),
                                accepted: true,
                                message: String::new(),
                            })
                            .await;
                    });
                }
                OnPublish::Reject => {
                    let _ = replies
                        .send(RelayMessage::Ok {
                            event_id: event.id.clone(),
                            accepted: false,
                            message: "blocked: test".into(),
                        })
                        .await;
                }
                OnPublish::Silent => {}
            },
            ClientMessage::Close { .. } => {}
        }
    }
    net.open.fetch_sub(1, Ordering::SeqCst);
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn pool(net: &Arc<MockNetwork>, urls: &[&str], op_timeout: Duration) -> RelayPool {
    RelayPool::new(
        urls.iter().copied(),
        Arc::new(MockConnector(Arc::clone(net))),
        PoolOptions {
            op_timeout,
            reconnect: ReconnectPolicy::default(),
        },
    )
}

fn dm(from: &KeyMaterial, to: &PublicIdentity, created_at: i64, content: &str) -> Event {
    let mut unsigned = UnsignedEvent::direct_message(from.public(), to, content);
    unsigned.created_at = created_at;
    unsigned.sign(from).unwrap()
}

const QUIET: Duration = Duration::from_millis(100);

// ── Subscribe ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn duplicate_urls_share_one_endpoint() {
    let net = MockNetwork::with(vec![
        ("wss://a", MockRelay::accepting()),
        ("wss://b", MockRelay::accepting()),
    ]);
    let pool = pool(&net, &["wss://a", "wss://a", "wss://b"], Duration::from_secs(10));
    assert_eq!(pool.relays(), vec!["wss://a", "wss://b"]);
}

#[tokio::test(start_paused = true)]
async fn event_from_two_relays_is_delivered_once() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let e1 = dm(&alice, me.public(), 100, "one");
    let e2 = dm(&alice, me.public(), 101, "two");

    let net = MockNetwork::with(vec![
        ("wss://a", MockRelay::storing(vec![e1.clone(), e2.clone()])),
        ("wss://b", MockRelay::storing(vec![e2.clone(), e1.clone()])),
    ]);
    let pool = pool(&net, &["wss://a", "wss://b"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), None))
        .await;

    let mut ids = HashSet::new();
    for _ in 0..2 {
        let delivered = sub.next().await.unwrap();
        ids.insert(delivered.event.id);
    }
    assert_eq!(ids, HashSet::from([e1.id, e2.id]));
    assert!(timeout(QUIET, sub.next()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn forged_and_unaddressed_events_are_dropped() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let someone_else = KeyMaterial::generate();

    let mut forged = dm(&alice, me.public(), 100, "original");
    forged.content = "tampered".into();
    let elsewhere = dm(&alice, someone_else.public(), 100, "not for us");
    let good = dm(&alice, me.public(), 101, "hello");

    let net = MockNetwork::with(vec![(
        "wss://a",
        MockRelay::storing(vec![forged, elsewhere, good.clone()]),
    )]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), None))
        .await;

    let delivered = sub.next().await.unwrap();
    assert_eq!(delivered.event.id, good.id);
    assert_eq!(&*delivered.relay, "wss://a");
    assert!(timeout(QUIET, sub.next()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn events_before_since_are_dropped() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let old = dm(&alice, me.public(), 10, "old");
    let fresh = dm(&alice, me.public(), 500, "fresh");

    let net = MockNetwork::with(vec![(
        "wss://a",
        MockRelay::storing(vec![old, fresh.clone()]),
    )]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), Some(100)))
        .await;

    assert_eq!(sub.next().await.unwrap().event.id, fresh.id);
    assert!(timeout(QUIET, sub.next()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn close_releases_every_connection() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let e1 = dm(&alice, me.public(), 100, "one");

    let net = MockNetwork::with(vec![
        ("wss://a", MockRelay::storing(vec![e1.clone()])),
        ("wss://b", MockRelay::storing(vec![e1])),
    ]);
    let pool = pool(&net, &["wss://a", "wss://b"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), None))
        .await;
    assert!(sub.next().await.is_some());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(net.open_links(), 2);

    sub.close().await;
    sleep(Duration::from_millis(10)).await;

    assert!(sub.is_closed());
    assert_eq!(net.open_links(), 0);
    assert!(sub.next().await.is_none());

    sub.close().await;
    assert!(sub.is_closed());
}

#[tokio::test(start_paused = true)]
async fn dropping_a_subscription_releases_connections() {
    let me = KeyMaterial::generate();
    let net = MockNetwork::with(vec![("wss://a", MockRelay::accepting())]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));

    let sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), None))
        .await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(net.open_links(), 1);

    drop(sub);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(net.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn lost_relay_reconnects_from_its_cursor() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let e1 = dm(&alice, me.public(), 100, "via a");
    let e2 = dm(&alice, me.public(), 200, "via b");

    let net = MockNetwork::with(vec![
        ("wss://a", MockRelay::storing(vec![e1.clone()])),
        ("wss://b", MockRelay::storing(vec![e2.clone()])),
    ]);
    let pool = pool(&net, &["wss://a", "wss://b"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), Some(50)))
        .await;

    let mut ids = HashSet::new();
    for _ in 0..2 {
        ids.insert(sub.next().await.unwrap().event.id);
    }
    assert_eq!(ids, HashSet::from([e1.id.clone(), e2.id.clone()]));

    net.kill("wss://a");
    sleep(Duration::from_millis(10)).await;

    // wss://a is backing off; publishing still works through wss://b.
    let reply = dm(&me, alice.public(), 300, "reply");
    assert_eq!(pool.publish(&reply).await.unwrap(), "wss://b");

    sleep(Duration::from_secs(3)).await;
    assert_eq!(net.connects("wss://a"), 2);
    let reqs = net.reqs_for("wss://a");
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[0].since, Some(50));
    assert_eq!(reqs[1].since, Some(100));

    // The replayed copy of e1 is a duplicate.
    assert!(timeout(QUIET, sub.next()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn future_timestamp_does_not_push_cursor_past_now() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let now = chrono::Utc::now().timestamp();
    let ten_years = 10 * 365 * 24 * 3600;
    let from_the_future = dm(&alice, me.public(), now + ten_years, "early");

    let net = MockNetwork::with(vec![(
        "wss://a",
        MockRelay::storing(vec![from_the_future.clone()]),
    )]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), Some(now - 10)))
        .await;
    assert_eq!(sub.next().await.unwrap().event.id, from_the_future.id);

    let fresh = dm(&alice, me.public(), now + 60, "fresh");
    net.set_stored("wss://a", vec![fresh.clone()]);
    net.kill("wss://a");
    sleep(Duration::from_secs(3)).await;

    let reqs = net.reqs_for("wss://a");
    assert_eq!(reqs.len(), 2);
    let since = reqs[1].since.unwrap();
    assert!(since >= now - 10);
    assert!(since <= chrono::Utc::now().timestamp());

    let delivered = timeout(QUIET, sub.next()).await.unwrap().unwrap();
    assert_eq!(delivered.event.id, fresh.id);
}

#[tokio::test(start_paused = true)]
async fn subscription_closed_by_relay_is_reissued() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let e1 = dm(&alice, me.public(), 100, "after retry");

    let net = MockNetwork::with(vec![(
        "wss://a",
        MockRelay::closing_first(vec![e1.clone()], "error: shutting down idle subscriptions"),
    )]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), None))
        .await;

    let started = Instant::now();
    let delivered = timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.event.id, e1.id);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(net.reqs_for("wss://a").len(), 2);
    assert_eq!(net.connects("wss://a"), 1);
}

#[tokio::test(start_paused = true)]
async fn restricted_close_is_final() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let e1 = dm(&alice, me.public(), 100, "never");

    let net = MockNetwork::with(vec![(
        "wss://a",
        MockRelay::closing_first(vec![e1], "restricted: paid relay"),
    )]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), None))
        .await;

    // The only endpoint dropped it, so the merged stream ends.
    assert!(matches!(
        timeout(Duration::from_secs(10), sub.next()).await,
        Ok(None)
    ));
    sleep(Duration::from_secs(5)).await;
    assert_eq!(net.reqs_for("wss://a").len(), 1);
    assert_eq!(net.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_relay_does_not_block_the_others() {
    let me = KeyMaterial::generate();
    let alice = KeyMaterial::generate();
    let e1 = dm(&alice, me.public(), 100, "hi");

    let net = MockNetwork::with(vec![
        ("wss://down", MockRelay::refusing()),
        ("wss://up", MockRelay::storing(vec![e1.clone()])),
    ]);
    let pool = pool(&net, &["wss://down", "wss://up"], Duration::from_secs(10));
    let mut sub = pool
        .subscribe(Filter::direct_messages_to(me.public(), None))
        .await;

    let delivered = sub.next().await.unwrap();
    assert_eq!(delivered.event.id, e1.id);
    assert_eq!(&*delivered.relay, "wss://up");

    // Backoff keeps retrying the refused relay: 2s, then 4s later.
    sleep(Duration::from_secs(7)).await;
    assert!(net.connects("wss://down") >= 3);
}

// ── Publish ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn publish_returns_on_first_acceptance() {
    let me = KeyMaterial::generate();
    let peer = KeyMaterial::generate();
    let event = dm(&me, peer.public(), 100, "reply");

    let net = MockNetwork::with(vec![
        ("wss://one", MockRelay::refusing()),
        (
            "wss://two",
            MockRelay::publish(OnPublish::Accept(Duration::from_millis(50))),
        ),
        ("wss://three", MockRelay::publish(OnPublish::Silent)),
    ]);
    let pool = pool(
        &net,
        &["wss://one", "wss://two", "wss://three"],
        Duration::from_secs(10),
    );

    let started = Instant::now();
    let relay = pool.publish(&event).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(relay, "wss://two");
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn publish_fails_only_when_every_relay_fails() {
    let me = KeyMaterial::generate();
    let peer = KeyMaterial::generate();
    let event = dm(&me, peer.public(), 100, "reply");

    let net = MockNetwork::with(vec![
        ("wss://one", MockRelay::refusing()),
        ("wss://two", MockRelay::publish(OnPublish::Reject)),
        ("wss://three", MockRelay::publish(OnPublish::Silent)),
    ]);
    let pool = pool(
        &net,
        &["wss://one", "wss://two", "wss://three"],
        Duration::from_secs(1),
    );

    let failures = match pool.publish(&event).await {
        Err(PublishError::AllFailed(failures)) => failures,
        other => panic!("expected AllFailed, got {other:?}"),
    };
    assert_eq!(failures.len(), 3);

    let by_relay: HashMap<_, _> = failures.into_iter().collect();
    assert!(matches!(by_relay["wss://one"], RelayError::Connect(_)));
    assert_eq!(
        by_relay["wss://two"],
        RelayError::Rejected("blocked: test".into())
    );
    assert_eq!(by_relay["wss://three"], RelayError::Timeout);
}

#[tokio::test(start_paused = true)]
async fn publish_without_relays_fails() {
    let me = KeyMaterial::generate();
    let peer = KeyMaterial::generate();
    let event = dm(&me, peer.public(), 100, "reply");

    let net = MockNetwork::with(vec![]);
    let pool = pool(&net, &[], Duration::from_secs(1));
    assert!(matches!(
        pool.publish(&event).await,
        Err(PublishError::NoRelays)
    ));
}

#[tokio::test(start_paused = true)]
async fn publish_only_connection_is_released_after_ok() {
    let me = KeyMaterial::generate();
    let peer = KeyMaterial::generate();
    let event = dm(&me, peer.public(), 100, "reply");

    let net = MockNetwork::with(vec![("wss://a", MockRelay::accepting())]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));

    assert_eq!(pool.publish(&event).await.unwrap(), "wss://a");
    sleep(Duration::from_millis(10)).await;
    assert_eq!(net.open_links(), 0);
    assert_eq!(net.connects("wss://a"), 1);
}

#[tokio::test(start_paused = true)]
async fn publish_after_shutdown_fails_closed() {
    let me = KeyMaterial::generate();
    let peer = KeyMaterial::generate();
    let event = dm(&me, peer.public(), 100, "reply");

    let net = MockNetwork::with(vec![("wss://a", MockRelay::accepting())]);
    let pool = pool(&net, &["wss://a"], Duration::from_secs(10));
    pool.shutdown().await;

    let failures = match pool.publish(&event).await {
        Err(PublishError::AllFailed(failures)) => failures,
        other => panic!("expected AllFailed, got {other:?}"),
    };
    assert_eq!(failures, vec![("wss://a".to_string(), RelayError::Closed)]);
}
