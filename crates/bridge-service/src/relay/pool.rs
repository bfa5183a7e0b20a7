//! Fan-out subscribe and first-success publish over every endpoint.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use dm_proto::{Event, Filter};

use super::connector::RelayConnector;
use super::endpoint::{EndpointHandle, EndpointOptions};
use super::subscription::Subscription;
use super::{PublishError, ReconnectPolicy, RelayError};

const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Bound on each connect and each per-relay publish.
    pub op_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

type PublishAttempt = (Arc<str>, Result<(), RelayError>);

pub struct RelayPool {
    endpoints: Vec<EndpointHandle>,
    options: PoolOptions,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayPool {
    /// Spawn one endpoint actor per distinct URL. Must be called inside a
    /// Tokio runtime.
    pub fn new<C, I, S>(urls: I, connector: Arc<C>, options: PoolOptions) -> Self
    where
        C: RelayConnector,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoint_options = EndpointOptions {
            op_timeout: options.op_timeout,
            reconnect: options.reconnect.clone(),
        };

        let mut endpoints: Vec<EndpointHandle> = Vec::new();
        let mut tasks = Vec::new();
        for url in urls {
            let url = url.as_ref();
            if endpoints.iter().any(|ep| &**ep.url() == url) {
                continue;
            }
            let (handle, task) =
                EndpointHandle::spawn(url, Arc::clone(&connector), endpoint_options.clone());
            endpoints.push(handle);
            tasks.push(task);
        }

        Self {
            endpoints,
            options,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn relays(&self) -> Vec<&str> {
        self.endpoints.iter().map(|ep| &**ep.url()).collect()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Issue `filter` on every endpoint and merge what comes back.
    pub async fn subscribe(&self, filter: Filter) -> Subscription {
        let id = format!("dm-{:016x}", rand::random::<u64>());
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        for ep in &self.endpoints {
            if let Err(err) = ep.subscribe(id.clone(), filter.clone(), tx.clone()).await {
                warn!(relay = %ep.url(), error = %err, "Subscribe failed");
            }
        }
        info!(subscription = %id, relays = self.endpoints.len(), "Subscription opened");

        Subscription::new(id, rx, self.endpoints.clone())
    }

    /// Broadcast `event` and return the URL of the first relay to accept it.
    ///
    /// Attempts still running when one succeeds are drained in the
    /// background and their outcomes logged.
    pub async fn publish(&self, event: &Event) -> Result<String, PublishError> {
        if self.endpoints.is_empty() {
            return Err(PublishError::NoRelays);
        }

        let mut attempts: JoinSet<PublishAttempt> = JoinSet::new();
        for ep in &self.endpoints {
            let ep = ep.clone();
            let event = event.clone();
            let limit = self.options.op_timeout;
            attempts.spawn(async move {
                let outcome = match timeout(limit, ep.publish(event)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RelayError::Timeout),
                };
                (Arc::clone(ep.url()), outcome)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((relay, Ok(()))) => {
                    debug!(relay = %relay, event_id = %event.id, "Event accepted");
                    drain_remaining(attempts, event.id.clone());
                    return Ok(relay.to_string());
                }
                Ok((relay, Err(err))) => {
                    debug!(relay = %relay, event_id = %event.id, error = %err, "Publish attempt failed");
                    failures.push((relay.to_string(), err));
                }
                Err(err) => warn!(error = %err, "Publish task failed"),
            }
        }

        record_lost_attempts(self.endpoints.iter().map(|ep| &**ep.url()), &mut failures);
        Err(PublishError::AllFailed(failures))
    }

    /// Stop every endpoint actor and wait for them to exit.
    pub async fn shutdown(&self) {
        for ep in &self.endpoints {
            ep.shutdown().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("Relay pool shut down");
    }
}

/// Charge every tried relay that never reported (its task panicked).
fn record_lost_attempts<'a>(
    tried: impl IntoIterator<Item = &'a str>,
    failures: &mut Vec<(String, RelayError)>,
) {
    for url in tried {
        if !failures.iter().any(|(failed, _)| failed == url) {
            failures.push((url.to_string(), RelayError::TaskFailed));
        }
    }
}

fn drain_remaining(mut attempts: JoinSet<PublishAttempt>, event_id: String) {
    if attempts.is_empty() {
        return;
    }
    tokio::spawn(async move {
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((relay, Ok(()))) => {
                    debug!(relay = %relay, event_id = %event_id, "Late acceptance")
                }
                Ok((relay, Err(err))) => {
                    debug!(relay = %relay, event_id = %event_id, error = %err, "Late publish failure")
                }
                Err(err) => warn!(error = %err, "Publish task failed"),
            }
        }
    });
}
