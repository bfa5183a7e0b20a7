//! Relay transport pool
//!
//! N independent relays presented as one subscribe/publish surface.
//!
//! # Shape
//! - `connector`    — opens one relay link (WebSocket in production)
//! - `endpoint`     — one actor task per relay URL; owns at most one link
//! - `pool`         — fan-out subscribe, first-success publish
//! - `subscription` — merged, deduplicated inbound stream
//!
//! A relay dropping its connection only affects its own endpoint: pending
//! publishes there fail, the endpoint backs off and reconnects, and the
//! merged stream keeps flowing from the others.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use dm_proto::Event;

pub mod connector;
pub mod endpoint;
pub mod pool;
pub mod subscription;

pub use connector::{RelayConnector, RelayLink, WsConnector};
pub use pool::{PoolOptions, RelayPool};
pub use subscription::Subscription;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out")]
    Timeout,

    #[error("connection lost")]
    Disconnected,

    #[error("rejected by relay: {0}")]
    Rejected(String),

    #[error("endpoint shut down")]
    Closed,

    #[error("publish task failed")]
    TaskFailed,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no relays configured")]
    NoRelays,

    #[error("all {} relays failed: {}", .0.len(), describe_failures(.0))]
    AllFailed(Vec<(String, RelayError)>),
}

fn describe_failures(failures: &[(String, RelayError)]) -> String {
    failures
        .iter()
        .map(|(url, err)| format!("{url}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// An inbound event and the relay that delivered it first.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub relay: Arc<str>,
    pub event: Event,
}

/// Per-endpoint reconnect schedule: exponential backoff from `base_delay`,
/// capped at `max_delay`. `max_attempts = None` retries forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}
