//! bridge-service — Nostr direct messages in, conversation replies out
//!
//! # Modules
//! - `relay`    — relay connections, fan-out subscribe, first-success publish
//! - `backend`  — HTTP client for the conversation service
//! - `pipeline` — per-message flow from inbound DM to published reply
//! - `sweeper`  — periodic session expiry

pub mod backend;
pub mod pipeline;
pub mod relay;
pub mod sweeper;

pub use backend::ApiClient;
pub use pipeline::{Bridge, EventPublisher, Outcome, PipelineError};
pub use relay::{PoolOptions, RelayPool, Subscription, WsConnector};
