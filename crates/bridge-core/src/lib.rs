//! bridge-core — State and contracts shared by the bridge service
//!
//! # Modules
//! - `config`    — environment / `.env` configuration
//! - `allowlist` — which senders may talk to the bridge
//! - `backend`   — the conversation service contract
//! - `session`   — sender → conversation table with idle expiry
//! - `paths`     — platform config locations

pub mod allowlist;
pub mod backend;
pub mod config;
pub mod paths;
pub mod session;

pub use allowlist::Allowlist;
pub use backend::{BackendError, ConversationBackend, ConversationHandle};
pub use config::{BridgeConfig, ConfigError};
pub use session::{Session, SessionStore};
