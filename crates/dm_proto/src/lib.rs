//! dm_proto — Wire types and JSON codec for the relay protocol
//!
//! Everything a relay sees or sends is a JSON array whose first element names
//! the message. Events are the only signed payload; everything else is
//! framing.
//!
//! # Modules
//! - `event`   — signed events, canonical id computation, signature checks
//! - `filter`  — subscription filters and local matching
//! - `message` — client → relay and relay → client frames
//! - `error`   — protocol error type

pub mod error;
pub mod event;
pub mod filter;
pub mod message;

pub use error::ProtoError;
pub use event::{Event, UnsignedEvent, KIND_ENCRYPTED_DM};
pub use filter::Filter;
pub use message::{ClientMessage, RelayMessage};
