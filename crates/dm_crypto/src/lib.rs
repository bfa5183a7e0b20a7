//! dm_crypto — Nostr DM Bridge cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public identities are opaque newtypes so a secret can never be passed
//!   where a routing key is expected.
//!
//! # Module layout
//! - `keys`     — credential resolution (nsec / hex), x-only public identities
//! - `ecdh`     — secp256k1 shared-secret derivation
//! - `nip04`    — AES-256-CBC direct-message envelopes
//! - `signing`  — BIP-340 Schnorr signatures over 32-byte digests
//! - `hash`     — SHA-256 helpers
//! - `error`    — unified error type

pub mod ecdh;
pub mod error;
pub mod hash;
pub mod keys;
pub mod nip04;
pub mod signing;

pub use error::{CryptoError, DecryptFailure};
pub use keys::{KeyMaterial, PublicIdentity};
pub use nip04::Envelope;
