//! Signed events
//!
//! # Identity
//! An event's id is the lowercase hex SHA-256 of its canonical form, the
//! compact JSON array
//!
//! ```text
//! [0, <pubkey hex>, <created_at>, <kind>, <tags>, <content>]
//! ```
//!
//! and its signature is a BIP-340 Schnorr signature over those 32 bytes.
//! Relays are untrusted: both are recomputed on every inbound event.

use serde::{Deserialize, Serialize};

use dm_crypto::{hash::sha256, signing, KeyMaterial, PublicIdentity};

use crate::error::ProtoError;

/// Encrypted direct message.
pub const KIND_ENCRYPTED_DM: u16 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Recompute the id and check the signature against `pubkey`.
    pub fn verify(&self) -> Result<(), ProtoError> {
        let digest = canonical_digest(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        let computed = hex::encode(digest);
        if computed != self.id {
            return Err(ProtoError::IdMismatch {
                claimed: self.id.clone(),
                computed,
            });
        }

        let author = self.author()?;
        let sig_bytes = hex::decode(&self.sig)
            .map_err(|_| dm_crypto::CryptoError::SignatureVerification)?;
        let sig: [u8; signing::SIGNATURE_LEN] = sig_bytes
            .try_into()
            .map_err(|_| dm_crypto::CryptoError::SignatureVerification)?;
        signing::verify_digest(&author, &digest, &sig)?;
        Ok(())
    }

    pub fn author(&self) -> Result<PublicIdentity, ProtoError> {
        Ok(PublicIdentity::from_hex(&self.pubkey)?)
    }

    /// Values of every `["p", …]` tag, in tag order.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().filter_map(|tag| match tag.as_slice() {
            [name, value, ..] if name == "p" => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn is_addressed_to(&self, identity: &PublicIdentity) -> bool {
        let hex = identity.to_hex();
        self.recipients().any(|r| r == hex)
    }
}

/// An event before it has an id or signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Kind-4 message from `author` to `recipient`, stamped now.
    pub fn direct_message(
        author: &PublicIdentity,
        recipient: &PublicIdentity,
        content: impl Into<String>,
    ) -> Self {
        Self {
            pubkey: author.to_hex(),
            created_at: chrono::Utc::now().timestamp(),
            kind: KIND_ENCRYPTED_DM,
            tags: vec![vec!["p".to_string(), recipient.to_hex()]],
            content: content.into(),
        }
    }

    pub fn compute_id(&self) -> Result<String, ProtoError> {
        canonical_digest(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
            .map(hex::encode)
    }

    /// Sign with `keys`. The finished event is verified before it is
    /// returned, so a caller never publishes something relays would reject.
    pub fn sign(self, keys: &KeyMaterial) -> Result<Event, ProtoError> {
        if self.pubkey != keys.public().to_hex() {
            return Err(ProtoError::SignerMismatch);
        }

        let digest = canonical_digest(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        let sig = signing::sign_digest(keys, &digest)?;

        let event = Event {
            id: hex::encode(digest),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig),
        };
        event.verify()?;
        Ok(event)
    }
}

fn canonical_digest(
    pubkey: &str,
    created_at: i64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], ProtoError> {
    let canonical = serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))?;
    Ok(sha256(canonical.as_bytes()))
}
