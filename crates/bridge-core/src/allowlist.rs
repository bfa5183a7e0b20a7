//! Sender allowlist.
//!
//! Empty means open: every sender may reach the backend. Otherwise only the
//! listed identities are served and everyone else is dropped before any
//! decryption work happens.

use std::collections::HashSet;

use dm_crypto::{CryptoError, PublicIdentity};

#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    allowed: HashSet<PublicIdentity>,
}

impl Allowlist {
    pub fn open() -> Self {
        Self::default()
    }

    /// Parse `npub1…` / hex entries. Blank entries are ignored.
    pub fn parse<'a>(entries: impl IntoIterator<Item = &'a str>) -> Result<Self, CryptoError> {
        let allowed = entries
            .into_iter()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(PublicIdentity::parse)
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self { allowed })
    }

    pub fn from_identities(ids: impl IntoIterator<Item = PublicIdentity>) -> Self {
        Self {
            allowed: ids.into_iter().collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn permits(&self, sender: &PublicIdentity) -> bool {
        self.is_open() || self.allowed.contains(sender)
    }

    /// Same check on a raw hex pubkey straight off an event. Unparseable
    /// keys are never permitted by a closed list.
    pub fn permits_hex(&self, sender_hex: &str) -> bool {
        if self.is_open() {
            return true;
        }
        PublicIdentity::from_hex(sender_hex)
            .map(|id| self.allowed.contains(&id))
            .unwrap_or(false)
    }
}
