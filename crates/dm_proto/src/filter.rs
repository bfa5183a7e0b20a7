//! Subscription filters.
//!
//! Serialised as a JSON object with absent fields omitted, e.g.
//! `{"kinds":[4],"#p":["<hex>"],"since":1700000000}`.

use serde::{Deserialize, Serialize};

use dm_crypto::PublicIdentity;

use crate::event::{Event, KIND_ENCRYPTED_DM};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    /// Kind-4 messages addressed to `recipient`, optionally from `since` on.
    pub fn direct_messages_to(recipient: &PublicIdentity, since: Option<i64>) -> Self {
        Self {
            kinds: Some(vec![KIND_ENCRYPTED_DM]),
            p_tags: Some(vec![recipient.to_hex()]),
            since,
            ..Self::default()
        }
    }

    pub fn with_since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Local evaluation, same semantics a relay applies.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(wanted) = &self.p_tags {
            if !event.recipients().any(|r| wanted.iter().any(|w| w == r)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}
