//! Bridge configuration.
//!
//! Values come from, in order of precedence:
//!   1. the first `.env` file found (explicit path, user config dir, `./.env`)
//!   2. the process environment
//!   3. built-in defaults
//!
//! An empty value counts as unset at every layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::allowlist::Allowlist;
use crate::paths;

pub const KEY_PRIVATE_KEY: &str = "NOSTR_PRIVATE_KEY";
pub const KEY_RELAYS: &str = "NOSTR_RELAYS";
pub const KEY_ALLOWED_SENDERS: &str = "NOSTR_ALLOWED_SENDERS";
pub const KEY_DEBUG: &str = "NOSTR_DEBUG";
pub const KEY_SESSION_TIMEOUT_HOURS: &str = "NOSTR_SESSION_TIMEOUT_HOURS";
pub const KEY_SESSION_TTL_MS: &str = "NOSTR_SESSION_TTL_MS";
pub const KEY_SESSION_CLEANUP_SECS: &str = "NOSTR_SESSION_CLEANUP_SECS";
pub const KEY_RELAY_TIMEOUT_SECS: &str = "NOSTR_RELAY_TIMEOUT_SECS";
pub const KEY_BACKEND_URL: &str = "BRIDGE_BACKEND_URL";
pub const KEY_BACKEND_TOKEN: &str = "BRIDGE_BACKEND_TOKEN";
pub const KEY_BACKEND_TIMEOUT_SECS: &str = "BRIDGE_BACKEND_TIMEOUT_SECS";

pub const DEFAULT_RELAYS: &str = "wss://relay.primal.net,wss://nos.lol,wss://relay.damus.io";
pub const DEFAULT_SESSION_TIMEOUT_HOURS: u64 = 24;
pub const DEFAULT_SESSION_CLEANUP_SECS: u64 = 3600;
pub const DEFAULT_RELAY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:4096";
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("NOSTR_PRIVATE_KEY is required (set it in the environment or a .env file)")]
    MissingCredential,

    #[error("Invalid value for {key}: {reason} (got {value:?})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("No relays configured")]
    NoRelays,

    #[error("Invalid relay URL {0:?}: expected ws:// or wss://")]
    InvalidRelayUrl(String),

    #[error("Cannot read env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fully resolved runtime configuration.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Raw credential (`nsec1…` or hex). Resolved into key material at startup.
    pub private_key: Zeroizing<String>,
    pub relays: Vec<String>,
    pub allowlist: Allowlist,
    pub debug: bool,
    pub session_ttl: Duration,
    pub session_cleanup_interval: Duration,
    pub relay_timeout: Duration,
    pub backend_url: String,
    pub backend_token: Option<String>,
    pub backend_timeout: Duration,
    /// The `.env` file the values were read from, if any.
    pub source: Option<PathBuf>,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("private_key", &"<redacted>")
            .field("relays", &self.relays)
            .field("allowlist", &self.allowlist.len())
            .field("debug", &self.debug)
            .field("session_ttl", &self.session_ttl)
            .field("session_cleanup_interval", &self.session_cleanup_interval)
            .field("relay_timeout", &self.relay_timeout)
            .field("backend_url", &self.backend_url)
            .field("backend_token", &self.backend_token.as_ref().map(|_| "<redacted>"))
            .field("backend_timeout", &self.backend_timeout)
            .field("source", &self.source)
            .finish()
    }
}

impl BridgeConfig {
    /// Load from the first `.env` file found plus the process environment.
    ///
    /// An explicit `env_file` must exist; the default locations are optional.
    pub fn load(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        let (source, file_vars) = match env_file {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::EnvFile {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                (Some(path.to_path_buf()), parse_env_file(&content))
            }
            None => match find_default_env_file() {
                Some((path, vars)) => (Some(path), vars),
                None => (None, HashMap::new()),
            },
        };

        if let Some(path) = &source {
            info!(path = %path.display(), "Loaded configuration file");
        }

        Self::from_lookup(
            |key| {
                file_vars
                    .get(key)
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .or_else(|| std::env::var(key).ok().filter(|v| !v.is_empty()))
            },
            source,
        )
    }

    /// Build from an arbitrary key lookup. `load` layers files over the
    /// process environment on top of this.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        source: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let private_key = lookup(KEY_PRIVATE_KEY)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingCredential)?;

        let relays = parse_relays(&lookup(KEY_RELAYS).unwrap_or_else(|| DEFAULT_RELAYS.to_string()))?;

        let allowlist = match lookup(KEY_ALLOWED_SENDERS) {
            Some(raw) => Allowlist::parse(raw.split(',')).map_err(|e| ConfigError::Invalid {
                key: KEY_ALLOWED_SENDERS,
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => Allowlist::open(),
        };

        let debug = lookup(KEY_DEBUG).map(|v| v.trim() == "true").unwrap_or(false);

        let session_ttl = match lookup(KEY_SESSION_TTL_MS) {
            Some(raw) => Duration::from_millis(parse_positive(KEY_SESSION_TTL_MS, &raw)?),
            None => {
                let hours = match lookup(KEY_SESSION_TIMEOUT_HOURS) {
                    Some(raw) => parse_positive(KEY_SESSION_TIMEOUT_HOURS, &raw)?,
                    None => DEFAULT_SESSION_TIMEOUT_HOURS,
                };
                let secs = hours.checked_mul(3600).ok_or_else(|| ConfigError::Invalid {
                    key: KEY_SESSION_TIMEOUT_HOURS,
                    value: hours.to_string(),
                    reason: "too large".into(),
                })?;
                Duration::from_secs(secs)
            }
        };

        let session_cleanup_interval = Duration::from_secs(
            lookup_positive(&lookup, KEY_SESSION_CLEANUP_SECS, DEFAULT_SESSION_CLEANUP_SECS)?,
        );
        let relay_timeout = Duration::from_secs(lookup_positive(
            &lookup,
            KEY_RELAY_TIMEOUT_SECS,
            DEFAULT_RELAY_TIMEOUT_SECS,
        )?);
        let backend_timeout = Duration::from_secs(lookup_positive(
            &lookup,
            KEY_BACKEND_TIMEOUT_SECS,
            DEFAULT_BACKEND_TIMEOUT_SECS,
        )?);

        let backend_url = lookup(KEY_BACKEND_URL)
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        if !(backend_url.starts_with("http://") || backend_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: KEY_BACKEND_URL,
                value: backend_url,
                reason: "expected http:// or https://".into(),
            });
        }

        let backend_token = lookup(KEY_BACKEND_TOKEN)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            private_key: Zeroizing::new(private_key),
            relays,
            allowlist,
            debug,
            session_ttl,
            session_cleanup_interval,
            relay_timeout,
            backend_url,
            backend_token,
            backend_timeout,
            source,
        })
    }
}

// ── .env handling ─────────────────────────────────────────────────────────────

/// Candidate `.env` locations in search order.
pub fn default_env_files() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = paths::user_env_file() {
        candidates.push(path);
    }
    candidates.push(PathBuf::from(".env"));
    candidates
}

fn find_default_env_file() -> Option<(PathBuf, HashMap<String, String>)> {
    for path in default_env_files() {
        match std::fs::read_to_string(&path) {
            Ok(content) => return Some((path, parse_env_file(&content))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "Skipping unreadable env file");
            }
        }
    }
    None
}

/// Parse `KEY=VALUE` lines. `#` comments and blank lines are skipped, and a
/// value wrapped in matching single or double quotes is unwrapped.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    vars
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

// ── Value parsing ─────────────────────────────────────────────────────────────

fn parse_relays(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut relays: Vec<String> = Vec::new();
    for url in raw.split(',').map(str::trim).filter(|u| !u.is_empty()) {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidRelayUrl(url.to_string()));
        }
        if !relays.iter().any(|r| r == url) {
            relays.push(url.to_string());
        }
    }
    if relays.is_empty() {
        return Err(ConfigError::NoRelays);
    }
    Ok(relays)
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".into(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn lookup_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(raw) => parse_positive(key, &raw),
        None => Ok(default),
    }
}
