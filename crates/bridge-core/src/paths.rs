use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "nostr";
pub const APP_NAME: &str = "nostr-dm-bridge";

/// Per-user config directory, e.g. `~/.config/nostr-dm-bridge` on Linux.
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// `.env` inside the per-user config directory.
pub fn user_env_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(".env"))
}
