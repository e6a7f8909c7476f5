// Durable session cache: conversation shells and group metadata, rehydrated
// on startup. Message bodies are intentionally not persisted.

use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

use crate::models::{Group, PresenceState};

/// The persisted part of a conversation: flags and read position, no
/// message bodies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationShell {
    pub id: String,
    pub is_group: bool,
    pub is_pinned: bool,
    pub is_unread: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheSnapshot {
    pub conversations: Vec<ConversationShell>,
    pub groups: Vec<Group>,
}

impl crate::models::Conversation {
    pub fn from_shell(shell: &ConversationShell) -> Self {
        crate::models::Conversation {
            id: shell.id.clone(),
            is_group: shell.is_group,
            messages: Vec::new(),
            is_pinned: shell.is_pinned,
            is_unread: shell.is_unread,
            last_read_message_id: shell.last_read_message_id.clone(),
            peer_status: PresenceState::Offline,
        }
    }
}

static CACHE_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point the cache at an explicit file, used by tests to avoid touching the
/// real user cache directory. First call wins for the process lifetime.
pub fn set_cache_path_override(path: PathBuf) {
    let _ = CACHE_PATH_OVERRIDE.set(path);
}

pub fn get_cache_dir() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("Could not determine cache directory"))?
        .join("wavechat");

    if !cache_dir.exists() {
        fs::create_dir_all(&cache_dir)?;
    }

    Ok(cache_dir)
}

fn get_cache_path() -> Result<PathBuf> {
    if let Some(path) = CACHE_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_cache_dir()?.join("conversations.json"))
}

pub fn save_snapshot(snapshot: &CacheSnapshot) -> Result<()> {
    let cache_path = get_cache_path()?;
    let file = File::create(cache_path)?;
    serde_json::to_writer_pretty(file, snapshot)?;

    info!(
        "Saved session cache: {} conversations, {} groups",
        snapshot.conversations.len(),
        snapshot.groups.len()
    );
    Ok(())
}

pub fn load_snapshot() -> Result<Option<CacheSnapshot>> {
    let cache_path = get_cache_path()?;

    if !cache_path.exists() {
        return Ok(None);
    }

    let cache_path_str = cache_path.display().to_string();

    let mut file = File::open(cache_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let snapshot: CacheSnapshot = serde_json::from_str(&contents)?;
    info!(
        "Rehydrated {} conversations and {} groups from {}",
        snapshot.conversations.len(),
        snapshot.groups.len(),
        cache_path_str
    );

    Ok(Some(snapshot))
}
