//! Remembered login: the username/room pair under two fixed keys in
//! `<data_dir>/session.json`.

use crate::core::config::{STORE_KEY_ROOM, STORE_KEY_USERNAME};
use crate::utils::atomic_write::atomic_write;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl SessionStore {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("session.json")
    }

    /// Load the store; a missing or unreadable file yields an empty store.
    pub fn load(data_dir: &Path) -> Self {
        let path = Self::path_in(data_dir);
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(values) => {
                    debug!(event = "session_store_loaded", path = %path.display(), "Session store loaded");
                    values
                }
                Err(e) => {
                    warn!(event = "session_store_parse_failure", path = %path.display(), error = %e, "Ignoring corrupt session store");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(event = "session_store_read_failure", path = %path.display(), error = %e, "Failed to read session store");
                BTreeMap::new()
            }
        };
        Self { path, values }
    }

    pub fn username(&self) -> Option<&str> {
        self.values.get(STORE_KEY_USERNAME).map(String::as_str)
    }

    pub fn room(&self) -> Option<&str> {
        self.values.get(STORE_KEY_ROOM).map(String::as_str)
    }

    /// Remember both values and persist.
    pub fn save(&mut self, username: &str, room: &str) -> Result<()> {
        self.values.insert(STORE_KEY_USERNAME.to_string(), username.to_string());
        self.values.insert(STORE_KEY_ROOM.to_string(), room.to_string());
        self.persist()
    }

    /// Forget both values and persist.
    pub fn clear(&mut self) -> Result<()> {
        self.values.remove(STORE_KEY_USERNAME);
        self.values.remove(STORE_KEY_ROOM);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.values)?;
        atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("saving {}", self.path.display()))
    }
}
