//! Small persisted key-value preferences (e.g. the last viewed month).

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};

pub const LAST_VIEWED_MONTH: &str = "last-viewed-month";

pub trait Preferences: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Preferences kept in memory only.
#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Preferences for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Preferences stored as a flat TOML table.
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FilePreferences {
    /// Open the file at `path`. A missing or unreadable file starts empty.
    pub fn open(path: PathBuf) -> Self {
        let values = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| toml::from_str(&content).ok())
            .unwrap_or_default();

        FilePreferences {
            path,
            values: Mutex::new(values),
        }
    }

    fn save(&self, values: &BTreeMap<String, String>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string(values).map_err(|e| StoreError::Preferences(e.to_string()))?;

        let temp = self.path.with_extension("toml.tmp");
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

impl Preferences for FilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut values = self.values.lock();
        if values.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }
}
