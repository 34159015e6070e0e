//! Persisted settings.
//!
//! A small keyed store of strings, durable across sessions. Holds the
//! active public identity and, for the local-secret backend, the secret
//! itself, under fixed names. Writes go through a temp file and rename so a
//! crash never leaves a half-written file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Fixed name the active public identity is stored under.
pub const PUBKEY_SETTING: &str = "chateau:pubkey";
/// Fixed name the local secret is stored under (never set for extension
/// identities).
pub const SECRET_SETTING: &str = "chateau:nsec";

struct SettingsInner {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

/// Durable key/value settings. Cheap to clone; clones share the file.
#[derive(Clone)]
pub struct Settings {
    inner: Arc<Mutex<SettingsInner>>,
}

impl Settings {
    /// Open settings at `path`, loading existing values if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(SettingsInner {
                path: Some(path),
                values,
            })),
        })
    }

    /// Settings that never touch disk, for tests and ephemeral sessions.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SettingsInner {
                path: None,
                values: BTreeMap::new(),
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.values.insert(key.to_string(), value.to_string());
        Self::persist(&inner)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.values.remove(key).is_some() {
            Self::persist(&inner)?;
        }
        Ok(())
    }

    fn persist(inner: &SettingsInner) -> Result<()> {
        let Some(ref path) = inner.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&inner.values)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SettingsInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let settings = Settings::in_memory();
        assert_eq!(settings.get(PUBKEY_SETTING), None);

        settings.set(PUBKEY_SETTING, "abc").unwrap();
        assert_eq!(settings.get(PUBKEY_SETTING).as_deref(), Some("abc"));

        settings.remove(PUBKEY_SETTING).unwrap();
        assert_eq!(settings.get(PUBKEY_SETTING), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        {
            let settings = Settings::open(&path).unwrap();
            settings.set(PUBKEY_SETTING, "deadbeef").unwrap();
            settings.set(SECRET_SETTING, "nsec1...").unwrap();
        }

        let reopened = Settings::open(&path).unwrap();
        assert_eq!(reopened.get(PUBKEY_SETTING).as_deref(), Some("deadbeef"));
        assert_eq!(reopened.get(SECRET_SETTING).as_deref(), Some("nsec1..."));
    }
}
