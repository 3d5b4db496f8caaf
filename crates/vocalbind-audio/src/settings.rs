//! Persisted preset values.
//!
//! Values are stored as plain `f32` under string keys. `None` from
//! [`SettingsStore::get_f32`] means the key was never written; an explicit
//! `0.0` is a real value and is never replaced by a default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vocalbind_core::PresetName;

/// Key holding the Deep preset's semitone value
pub const DEEP_KEY: &str = "deepSemis";
/// Key holding the High preset's semitone value
pub const HIGH_KEY: &str = "highSemis";

/// Deep preset value when nothing is stored
pub const DEFAULT_DEEP: f32 = -6.0;
/// High preset value when nothing is stored
pub const DEFAULT_HIGH: f32 = 7.0;

/// Current settings file version
const SETTINGS_VERSION: u32 = 1;

/// Storage key for a configurable preset (`None` for Normal)
pub const fn preset_key(name: PresetName) -> Option<&'static str> {
    match name {
        PresetName::Deep => Some(DEEP_KEY),
        PresetName::High => Some(HIGH_KEY),
        PresetName::Normal => None,
    }
}

/// Value a preset resolves to when its key is unset
pub const fn default_value(name: PresetName) -> f32 {
    match name {
        PresetName::Deep => DEFAULT_DEEP,
        PresetName::High => DEFAULT_HIGH,
        PresetName::Normal => 0.0,
    }
}

/// Key-value store for preset settings
pub trait SettingsStore: Send {
    /// Stored value, or `None` if the key was never set
    fn get_f32(&self, key: &str) -> Option<f32>;

    /// Store a value, persisting it if the store is backed by storage
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be persisted
    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), SettingsError>;

    /// Pick up changes made outside this process. No-op for stores without
    /// backing storage.
    ///
    /// # Errors
    ///
    /// Returns error if the backing storage cannot be read
    fn reload(&mut self) -> Result<(), SettingsError> {
        Ok(())
    }
}

/// Ephemeral store; nothing survives the process
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    values: BTreeMap<String, f32>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: &str, value: f32) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl SettingsStore for MemorySettings {
    fn get_f32(&self, key: &str) -> Option<f32> {
        self.values.get(key).copied()
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// On-disk layout of the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsDocument {
    /// Format version for future compatibility
    version: u32,

    #[serde(default)]
    values: BTreeMap<String, f32>,
}

impl Default for SettingsDocument {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            values: BTreeMap::new(),
        }
    }
}

/// RON file store, rewritten on every `set_f32`
#[derive(Debug)]
pub struct RonSettingsFile {
    path: PathBuf,
    doc: SettingsDocument,
}

impl RonSettingsFile {
    /// Load the file at `path`. A missing file is an empty store; it is
    /// created on the first write.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let doc: SettingsDocument = ron::from_str(&text)
                    .map_err(|e| SettingsError::Deserialization(e.to_string()))?;
                if doc.version > SETTINGS_VERSION {
                    return Err(SettingsError::UnsupportedVersion(doc.version));
                }
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {}, starting empty", path.display());
                SettingsDocument::default()
            }
            Err(e) => return Err(SettingsError::Io(e.to_string())),
        };
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, picking up edits made by another process
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn refresh(&mut self) -> Result<(), SettingsError> {
        *self = Self::open(&self.path)?;
        Ok(())
    }

    fn save(&self) -> Result<(), SettingsError> {
        let text = ron::ser::to_string_pretty(&self.doc, ron::ser::PrettyConfig::default())
            .map_err(|e| SettingsError::Serialization(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| SettingsError::Io(e.to_string()))?;
        Ok(())
    }
}

impl SettingsStore for RonSettingsFile {
    fn get_f32(&self, key: &str) -> Option<f32> {
        self.doc.values.get(key).copied()
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), SettingsError> {
        self.doc.values.insert(key.to_string(), value);
        self.save()
    }

    fn reload(&mut self) -> Result<(), SettingsError> {
        self.refresh()
    }
}

/// Settings persistence errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    #[error("Unsupported settings version: {0}")]
    UnsupportedVersion(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_preset_keys() {
        assert_eq!(preset_key(PresetName::Deep), Some("deepSemis"));
        assert_eq!(preset_key(PresetName::High), Some("highSemis"));
        assert_eq!(preset_key(PresetName::Normal), None);
        assert_eq!(default_value(PresetName::Deep), -6.0);
        assert_eq!(default_value(PresetName::High), 7.0);
    }

    #[test]
    fn test_memory_unset_vs_zero() {
        let mut store = MemorySettings::new();
        assert_eq!(store.get_f32(DEEP_KEY), None);

        store.set_f32(DEEP_KEY, 0.0).unwrap();
        assert_eq!(store.get_f32(DEEP_KEY), Some(0.0));
    }

    #[test]
    fn test_ron_file_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.ron");

        let mut store = RonSettingsFile::open(&path).unwrap();
        assert_eq!(store.get_f32(HIGH_KEY), None);
        assert!(!path.exists());

        store.set_f32(HIGH_KEY, 5.5).unwrap();
        assert!(path.exists());

        let reopened = RonSettingsFile::open(&path).unwrap();
        assert_eq!(reopened.get_f32(HIGH_KEY), Some(5.5));
        assert_eq!(reopened.get_f32(DEEP_KEY), None);
    }

    #[test]
    fn test_ron_file_refresh_sees_external_edit() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.ron");

        let mut ours = RonSettingsFile::open(&path).unwrap();
        ours.set_f32(DEEP_KEY, -6.0).unwrap();

        let mut theirs = RonSettingsFile::open(&path).unwrap();
        theirs.set_f32(DEEP_KEY, -9.0).unwrap();

        assert_eq!(ours.get_f32(DEEP_KEY), Some(-6.0));
        ours.refresh().unwrap();
        assert_eq!(ours.get_f32(DEEP_KEY), Some(-9.0));
    }

    #[test]
    fn test_ron_file_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.ron");
        std::fs::write(&path, "not ron at all {").unwrap();

        assert!(matches!(
            RonSettingsFile::open(&path),
            Err(SettingsError::Deserialization(_))
        ));
    }

    #[test]
    fn test_ron_file_rejects_future_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.ron");
        std::fs::write(&path, "(version: 2, values: {})").unwrap();

        assert!(matches!(
            RonSettingsFile::open(&path),
            Err(SettingsError::UnsupportedVersion(2))
        ));
    }
}
