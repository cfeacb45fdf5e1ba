//! Host settings collaborator.
//!
//! The runtime only owns one key of the host settings: the enabled map
//! `{ "<extension id>": bool }`. Everything else in the settings object is
//! passed through untouched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::{ExtensionError, Result};

/// Persistent host settings.
pub trait SettingsStore: Send + Sync {
    /// Current settings object.
    fn snapshot(&self) -> Map<String, Value>;

    /// Shallow-merge `patch` into the settings and persist.
    fn merge(&self, patch: Map<String, Value>) -> Result<()>;
}

/// Settings kept in memory only.
#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<Map<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing settings object.
    pub fn with_values(values: Map<String, Value>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn snapshot(&self) -> Map<String, Value> {
        self.values.read().clone()
    }

    fn merge(&self, patch: Map<String, Value>) -> Result<()> {
        self.values.write().extend(patch);
        Ok(())
    }
}

/// Settings persisted as one JSON object on disk.
///
/// A missing or corrupt file reads as empty settings.
pub struct JsonFileSettings {
    path: PathBuf,
    cache: RwLock<Option<Map<String, Value>>>,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Map<String, Value> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                tracing::warn!("Failed to read settings {:?}: {}", self.path, e);
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::warn!("Settings file {:?} is not a JSON object; ignoring", self.path);
                Map::new()
            }
            Err(e) => {
                tracing::warn!("Settings file {:?} is corrupt; ignoring: {}", self.path, e);
                Map::new()
            }
        }
    }
}

impl SettingsStore for JsonFileSettings {
    fn snapshot(&self) -> Map<String, Value> {
        if let Some(cached) = self.cache.read().as_ref() {
            return cached.clone();
        }
        let mut cache = self.cache.write();
        cache.get_or_insert_with(|| self.read_file()).clone()
    }

    fn merge(&self, patch: Map<String, Value>) -> Result<()> {
        let mut cache = self.cache.write();
        let mut values = cache.take().unwrap_or_else(|| self.read_file());
        values.extend(patch);

        let data = serde_json::to_vec_pretty(&Value::Object(values.clone()))?;
        let written = atomic_write(&self.path, &data);
        *cache = Some(values);
        written.map_err(|e| {
            ExtensionError::Settings(format!("failed to write {}: {e}", self.path.display()))
        })
    }
}

/// Write via a temp file and rename so readers never see a partial file.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(data)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&temp_path, path)
}

/// Per-extension enabled flags.
pub type EnabledMap = BTreeMap<String, bool>;

/// Read the enabled map stored under `key`.
///
/// Values are coerced to booleans: `true`, non-zero numbers, non-empty
/// strings, arrays and objects count as enabled.
pub fn read_enabled_map(store: &dyn SettingsStore, key: &str) -> EnabledMap {
    let Some(Value::Object(raw)) = store.snapshot().remove(key) else {
        return EnabledMap::new();
    };
    raw.into_iter()
        .map(|(id, value)| (id, truthy(&value)))
        .collect()
}

/// Persist the enabled map under `key`.
pub fn write_enabled_map(store: &dyn SettingsStore, key: &str, map: &EnabledMap) -> Result<()> {
    let value: Map<String, Value> = map
        .iter()
        .map(|(id, enabled)| (id.clone(), Value::Bool(*enabled)))
        .collect();
    let mut patch = Map::new();
    patch.insert(key.to_string(), Value::Object(value));
    store.merge(patch)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
