//! Package descriptor definitions.
//!
//! Every extension package carries an `extension.json` at its root:
//!
//! ```json
//! {
//!   "id": "weather",
//!   "name": "Weather",
//!   "version": "1.2.0",
//!   "description": "Reports the forecast",
//!   "entry": "bin/weather",
//!   "runtime": "process",
//!   "timeout_ms": 2000
//! }
//! ```
//!
//! Only `id` is required.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::{ExtensionError, Result};

/// Default entry point relative to the package root.
pub const DEFAULT_ENTRY: &str = "main";

/// Default package version.
pub const DEFAULT_VERSION: &str = "0.0.0";

/// Runtime used when the descriptor does not name one.
pub const DEFAULT_RUNTIME: &str = "process";

/// Scalar descriptor field; numbers and booleans read as their text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl From<Scalar> for String {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Text(text) => text,
            Scalar::Number(number) => number.to_string(),
            Scalar::Bool(flag) => flag.to_string(),
        }
    }
}

fn string_or_scalar<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(String::from))
}

/// Raw descriptor as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawDescriptor {
    #[serde(default, deserialize_with = "string_or_scalar")]
    id: Option<String>,
    #[serde(default, deserialize_with = "string_or_scalar")]
    name: Option<String>,
    #[serde(default, deserialize_with = "string_or_scalar")]
    version: Option<String>,
    #[serde(default, deserialize_with = "string_or_scalar")]
    description: Option<String>,
    #[serde(default)]
    entry: Option<String>,
    #[serde(default)]
    runtime: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Immutable record of one parsed package descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    /// Unique extension identifier
    pub id: String,

    /// Human-readable name (falls back to the id)
    pub name: String,

    /// Version string
    pub version: String,

    /// Description
    pub description: String,

    /// Entry point relative to `root_dir`
    pub entry: String,

    /// Loader runtime name
    pub runtime: String,

    /// Per-hook timeout override for out-of-process extensions
    pub timeout_ms: Option<u64>,

    /// Package directory
    pub root_dir: PathBuf,

    /// Descriptor file path
    pub manifest_path: PathBuf,
}

impl PackageDescriptor {
    /// Load and validate a descriptor file.
    pub fn from_file(manifest_path: impl AsRef<Path>) -> Result<Self> {
        let manifest_path = manifest_path.as_ref();
        let content = std::fs::read_to_string(manifest_path).map_err(|e| {
            ExtensionError::invalid_manifest(manifest_path, format!("unreadable: {e}"))
        })?;
        Self::parse(&content, manifest_path)
    }

    /// Parse a descriptor from its JSON text.
    pub fn parse(content: &str, manifest_path: &Path) -> Result<Self> {
        let raw: RawDescriptor = serde_json::from_str(content).map_err(|e| {
            ExtensionError::invalid_manifest(manifest_path, format!("malformed JSON: {e}"))
        })?;

        let id = trimmed(raw.id);
        validate_id(&id)
            .map_err(|message| ExtensionError::invalid_manifest(manifest_path, message))?;

        let entry = trimmed(raw.entry);
        let entry = if entry.is_empty() {
            DEFAULT_ENTRY.to_string()
        } else {
            entry
        };
        validate_entry(&entry)
            .map_err(|message| ExtensionError::invalid_manifest(manifest_path, message))?;

        let name = trimmed(raw.name);
        let version = trimmed(raw.version);
        let runtime = trimmed(raw.runtime);
        let root_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(Self {
            name: if name.is_empty() { id.clone() } else { name },
            version: if version.is_empty() {
                DEFAULT_VERSION.to_string()
            } else {
                version
            },
            description: trimmed(raw.description),
            entry,
            runtime: if runtime.is_empty() {
                DEFAULT_RUNTIME.to_string()
            } else {
                runtime
            },
            timeout_ms: raw.timeout_ms,
            root_dir,
            manifest_path: manifest_path.to_path_buf(),
            id,
        })
    }

    /// Absolute path of the entry point.
    pub fn entry_path(&self) -> PathBuf {
        self.root_dir.join(&self.entry)
    }

    /// Name of the package directory (the install target name).
    pub fn dir_name(&self) -> Option<&str> {
        self.root_dir.file_name().and_then(|n| n.to_str())
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

/// Check that `id` is usable as a single storage path component.
///
/// Any text is accepted except path separators, NUL and a leading `.`.
pub fn validate_id(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() {
        return Err("missing id".to_string());
    }
    if id.starts_with('.') {
        return Err(format!("id must not start with '.': {id}"));
    }
    if id.contains(['/', '\\', '\0']) {
        return Err(format!("id must not contain path separators or NUL: {id:?}"));
    }
    Ok(())
}

fn validate_entry(entry: &str) -> std::result::Result<(), String> {
    let path = Path::new(entry);
    if path.is_absolute() {
        return Err(format!("entry must be relative: {entry}"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("entry must not contain parent traversals: {entry}"));
    }
    Ok(())
}
