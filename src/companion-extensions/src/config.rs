//! Extension runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ExtensionError, Result};

/// Extension runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Host base directory
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Managed extension root (defaults to `<base_dir>/extensions`)
    #[serde(default)]
    pub extension_root: Option<PathBuf>,

    /// Host data directory (defaults to `<base_dir>/data`)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Package descriptor file name
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    /// In-memory log entries kept per extension
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Queued AI context lines kept between drains
    #[serde(default = "default_ai_context_capacity")]
    pub ai_context_capacity: usize,

    /// Default hook timeout for out-of-process extensions (in milliseconds)
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,

    /// Whether the scanner skips dot-directories
    #[serde(default = "default_true")]
    pub skip_hidden_dirs: bool,

    /// Host settings key holding the enabled map
    #[serde(default = "default_settings_key")]
    pub settings_key: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            extension_root: None,
            data_dir: None,
            manifest_file: default_manifest_file(),
            log_capacity: default_log_capacity(),
            ai_context_capacity: default_ai_context_capacity(),
            hook_timeout_ms: default_hook_timeout_ms(),
            skip_hidden_dirs: true,
            settings_key: default_settings_key(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration rooted at the given base directory.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.manifest_file.trim().is_empty() {
            return Err(ExtensionError::Config(
                "manifest_file cannot be empty".to_string(),
            ));
        }
        if self.manifest_file.contains(['/', '\\']) {
            return Err(ExtensionError::Config(format!(
                "manifest_file must be a bare file name: {}",
                self.manifest_file
            )));
        }
        if self.log_capacity == 0 {
            return Err(ExtensionError::Config(
                "log_capacity must be greater than zero".to_string(),
            ));
        }
        if self.hook_timeout_ms == 0 || self.hook_timeout_ms > HOOK_TIMEOUT_MS_MAX {
            return Err(ExtensionError::Config(format!(
                "hook_timeout_ms must be within 1..={HOOK_TIMEOUT_MS_MAX}"
            )));
        }
        Ok(())
    }

    /// Managed extension root.
    pub fn extension_root(&self) -> PathBuf {
        self.extension_root
            .clone()
            .unwrap_or_else(|| self.base_dir.join(crate::EXTENSION_DIR))
    }

    /// Host data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("data"))
    }

    /// Per-extension private data directory: `<data>/extensions/<id>`.
    pub fn extension_data_dir(&self, extension_id: &str) -> PathBuf {
        self.data_dir()
            .join(crate::EXTENSION_DIR)
            .join(extension_id)
    }
}

/// Upper bound for any hook timeout.
pub const HOOK_TIMEOUT_MS_MAX: u64 = 300_000;

fn default_base_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("companion"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_manifest_file() -> String {
    crate::MANIFEST_FILE.to_string()
}

fn default_log_capacity() -> usize {
    500
}

fn default_ai_context_capacity() -> usize {
    50
}

fn default_hook_timeout_ms() -> u64 {
    5_000
}

fn default_settings_key() -> String {
    "extensions_enabled".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::with_base_dir("/opt/pet");
        assert_eq!(config.extension_root(), PathBuf::from("/opt/pet/extensions"));
        assert_eq!(config.data_dir(), PathBuf::from("/opt/pet/data"));
        assert_eq!(
            config.extension_data_dir("weather"),
            PathBuf::from("/opt/pet/data/extensions/weather")
        );
        assert_eq!(config.log_capacity, 500);
        assert_eq!(config.ai_context_capacity, 50);
        assert_eq!(config.manifest_file, "extension.json");
    }

    #[test]
    fn test_parse_toml_overrides() {
        let config = RuntimeConfig::parse(
            r#"
base_dir = "/srv/pet"
extension_root = "/srv/addons"
hook_timeout_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.extension_root(), PathBuf::from("/srv/addons"));
        assert_eq!(config.data_dir(), PathBuf::from("/srv/pet/data"));
        assert_eq!(config.hook_timeout_ms, 250);
        assert!(config.skip_hidden_dirs);
    }

    #[test]
    fn test_rejects_nested_manifest_name() {
        let err = RuntimeConfig::parse("manifest_file = \"meta/extension.json\"").unwrap_err();
        assert!(err.to_string().contains("bare file name"));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = RuntimeConfig::parse("hook_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("hook_timeout_ms"));
    }
}
