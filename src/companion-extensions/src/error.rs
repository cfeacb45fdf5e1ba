//! Extension system error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the extension runtime to the host.
///
/// Nothing raised by package code ever becomes an `ExtensionError` directly:
/// package failures are recorded on the record or in its log. These variants
/// cover discovery, loading and the filesystem/archive operations.
#[derive(Error, Debug)]
pub enum ExtensionError {
    /// Extension not found.
    #[error("Extension not found: {0}")]
    NotFound(String),

    /// An extension directory with the same name is already installed.
    #[error("Extension already exists: {0}")]
    AlreadyExists(String),

    /// Invalid package descriptor.
    #[error("Invalid manifest {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    /// Directory does not look like a package.
    #[error("Not an extension package: {0}")]
    NotAPackage(PathBuf),

    /// Extension load error.
    #[error("Failed to load extension '{extension}': {message}")]
    LoadError { extension: String, message: String },

    /// No loader is registered for the requested runtime.
    #[error("Unsupported extension runtime '{runtime}' for '{extension}'")]
    UnsupportedRuntime { extension: String, runtime: String },

    /// Archive read/write failure.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Host settings could not be read or written.
    #[error("Settings error: {0}")]
    Settings(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ExtensionError {
    /// Create a load error.
    pub fn load_error(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadError {
            extension: extension.into(),
            message: message.into(),
        }
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ExtensionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ExtensionError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<zip::result::ZipError> for ExtensionError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

impl From<walkdir::Error> for ExtensionError {
    fn from(err: walkdir::Error) -> Self {
        Self::Io(err.into())
    }
}

/// Result type alias for extension runtime operations.
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Failure raised by package code while a hook runs.
///
/// These never cross the record boundary; the record turns them into a
/// `last_error` string or a package log line.
#[derive(Error, Debug)]
pub enum HookError {
    /// The package reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The package panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The package did not answer in time.
    #[error("timed out after {timeout_ms} ms waiting for {hook}")]
    Timeout { hook: String, timeout_ms: u64 },

    /// An out-of-process package broke the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error talking to the package.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HookError {
    /// Create a plain failure from any message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

impl From<anyhow::Error> for HookError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

impl From<ExtensionError> for HookError {
    fn from(err: ExtensionError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Result type alias for hook implementations.
pub type HookResult<T = ()> = std::result::Result<T, HookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExtensionError::NotFound("weather".to_string());
        assert_eq!(err.to_string(), "Extension not found: weather");
    }

    #[test]
    fn test_load_error() {
        let err = ExtensionError::load_error("weather", "entry not found");
        assert!(err.to_string().contains("weather"));
        assert!(err.to_string().contains("entry not found"));
    }

    #[test]
    fn test_hook_error_from_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(HookError::from_panic(payload).to_string(), "panicked: boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(
            HookError::from_panic(payload).to_string(),
            "panicked: owned boom"
        );
    }

    #[test]
    fn test_hook_error_from_anyhow_keeps_context() {
        let err: HookError = anyhow::anyhow!("disk full")
            .context("writing cache")
            .into();
        assert_eq!(err.to_string(), "writing cache: disk full");
    }
}
