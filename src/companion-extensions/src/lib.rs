//! # Companion Extension Runtime
//!
//! Discovers third-party extension packages under a managed root, loads them,
//! fans host events out to them and manages their install lifecycle.
//!
//! ## Package Structure
//!
//! ```text
//! extensions/
//! └── weather/
//!     ├── extension.json   # Package descriptor
//!     └── main             # Entry point (executable for the `process` runtime)
//! ```
//!
//! Private package data and logs live under `<data>/extensions/<id>/`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use companion_extensions::{ExtensionManager, HookEvent, JsonFileSettings, RuntimeConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RuntimeConfig::with_base_dir("/home/me/.local/share/companion");
//!     let settings = Arc::new(JsonFileSettings::new(config.base_dir.join("settings.json")));
//!     let manager = ExtensionManager::new(config, settings)?;
//!
//!     let report = manager.load_all();
//!     println!("{} extension(s) loaded", report.loaded.len());
//!
//!     manager.dispatch(&HookEvent::AppReady);
//!     for line in manager.collect_ai_context("what's the weather like?") {
//!         println!("{line}");
//!     }
//!
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod extension;
pub mod logs;
pub mod manager;
pub mod manifest;
pub mod module;
pub mod process;
pub mod record;
pub mod scanner;
pub mod settings;

// Re-exports for convenience
pub use config::RuntimeConfig;
pub use context::{ExtensionContext, HostServices};
pub use error::{ExtensionError, HookError, HookResult, Result};
pub use extension::{AiContext, Extension, ExtensionPanel, HookEvent, PanelHandle};
pub use logs::{LogBook, LogEntry, LogLevel};
pub use manager::{DispatchReport, ExtensionManager, ExtensionState, InstallOutcome, LoadReport};
pub use manifest::PackageDescriptor;
pub use module::{
    ExtensionModule, ExtensionType, LoaderRegistry, ModuleLoader, ResolutionKind,
    StaticModuleLoader,
};
pub use process::{JsonPanel, ProcessLoader};
pub use record::{ExtensionRecord, HookOutcome, RecordState};
pub use settings::{EnabledMap, JsonFileSettings, MemorySettings, SettingsStore};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package descriptor file name.
pub const MANIFEST_FILE: &str = "extension.json";

/// Directory name used for the extension root and per-extension data.
pub const EXTENSION_DIR: &str = "extensions";
