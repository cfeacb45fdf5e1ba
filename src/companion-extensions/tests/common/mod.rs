//! Shared fixtures for the manager integration tests.
//!
//! Packages use the `native` runtime; their entry file names one of the
//! modules registered by [`native_loader`].

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;

use companion_extensions::{
    AiContext, Extension, ExtensionContext, ExtensionManager, ExtensionModule, ExtensionState,
    HookError, HookResult, MemorySettings, RuntimeConfig, StaticModuleLoader,
};

/// Ordered record of hook calls, shared by every module instance.
#[derive(Default)]
pub struct Journal {
    calls: Mutex<Vec<String>>,
}

impl Journal {
    pub fn push(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.calls.lock().iter().any(|c| c == call)
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// Records every fan-out hook as `<id>:<hook>`.
///
/// `on_user_message("remember X")` queues `X` as AI context,
/// `on_user_message("quiet N")` suppresses passive output for N seconds and
/// `on_app_start` writes `started` to the package log.
struct Recorder {
    journal: Arc<Journal>,
    context: Option<ExtensionContext>,
}

impl Recorder {
    fn id(&self) -> String {
        self.context
            .as_ref()
            .map(|ctx| ctx.extension_id().to_string())
            .unwrap_or_default()
    }

    fn record(&self, hook: &str) -> HookResult {
        self.journal.push(format!("{}:{hook}", self.id()));
        Ok(())
    }
}

impl Extension for Recorder {
    fn on_load(&mut self, context: &ExtensionContext) -> HookResult {
        self.context = Some(context.clone());
        self.record("on_load")
    }

    fn on_unload(&mut self) -> HookResult {
        self.record("on_unload")
    }

    fn on_app_start(&mut self) -> HookResult {
        if let Some(ctx) = &self.context {
            ctx.info("started");
        }
        self.record("on_app_start")
    }

    fn on_tick(&mut self, _state: &Value, _now: DateTime<Utc>) -> HookResult {
        self.record("on_tick")
    }

    fn on_user_message(&mut self, text: &str) -> HookResult {
        if let Some(ctx) = &self.context {
            if let Some(rest) = text.strip_prefix("remember ") {
                ctx.add_ai_context(rest);
            }
            if let Some(seconds) = text.strip_prefix("quiet ") {
                let seconds: f64 = seconds.parse().map_err(|_| HookError::msg("bad seconds"))?;
                ctx.suppress_passive_output(seconds);
            }
        }
        self.record("on_user_message")
    }

    fn get_ai_context(&mut self, user_text: &str) -> HookResult<AiContext> {
        Ok(format!("{} saw {user_text}", self.id()).into())
    }
}

/// Fails every tick.
struct TickBomb;

impl Extension for TickBomb {
    fn on_tick(&mut self, _state: &Value, _now: DateTime<Utc>) -> HookResult {
        Err(HookError::msg("RuntimeError: tick failed"))
    }
}

/// Asks to hold back passive output while the user is focused.
struct Blocker;

impl Extension for Blocker {
    fn should_block_passive(&mut self, reason: &str) -> HookResult<bool> {
        Ok(reason == "focus")
    }
}

/// Loader with the `recorder`, `quiet`, `bomb` and `blocker` modules.
pub fn native_loader(journal: &Arc<Journal>) -> StaticModuleLoader {
    let journal = Arc::clone(journal);
    StaticModuleLoader::new()
        .with_module("recorder", move || {
            let journal = Arc::clone(&journal);
            ExtensionModule::new("recorder").with_factory(move |_| {
                Ok(Box::new(Recorder {
                    journal: Arc::clone(&journal),
                    context: None,
                }) as Box<dyn Extension>)
            })
        })
        .with_module("quiet", || ExtensionModule::new("quiet"))
        .with_module("bomb", || ExtensionModule::new("bomb").with_singleton(TickBomb))
        .with_module("blocker", || ExtensionModule::new("blocker").with_singleton(Blocker))
}

/// Write a `native` package into `root/<dir>`.
pub fn write_package(root: &Path, dir: &str, id: &str, module: &str) -> PathBuf {
    let package = root.join(dir);
    fs::create_dir_all(&package).unwrap();
    fs::write(
        package.join(companion_extensions::MANIFEST_FILE),
        format!(r#"{{ "id": "{id}", "name": "{id} extension", "version": "1.0.0", "runtime": "native" }}"#),
    )
    .unwrap();
    fs::write(package.join("main"), module).unwrap();
    package
}

/// A manager over a fresh base directory.
pub struct Harness {
    pub temp: TempDir,
    pub settings: Arc<MemorySettings>,
    pub journal: Arc<Journal>,
    pub manager: ExtensionManager,
}

impl Harness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let settings = Arc::new(MemorySettings::new());
        let journal = Arc::new(Journal::default());
        let manager = build_manager(temp.path(), &settings, &journal);
        Self {
            temp,
            settings,
            journal,
            manager,
        }
    }

    pub fn base_dir(&self) -> &Path {
        self.temp.path()
    }

    pub fn root(&self) -> PathBuf {
        self.manager.extension_root()
    }

    /// Write a package under the managed root.
    pub fn add(&self, id: &str, module: &str) -> PathBuf {
        write_package(&self.root(), id, id, module)
    }

    /// A second manager sharing this one's base directory and settings.
    pub fn reopen(&self) -> ExtensionManager {
        build_manager(self.temp.path(), &self.settings, &self.journal)
    }

    pub fn state(&self, id: &str) -> ExtensionState {
        self.manager
            .export_state()
            .into_iter()
            .find(|state| state.id == id)
            .unwrap_or_else(|| panic!("no state for {id}"))
    }

    pub fn ids(&self) -> Vec<String> {
        self.manager
            .export_state()
            .into_iter()
            .map(|state| state.id)
            .collect()
    }

    pub fn log_messages(&self, id: &str) -> Vec<String> {
        self.manager
            .get_logs(id, 100)
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }
}

fn build_manager(
    base_dir: &Path,
    settings: &Arc<MemorySettings>,
    journal: &Arc<Journal>,
) -> ExtensionManager {
    let mut manager =
        ExtensionManager::new(RuntimeConfig::with_base_dir(base_dir), settings.clone()).unwrap();
    manager.register_loader("native", native_loader(journal));
    manager
}
