//! Lifecycle of one extension package.
//!
//! A record moves `Unloaded -> Loading -> Loaded` and back through
//! `Unloading -> Unloaded`. Nothing raised by package code (errors or panics)
//! crosses this boundary: load failures land in `last_error`, hook failures
//! are written to the package log.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::ExtensionError;
use crate::context::{ExtensionContext, HostServices};
use crate::error::{HookError, HookResult};
use crate::extension::{Extension, HookEvent, PanelHandle};
use crate::logs::LogLevel;
use crate::manifest::PackageDescriptor;
use crate::module::{ExtensionModule, LoaderRegistry, ResolutionKind};

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Result of delivering one hook to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// The record is disabled or not loaded.
    Skipped,
    Delivered,
    /// The hook failed; the failure is in the package log.
    Failed,
}

/// Run package code, turning panics into [`HookError::Panicked`].
fn guarded<T>(f: impl FnOnce() -> HookResult<T>) -> HookResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(HookError::from_panic(payload)))
}

/// One discovered package and, while loaded, its live instance.
pub struct ExtensionRecord {
    descriptor: PackageDescriptor,
    enabled: bool,
    state: RecordState,
    last_error: String,
    module: Option<ExtensionModule>,
    instance: Option<Box<dyn Extension>>,
    resolution: Option<ResolutionKind>,
    panel: Option<PanelHandle>,
    context: Option<ExtensionContext>,
    services: HostServices,
}

impl std::fmt::Debug for ExtensionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRecord")
            .field("id", &self.descriptor.id)
            .field("enabled", &self.enabled)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("resolution", &self.resolution)
            .finish()
    }
}

impl ExtensionRecord {
    /// Create an unloaded record.
    pub fn new(descriptor: PackageDescriptor, enabled: bool, services: HostServices) -> Self {
        Self {
            descriptor,
            enabled,
            state: RecordState::Unloaded,
            last_error: String::new(),
            module: None,
            instance: None,
            resolution: None,
            panel: None,
            context: None,
            services,
        }
    }

    pub fn descriptor(&self) -> &PackageDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == RecordState::Loaded
    }

    /// Last load failure; empty when healthy.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// How the instance was resolved, while loaded.
    pub fn resolution(&self) -> Option<ResolutionKind> {
        self.resolution
    }

    pub fn has_panel(&self) -> bool {
        self.panel.is_some()
    }

    /// Context of the current load.
    pub fn context(&self) -> Option<&ExtensionContext> {
        self.context.as_ref()
    }

    /// Loaded module name, while loaded.
    pub fn module_name(&self) -> Option<&str> {
        self.module.as_ref().map(ExtensionModule::name)
    }

    /// Flip the enabled flag; disabling unloads.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.unload();
        }
        self.enabled = enabled;
    }

    /// Whether hooks may be delivered.
    fn is_active(&self) -> bool {
        self.enabled && self.state == RecordState::Loaded && self.instance.is_some()
    }

    // ========== Lifecycle ==========

    /// Load the package. Returns whether the record ended up loaded.
    ///
    /// No-op for disabled records. Either fully succeeds or leaves the record
    /// unloaded with `last_error` set.
    pub fn load(&mut self, loaders: &LoaderRegistry) -> bool {
        if !self.enabled {
            return false;
        }
        if self.state == RecordState::Loaded {
            return true;
        }

        self.state = RecordState::Loading;
        self.last_error.clear();
        match self.try_load(loaders) {
            Ok(()) => {
                self.state = RecordState::Loaded;
                tracing::info!(
                    extension = %self.descriptor.id,
                    resolution = ?self.resolution,
                    "Extension loaded"
                );
                true
            }
            Err(message) => {
                self.state = RecordState::Unloaded;
                tracing::warn!(
                    extension = %self.descriptor.id,
                    "Extension load failed: {}",
                    message
                );
                self.services.logs.append(
                    &self.descriptor.id,
                    LogLevel::Error,
                    &format!("load failed: {message}"),
                );
                self.last_error = message;
                false
            }
        }
    }

    fn try_load(&mut self, loaders: &LoaderRegistry) -> std::result::Result<(), String> {
        let entry = self.descriptor.entry_path();
        if !entry.is_file() {
            return Err(format!("entry not found: {}", entry.display()));
        }
        let loader = loaders.get(&self.descriptor.runtime).ok_or_else(|| {
            ExtensionError::UnsupportedRuntime {
                extension: self.descriptor.id.clone(),
                runtime: self.descriptor.runtime.clone(),
            }
            .to_string()
        })?;

        let context = ExtensionContext::new(
            &self.descriptor.id,
            &self.descriptor.root_dir,
            self.services.clone(),
        );
        let descriptor = &self.descriptor;
        let loaded = guarded(|| {
            let mut module = loader.load(descriptor)?;
            let (kind, mut instance) = module.resolve(&context)?;
            instance.on_load(&context)?;
            Ok((module, kind, instance))
        });

        match loaded {
            Ok((module, kind, instance)) => {
                self.module = Some(module);
                self.resolution = Some(kind);
                self.instance = Some(instance);
                self.context = Some(context);
                Ok(())
            }
            Err(e) => {
                context.detach();
                Err(e.to_string())
            }
        }
    }

    /// Tear down the live instance. Idempotent.
    ///
    /// Panel close and `on_unload` failures are logged and do not stop the
    /// rest of the teardown.
    pub fn unload(&mut self) {
        if self.state != RecordState::Loaded {
            return;
        }
        self.state = RecordState::Unloading;

        if let Some(panel) = self.panel.take() {
            if let Err(e) = guarded(|| panel.close()) {
                self.log_failure("panel close", &e);
            }
        }
        if let Some(mut instance) = self.instance.take() {
            if let Err(e) = guarded(|| instance.on_unload()) {
                self.log_failure("on_unload", &e);
            }
        }
        self.module = None;
        self.resolution = None;
        if let Some(context) = self.context.take() {
            context.detach();
        }

        self.state = RecordState::Unloaded;
        tracing::info!(extension = %self.descriptor.id, "Extension unloaded");
    }

    // ========== Hooks ==========

    /// Deliver one event.
    pub fn invoke(&mut self, event: &HookEvent) -> HookOutcome {
        if !self.is_active() {
            return HookOutcome::Skipped;
        }
        let Some(instance) = self.instance.as_mut() else {
            return HookOutcome::Skipped;
        };
        match guarded(|| event.deliver(&mut **instance)) {
            Ok(()) => HookOutcome::Delivered,
            Err(e) => {
                self.log_failure(event.name(), &e);
                HookOutcome::Failed
            }
        }
    }

    /// Pull-style AI context for `user_text`.
    pub fn get_ai_context(&mut self, user_text: &str) -> Vec<String> {
        if !self.is_active() {
            return Vec::new();
        }
        let Some(instance) = self.instance.as_mut() else {
            return Vec::new();
        };
        match guarded(|| instance.get_ai_context(user_text)) {
            Ok(context) => context.into_lines(),
            Err(e) => {
                self.log_failure("get_ai_context", &e);
                Vec::new()
            }
        }
    }

    /// Whether the package asks to hold back passive output.
    pub fn should_block_passive(&mut self, reason: &str) -> bool {
        if !self.is_active() {
            return false;
        }
        let Some(instance) = self.instance.as_mut() else {
            return false;
        };
        match guarded(|| instance.should_block_passive(reason)) {
            Ok(block) => block,
            Err(e) => {
                self.log_failure("should_block_passive", &e);
                false
            }
        }
    }

    /// Ask the package for its UI panel.
    ///
    /// A new panel replaces (and closes) the previous one.
    pub fn open_panel(&mut self, parent: &Value) -> Option<PanelHandle> {
        if !self.is_active() {
            return None;
        }
        let instance = self.instance.as_mut()?;
        let panel = match guarded(|| instance.get_panel(parent)) {
            Ok(panel) => panel?,
            Err(e) => {
                self.log_failure("get_panel", &e);
                return None;
            }
        };

        if let Some(previous) = self.panel.replace(Arc::clone(&panel)) {
            if !Arc::ptr_eq(&previous, &panel) {
                if let Err(e) = guarded(|| previous.close()) {
                    self.log_failure("panel close", &e);
                }
            }
        }
        Some(panel)
    }

    fn log_failure(&self, hook: &str, error: &HookError) {
        tracing::warn!(extension = %self.descriptor.id, hook, "Extension hook failed: {}", error);
        self.services
            .logs
            .append(&self.descriptor.id, LogLevel::Error, &format!("{hook} failed: {error}"));
    }
}

impl Drop for ExtensionRecord {
    fn drop(&mut self) {
        self.unload();
    }
}
