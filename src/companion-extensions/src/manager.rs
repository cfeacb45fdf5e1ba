//! Extension manager - the main interface for the extension runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

use crate::archive;
use crate::config::RuntimeConfig;
use crate::context::HostServices;
use crate::extension::{HookEvent, PanelHandle};
use crate::logs::LogEntry;
use crate::manifest::PackageDescriptor;
use crate::module::{LoaderRegistry, ModuleLoader, ResolutionKind};
use crate::record::{ExtensionRecord, HookOutcome};
use crate::scanner::{self, InvalidManifest, ScanOptions};
use crate::settings::{self, EnabledMap, SettingsStore};
use crate::{ExtensionError, Result};

type SharedRecord = Arc<Mutex<ExtensionRecord>>;
type RecordTable = BTreeMap<String, SharedRecord>;

/// Presentation row for one known extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionState {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub enabled: bool,
    pub loaded: bool,
    pub error: String,
    pub path: PathBuf,
    pub runtime: String,
    pub resolution: Option<ResolutionKind>,
}

/// Outcome of a full (re)load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Ids that loaded
    pub loaded: Vec<String>,
    /// Ids skipped because they are disabled
    pub disabled: Vec<String>,
    /// Ids that failed to load, with the error
    pub failed: Vec<(String, String)>,
    /// Descriptor files that could not be parsed
    pub invalid: Vec<InvalidManifest>,
}

impl LoadReport {
    /// Number of discovered packages.
    pub fn discovered(&self) -> usize {
        self.loaded.len() + self.disabled.len() + self.failed.len()
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Outcome of an install or import.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    /// Ids of the installed packages
    pub installed: Vec<String>,
    /// Directories created under the extension root
    pub paths: Vec<PathBuf>,
    /// Result of the reload that followed
    pub report: LoadReport,
}

/// Extension manager.
///
/// Owns the record table and the shared host state packages write into.
/// Hook fan-out works on a snapshot of the table; management operations
/// build a new table and swap it in.
pub struct ExtensionManager {
    /// Configuration
    config: RuntimeConfig,

    /// Host settings holding the enabled map
    settings: Arc<dyn SettingsStore>,

    /// Loaders by runtime name
    loaders: LoaderRegistry,

    /// Logs, AI context queue and passive gate
    services: HostServices,

    /// Current record table
    records: RwLock<Arc<RecordTable>>,

    /// Serializes management operations
    admin: Mutex<()>,
}

impl ExtensionManager {
    /// Create a manager with the built-in `process` loader.
    pub fn new(config: RuntimeConfig, settings: Arc<dyn SettingsStore>) -> Result<Self> {
        config.validate()?;
        let loaders = LoaderRegistry::with_defaults(config.hook_timeout_ms);
        let services = HostServices::from_config(&config);
        Ok(Self {
            config,
            settings,
            loaders,
            services,
            records: RwLock::new(Arc::new(RecordTable::new())),
            admin: Mutex::new(()),
        })
    }

    /// Register a loader for `runtime`. Takes effect on the next load.
    pub fn register_loader(
        &mut self,
        runtime: impl Into<String>,
        loader: impl ModuleLoader + 'static,
    ) {
        self.loaders.register(runtime, loader);
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Managed extension root.
    pub fn extension_root(&self) -> PathBuf {
        self.config.extension_root()
    }

    /// Shared host services.
    pub fn services(&self) -> &HostServices {
        &self.services
    }

    fn snapshot(&self) -> Arc<RecordTable> {
        Arc::clone(&self.records.read())
    }

    fn swap(&self, table: RecordTable) {
        *self.records.write() = Arc::new(table);
    }

    fn record(&self, id: &str) -> Option<SharedRecord> {
        self.snapshot().get(id.trim()).cloned()
    }

    // ========== Discovery and Loading ==========

    /// Scan the extension root and rebuild the record table.
    ///
    /// Every previous record is unloaded first (records whose id disappeared
    /// before the others), then one record per descriptor is built, enabled
    /// ones are loaded, and the new table replaces the old one.
    pub fn load_all(&self) -> LoadReport {
        let _admin = self.admin.lock();
        self.load_all_locked()
    }

    /// Same as [`ExtensionManager::load_all`].
    pub fn reload_all(&self) -> LoadReport {
        self.load_all()
    }

    fn load_all_locked(&self) -> LoadReport {
        let root = self.extension_root();
        let scan = scanner::scan_manifests(&root, &self.scan_options());
        let enabled_map = self.enabled_map();

        let previous = self.snapshot();
        let (gone, kept): (Vec<_>, Vec<_>) = previous
            .iter()
            .partition(|(id, _)| !scan.descriptors.iter().any(|d| &d.id == *id));
        for (id, record) in gone.into_iter().chain(kept) {
            tracing::debug!(extension = %id, "Unloading before rescan");
            record.lock().unload();
        }

        let mut report = LoadReport {
            invalid: scan.invalid,
            ..Default::default()
        };
        let mut table = RecordTable::new();
        for descriptor in scan.descriptors {
            let enabled = enabled_map.get(&descriptor.id).copied().unwrap_or(true);
            let record = self.build_record(descriptor, enabled);
            match (record.enabled(), record.is_loaded()) {
                (false, _) => report.disabled.push(record.id().to_string()),
                (true, true) => report.loaded.push(record.id().to_string()),
                (true, false) => report
                    .failed
                    .push((record.id().to_string(), record.last_error().to_string())),
            }
            table.insert(record.id().to_string(), Arc::new(Mutex::new(record)));
        }
        self.swap(table);

        tracing::info!(
            "Extensions loaded: {} loaded, {} disabled, {} failed, {} invalid",
            report.loaded.len(),
            report.disabled.len(),
            report.failed.len(),
            report.invalid.len()
        );
        report
    }

    /// Unload and rebuild one record from a fresh scan.
    ///
    /// Returns whether the record ended up loaded. If the package is gone
    /// from disk its record is dropped and `NotFound` is returned.
    pub fn reload_one(&self, id: &str) -> Result<bool> {
        let _admin = self.admin.lock();
        self.reload_one_locked(id.trim())
    }

    fn reload_one_locked(&self, id: &str) -> Result<bool> {
        if id.is_empty() {
            return Err(ExtensionError::NotFound(String::new()));
        }
        if let Some(record) = self.record(id) {
            record.lock().unload();
        }

        let scan = scanner::scan_manifests(&self.extension_root(), &self.scan_options());
        let descriptor = scan.descriptors.into_iter().find(|d| d.id == id);

        let mut table = RecordTable::clone(&self.snapshot());
        let Some(descriptor) = descriptor else {
            table.remove(id);
            self.swap(table);
            return Err(ExtensionError::NotFound(id.to_string()));
        };

        let enabled = self.enabled_map().get(id).copied().unwrap_or(true);
        let record = self.build_record(descriptor, enabled);
        let loaded = record.is_loaded();
        table.insert(id.to_string(), Arc::new(Mutex::new(record)));
        self.swap(table);
        Ok(loaded)
    }

    fn build_record(&self, descriptor: PackageDescriptor, enabled: bool) -> ExtensionRecord {
        let mut record = ExtensionRecord::new(descriptor, enabled, self.services.clone());
        record.load(&self.loaders);
        record
    }

    fn scan_options(&self) -> ScanOptions<'_> {
        ScanOptions {
            manifest_file: &self.config.manifest_file,
            skip_hidden_dirs: self.config.skip_hidden_dirs,
        }
    }

    /// Unload every record.
    pub fn shutdown(&self) {
        let _admin = self.admin.lock();
        for record in self.snapshot().values() {
            record.lock().unload();
        }
        tracing::info!("Extension runtime shut down");
    }

    // ========== Enabled State ==========

    /// Persisted enabled map.
    pub fn enabled_map(&self) -> EnabledMap {
        settings::read_enabled_map(self.settings.as_ref(), &self.config.settings_key)
    }

    /// Enable or disable an extension.
    ///
    /// Enabling reloads it; disabling unloads it but keeps its record so its
    /// metadata and last error stay visible.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ExtensionError::NotFound(String::new()));
        }
        let _admin = self.admin.lock();

        let mut map = self.enabled_map();
        map.insert(id.to_string(), enabled);
        settings::write_enabled_map(self.settings.as_ref(), &self.config.settings_key, &map)?;

        if enabled {
            match self.reload_one_locked(id) {
                Ok(_) | Err(ExtensionError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        } else if let Some(record) = self.record(id) {
            record.lock().set_enabled(false);
        }
        tracing::info!(extension = %id, enabled, "Extension enabled state changed");
        Ok(())
    }

    // ========== Hooks ==========

    /// Deliver `event` to every enabled and loaded extension, in id order.
    ///
    /// Failures are contained per extension.
    pub fn dispatch(&self, event: &HookEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (id, record) in self.snapshot().iter() {
            let mut record = record.lock();
            if !record.enabled() || !record.is_loaded() {
                continue;
            }
            match record.invoke(event) {
                HookOutcome::Delivered => report.delivered.push(id.clone()),
                HookOutcome::Failed => report.failed.push(id.clone()),
                HookOutcome::Skipped => {}
            }
        }
        report
    }

    /// Drain queued AI context, then append pull-style context from every
    /// loaded extension.
    pub fn collect_ai_context(&self, user_text: &str) -> Vec<String> {
        let mut collected = self.services.ai_context.drain();
        for record in self.snapshot().values() {
            collected.extend(record.lock().get_ai_context(user_text));
        }
        collected
    }

    /// Whether passive output should be held back: the suppression window is
    /// open, or any loaded extension asks for it.
    pub fn should_block_passive(&self, reason: &str) -> bool {
        if self.services.passive.is_active() {
            return true;
        }
        self.snapshot()
            .values()
            .any(|record| record.lock().should_block_passive(reason))
    }

    /// Open the UI panel of a loaded extension.
    pub fn open_panel(&self, id: &str, parent: &Value) -> Option<PanelHandle> {
        self.record(id)?.lock().open_panel(parent)
    }

    // ========== Package Management ==========

    /// Install a package directory into the extension root.
    ///
    /// `source` must have a descriptor at its top level. The copy lands in
    /// `<root>/<source dir name>` and fails if that already exists.
    pub fn install_from_directory(&self, source: &Path) -> Result<InstallOutcome> {
        let _admin = self.admin.lock();
        if !source.is_dir() {
            return Err(ExtensionError::NotFound(source.display().to_string()));
        }
        if !scanner::is_package_dir(source, &self.config.manifest_file) {
            return Err(ExtensionError::NotAPackage(source.to_path_buf()));
        }
        let source = source.canonicalize()?;
        let descriptor = PackageDescriptor::from_file(source.join(&self.config.manifest_file))?;
        let name = dir_name(&source)?;

        let root = self.extension_root();
        let target = root.join(&name);
        if target.exists() {
            return Err(ExtensionError::AlreadyExists(name));
        }

        self.stage_and_switch(&[(source.as_path(), name.as_str())])?;
        tracing::info!(extension = %descriptor.id, "Installed extension from {:?}", source);

        let report = self.load_all_locked();
        Ok(InstallOutcome {
            installed: vec![descriptor.id],
            paths: vec![target],
            report,
        })
    }

    /// Import one or more packages from a zip archive.
    ///
    /// Packages are the archive's top-level directories that carry a
    /// descriptor (or the archive root itself). Nothing is installed if any
    /// target name already exists.
    pub fn import_from_archive(&self, archive_path: &Path) -> Result<InstallOutcome> {
        let _admin = self.admin.lock();
        if !archive_path.is_file() {
            return Err(ExtensionError::NotFound(archive_path.display().to_string()));
        }

        let extracted = tempfile::Builder::new().prefix("companion-import-").tempdir()?;
        archive::extract_zip(archive_path, extracted.path())?;

        let manifest_file = &self.config.manifest_file;
        let mut packages: Vec<(PathBuf, String)> =
            if scanner::is_package_dir(extracted.path(), manifest_file) {
                let stem = archive_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("extension")
                    .to_string();
                check_target_name(archive_path, &stem)?;
                vec![(extracted.path().to_path_buf(), stem)]
            } else {
                scanner::find_package_dirs(extracted.path(), manifest_file)
                    .into_iter()
                    .map(|dir| dir_name(&dir).map(|name| (dir, name)))
                    .collect::<Result<_>>()?
            };
        if packages.is_empty() {
            return Err(ExtensionError::NotAPackage(archive_path.to_path_buf()));
        }
        packages.sort_by(|a, b| a.1.cmp(&b.1));

        let mut ids = Vec::with_capacity(packages.len());
        for (dir, _) in &packages {
            ids.push(PackageDescriptor::from_file(dir.join(manifest_file))?.id);
        }

        let root = self.extension_root();
        let collisions: Vec<&str> = packages
            .iter()
            .map(|(_, name)| name.as_str())
            .filter(|name| root.join(name).exists())
            .collect();
        if !collisions.is_empty() {
            return Err(ExtensionError::AlreadyExists(collisions.join(", ")));
        }

        let sources: Vec<(&Path, &str)> = packages
            .iter()
            .map(|(dir, name)| (dir.as_path(), name.as_str()))
            .collect();
        self.stage_and_switch(&sources)?;
        tracing::info!("Imported {} extension(s) from {:?}", ids.len(), archive_path);

        let paths = packages.iter().map(|(_, name)| root.join(name)).collect();
        let report = self.load_all_locked();
        Ok(InstallOutcome {
            installed: ids,
            paths,
            report,
        })
    }

    /// Copy every source into a hidden staging directory under the root, then
    /// rename each into place. On failure nothing is left installed.
    fn stage_and_switch(&self, sources: &[(&Path, &str)]) -> Result<()> {
        let root = self.extension_root();
        std::fs::create_dir_all(&root)?;
        let staging = tempfile::Builder::new().prefix(".staging-").tempdir_in(&root)?;

        for (source, name) in sources {
            archive::copy_dir_recursive(source, &staging.path().join(name))?;
        }

        let mut switched: Vec<PathBuf> = Vec::with_capacity(sources.len());
        for (_, name) in sources {
            let target = root.join(name);
            if let Err(e) = std::fs::rename(staging.path().join(name), &target) {
                for done in &switched {
                    if let Err(cleanup) = std::fs::remove_dir_all(done) {
                        tracing::warn!("Failed to roll back {:?}: {}", done, cleanup);
                    }
                }
                return Err(e.into());
            }
            switched.push(target);
        }
        Ok(())
    }

    /// Write one package's directory into a zip archive.
    pub fn export_to_archive(&self, id: &str, archive_path: &Path) -> Result<PathBuf> {
        let record = self
            .record(id)
            .ok_or_else(|| ExtensionError::NotFound(id.trim().to_string()))?;
        let package_dir = record.lock().descriptor().root_dir.clone();
        let count = archive::export_dir(&package_dir, archive_path)?;
        tracing::info!(extension = %id.trim(), "Exported {} files to {:?}", count, archive_path);
        Ok(archive_path.to_path_buf())
    }

    /// Remove an installed package.
    ///
    /// The id is dropped from the enabled map first, then the directory is
    /// renamed aside and deleted. A failure before the rename leaves the
    /// package installed and loaded again; a failure while deleting is
    /// reported after the table has been rebuilt from disk.
    pub fn uninstall(&self, id: &str) -> Result<()> {
        let id = id.trim();
        let _admin = self.admin.lock();
        let record = self
            .record(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;

        let package_dir = {
            let mut record = record.lock();
            record.unload();
            record.descriptor().root_dir.clone()
        };

        let root = self.extension_root();
        if package_dir == root || !package_dir.starts_with(&root) {
            self.restore_after_failed_uninstall(id);
            return Err(ExtensionError::load_error(
                id,
                format!(
                    "refusing to delete {} outside the extension root",
                    package_dir.display()
                ),
            ));
        }

        let previous = self.enabled_map();
        let mut map = previous.clone();
        map.remove(id);
        if let Err(e) =
            settings::write_enabled_map(self.settings.as_ref(), &self.config.settings_key, &map)
        {
            tracing::warn!(extension = %id, "Uninstall aborted, settings not written: {}", e);
            self.restore_after_failed_uninstall(id);
            return Err(e);
        }

        let trash = root.join(format!(".trash-{id}-{}", std::process::id()));
        if let Err(e) = std::fs::rename(&package_dir, &trash) {
            tracing::warn!(extension = %id, "Uninstall failed: {}", e);
            if let Err(restore) = settings::write_enabled_map(
                self.settings.as_ref(),
                &self.config.settings_key,
                &previous,
            ) {
                tracing::warn!(extension = %id, "Failed to restore enabled map: {}", restore);
            }
            self.restore_after_failed_uninstall(id);
            return Err(e.into());
        }

        let removed = std::fs::remove_dir_all(&trash);
        self.load_all_locked();
        if let Err(e) = removed {
            tracing::warn!(extension = %id, "Failed to remove {:?}: {}", trash, e);
            return Err(e.into());
        }

        tracing::info!(extension = %id, "Uninstalled extension");
        Ok(())
    }

    fn restore_after_failed_uninstall(&self, id: &str) {
        if let Err(e) = self.reload_one_locked(id) {
            tracing::warn!(extension = %id, "Failed to restore after uninstall error: {}", e);
        }
    }

    // ========== Logs and State ==========

    /// Most recent log entries of one extension, oldest first.
    pub fn get_logs(&self, id: &str, limit: usize) -> Vec<LogEntry> {
        self.services.logs.recent(id, limit)
    }

    /// Clear the logs of one extension, or of all when `id` is `None`.
    pub fn clear_logs(&self, id: Option<&str>) {
        match id {
            Some(id) => self.services.logs.clear(id),
            None => self.services.logs.clear_all(),
        }
    }

    /// One row per known extension, sorted by id.
    pub fn export_state(&self) -> Vec<ExtensionState> {
        self.snapshot()
            .values()
            .map(|record| {
                let record = record.lock();
                let descriptor = record.descriptor();
                ExtensionState {
                    id: descriptor.id.clone(),
                    name: descriptor.name.clone(),
                    version: descriptor.version.clone(),
                    description: descriptor.description.clone(),
                    enabled: record.enabled(),
                    loaded: record.is_loaded(),
                    error: record.last_error().to_string(),
                    path: descriptor.root_dir.clone(),
                    runtime: descriptor.runtime.clone(),
                    resolution: record.resolution(),
                }
            })
            .collect()
    }
}

/// Install target name for a package directory.
fn dir_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ExtensionError::NotAPackage(path.to_path_buf()))?;
    check_target_name(path, name)?;
    Ok(name.to_string())
}

/// Hidden names are never scanned, so nothing may be installed under one.
fn check_target_name(source: &Path, name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') {
        return Err(ExtensionError::NotAPackage(source.to_path_buf()));
    }
    Ok(())
}
