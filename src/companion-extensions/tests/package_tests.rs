//! Integration tests for package management: install, import, export and
//! uninstall.

mod common;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use companion_extensions::{
    EnabledMap, ExtensionError, ExtensionManager, MemorySettings, RuntimeConfig, SettingsStore,
};

use common::{Harness, Journal, native_loader, write_package};

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

// =============================================================================
// Install
// =============================================================================

#[test]
fn test_install_from_directory() {
    let harness = Harness::new();
    let source = TempDir::new().unwrap();
    let package = write_package(source.path(), "weather", "weather", "recorder");
    fs::create_dir_all(package.join("assets")).unwrap();
    fs::write(package.join("assets/icon.txt"), "sun").unwrap();

    let outcome = harness.manager.install_from_directory(&package).unwrap();
    assert_eq!(outcome.installed, vec!["weather"]);
    assert_eq!(outcome.paths, vec![harness.root().join("weather")]);
    assert_eq!(outcome.report.loaded, vec!["weather"]);

    assert_eq!(read(&harness.root().join("weather/assets/icon.txt")), "sun");
    assert!(harness.state("weather").loaded);
    assert!(harness.journal.contains("weather:on_load"));
    assert!(package.join("main").is_file());
}

#[test]
fn test_install_collision_leaves_existing_files() {
    let harness = Harness::new();
    let installed = harness.add("weather", "recorder");
    fs::write(installed.join("notes.txt"), "mine").unwrap();
    harness.manager.load_all();

    let source = TempDir::new().unwrap();
    let package = write_package(source.path(), "weather", "weather-two", "quiet");

    let err = harness.manager.install_from_directory(&package).unwrap_err();
    assert!(matches!(err, ExtensionError::AlreadyExists(ref name) if name == "weather"));
    assert_eq!(read(&installed.join("notes.txt")), "mine");
    assert_eq!(read(&installed.join("main")), "recorder");
    assert_eq!(harness.ids(), vec!["weather"]);
}

#[test]
fn test_install_rejects_non_packages() {
    let harness = Harness::new();
    let source = TempDir::new().unwrap();
    let plain = source.path().join("plain");
    fs::create_dir_all(plain.join("nested/pkg")).unwrap();
    fs::write(plain.join("nested/pkg/extension.json"), r#"{ "id": "pkg" }"#).unwrap();

    let err = harness.manager.install_from_directory(&plain).unwrap_err();
    assert!(matches!(err, ExtensionError::NotAPackage(_)));

    let err = harness
        .manager
        .install_from_directory(&source.path().join("missing"))
        .unwrap_err();
    assert!(matches!(err, ExtensionError::NotFound(_)));
    assert!(!harness.root().join("plain").exists());
}

#[test]
fn test_install_rejects_invalid_descriptor() {
    let harness = Harness::new();
    let source = TempDir::new().unwrap();
    let package = source.path().join("broken");
    fs::create_dir_all(&package).unwrap();
    fs::write(package.join("extension.json"), "{ not json").unwrap();

    let err = harness.manager.install_from_directory(&package).unwrap_err();
    assert!(matches!(err, ExtensionError::InvalidManifest { .. }));
    assert!(!harness.root().join("broken").exists());
}

#[test]
fn test_install_rejects_hidden_directory_name() {
    let harness = Harness::new();
    let source = TempDir::new().unwrap();
    let package = write_package(source.path(), ".weather", "weather", "recorder");

    let err = harness.manager.install_from_directory(&package).unwrap_err();
    assert!(matches!(err, ExtensionError::NotAPackage(_)));
    assert!(!harness.root().join(".weather").exists());
    assert!(harness.ids().is_empty());
}

// =============================================================================
// Export and Import
// =============================================================================

#[test]
fn test_export_then_import_into_fresh_root() {
    let first = Harness::new();
    let package = first.add("weather", "recorder");
    fs::create_dir_all(package.join("data")).unwrap();
    fs::write(package.join("data/cities.txt"), "Oslo\nLima\n").unwrap();
    first.manager.load_all();

    let out = TempDir::new().unwrap();
    let archive = out.path().join("weather.zip");
    assert_eq!(
        first.manager.export_to_archive("weather", &archive).unwrap(),
        archive
    );

    let second = Harness::new();
    let outcome = second.manager.import_from_archive(&archive).unwrap();
    assert_eq!(outcome.installed, vec!["weather"]);
    assert_eq!(outcome.report.loaded, vec!["weather"]);

    let imported = second.root().join("weather");
    for file in ["extension.json", "main", "data/cities.txt"] {
        assert_eq!(read(&imported.join(file)), read(&package.join(file)), "{file}");
    }
    assert_eq!(second.state("weather").version, "1.0.0");
}

#[test]
fn test_export_unknown_id() {
    let harness = Harness::new();
    let out = TempDir::new().unwrap();
    let err = harness
        .manager
        .export_to_archive("nope", &out.path().join("nope.zip"))
        .unwrap_err();
    assert!(matches!(err, ExtensionError::NotFound(_)));
}

#[test]
fn test_import_multi_package_archive() {
    let harness = Harness::new();
    let out = TempDir::new().unwrap();
    let archive = out.path().join("bundle.zip");
    {
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        let options = SimpleFileOptions::default();
        for id in ["clock", "mail"] {
            zip.start_file(format!("{id}/extension.json"), options)
                .unwrap();
            write!(zip, r#"{{ "id": "{id}", "runtime": "native" }}"#).unwrap();
            zip.start_file(format!("{id}/main"), options).unwrap();
            zip.write_all(b"quiet").unwrap();
        }
        zip.start_file("README.txt", options).unwrap();
        zip.write_all(b"not a package").unwrap();
        zip.finish().unwrap();
    }

    let outcome = harness.manager.import_from_archive(&archive).unwrap();
    assert_eq!(outcome.installed, vec!["clock", "mail"]);
    assert_eq!(outcome.report.loaded, vec!["clock", "mail"]);
    assert!(!harness.root().join("README.txt").exists());
}

#[test]
fn test_import_flat_archive_uses_archive_name() {
    let harness = Harness::new();
    let out = TempDir::new().unwrap();
    let archive = out.path().join("pomodoro.zip");
    {
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        let options = SimpleFileOptions::default();
        zip.start_file("extension.json", options).unwrap();
        zip.write_all(br#"{ "id": "pomodoro", "runtime": "native" }"#)
            .unwrap();
        zip.start_file("main", options).unwrap();
        zip.write_all(b"quiet").unwrap();
        zip.finish().unwrap();
    }

    let outcome = harness.manager.import_from_archive(&archive).unwrap();
    assert_eq!(outcome.paths, vec![harness.root().join("pomodoro")]);
    assert!(harness.state("pomodoro").loaded);
}

#[test]
fn test_import_rejects_hidden_archive_name() {
    let harness = Harness::new();
    let out = TempDir::new().unwrap();
    let archive = out.path().join(".pomodoro.zip");
    {
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("extension.json", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(br#"{ "id": "pomodoro", "runtime": "native" }"#)
            .unwrap();
        zip.finish().unwrap();
    }

    let err = harness.manager.import_from_archive(&archive).unwrap_err();
    assert!(matches!(err, ExtensionError::NotAPackage(_)));
    assert!(!harness.root().join(".pomodoro").exists());
}

#[test]
fn test_import_collision_installs_nothing() {
    let harness = Harness::new();
    harness.add("mail", "quiet");
    harness.manager.load_all();

    let out = TempDir::new().unwrap();
    let archive = out.path().join("bundle.zip");
    {
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        let options = SimpleFileOptions::default();
        for id in ["clock", "mail"] {
            zip.start_file(format!("{id}/extension.json"), options)
                .unwrap();
            write!(zip, r#"{{ "id": "{id}" }}"#).unwrap();
        }
        zip.finish().unwrap();
    }

    let err = harness.manager.import_from_archive(&archive).unwrap_err();
    assert!(matches!(err, ExtensionError::AlreadyExists(ref names) if names == "mail"));
    assert!(!harness.root().join("clock").exists());
    assert_eq!(harness.ids(), vec!["mail"]);
}

#[test]
fn test_import_rejects_escaping_entries() {
    let harness = Harness::new();
    let out = TempDir::new().unwrap();
    let archive = out.path().join("evil.zip");
    {
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("../../escape/extension.json", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(br#"{ "id": "escape" }"#).unwrap();
        zip.finish().unwrap();
    }

    let err = harness.manager.import_from_archive(&archive).unwrap_err();
    assert!(matches!(err, ExtensionError::Archive(_)));
    assert!(harness.ids().is_empty());
}

#[test]
fn test_import_archive_without_packages() {
    let harness = Harness::new();
    let out = TempDir::new().unwrap();
    let archive = out.path().join("empty.zip");
    {
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("notes.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"nothing here").unwrap();
        zip.finish().unwrap();
    }

    let err = harness.manager.import_from_archive(&archive).unwrap_err();
    assert!(matches!(err, ExtensionError::NotAPackage(_)));
}

// =============================================================================
// Uninstall
// =============================================================================

#[test]
fn test_uninstall_removes_files_and_enabled_entry() {
    let harness = Harness::new();
    let weather = harness.add("weather", "recorder");
    harness.add("clock", "quiet");
    harness.manager.load_all();
    harness.manager.set_enabled("weather", false).unwrap();
    harness.manager.set_enabled("weather", true).unwrap();

    harness.manager.uninstall("weather").unwrap();
    assert!(!weather.exists());
    assert!(harness.journal.contains("weather:on_unload"));
    assert_eq!(harness.ids(), vec!["clock"]);
    assert!(!harness.manager.enabled_map().contains_key("weather"));
    assert!(harness.settings.snapshot().contains_key("extensions_enabled"));

    let leftovers: Vec<_> = fs::read_dir(harness.root())
        .unwrap()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(leftovers, vec!["clock"]);
}

#[test]
fn test_uninstall_unknown_id() {
    let harness = Harness::new();
    let err = harness.manager.uninstall("ghost").unwrap_err();
    assert!(matches!(err, ExtensionError::NotFound(_)));
}

/// Settings that can be read but never written.
struct ReadOnlySettings {
    values: serde_json::Map<String, serde_json::Value>,
}

impl SettingsStore for ReadOnlySettings {
    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        self.values.clone()
    }

    fn merge(
        &self,
        _patch: serde_json::Map<String, serde_json::Value>,
    ) -> companion_extensions::Result<()> {
        Err(ExtensionError::Settings("settings are read-only".to_string()))
    }
}

fn manager_with(
    config: RuntimeConfig,
    settings: Arc<dyn SettingsStore>,
    journal: &Arc<Journal>,
) -> ExtensionManager {
    let mut manager = ExtensionManager::new(config, settings).unwrap();
    manager.register_loader("native", native_loader(journal));
    manager
}

#[test]
fn test_uninstall_keeps_package_when_settings_fail() {
    let temp = TempDir::new().unwrap();
    let journal = Arc::new(Journal::default());
    let mut values = serde_json::Map::new();
    values.insert(
        "extensions_enabled".to_string(),
        serde_json::json!({ "weather": true }),
    );
    let manager = manager_with(
        RuntimeConfig::with_base_dir(temp.path()),
        Arc::new(ReadOnlySettings { values }),
        &journal,
    );
    let package = write_package(&manager.extension_root(), "weather", "weather", "recorder");
    manager.load_all();

    let err = manager.uninstall("weather").unwrap_err();
    assert!(matches!(err, ExtensionError::Settings(_)));
    assert!(package.join("main").is_file());

    let states = manager.export_state();
    assert_eq!(states.len(), 1);
    assert!(states[0].loaded);
    assert_eq!(
        manager.enabled_map(),
        EnabledMap::from([("weather".to_string(), true)])
    );
}

#[test]
fn test_leftover_trash_is_never_loaded() {
    let temp = TempDir::new().unwrap();
    let journal = Arc::new(Journal::default());
    let config = RuntimeConfig {
        skip_hidden_dirs: false,
        ..RuntimeConfig::with_base_dir(temp.path())
    };
    let manager = manager_with(
        config,
        Arc::new(MemorySettings::new()),
        &journal,
    );
    let root = manager.extension_root();
    write_package(&root, ".trash-weather-4242", "weather", "recorder");
    write_package(&root, "clock", "clock", "quiet");

    let report = manager.load_all();
    assert_eq!(report.loaded, vec!["clock"]);

    manager.uninstall("clock").unwrap();
    assert!(manager.export_state().is_empty());
    assert!(!journal.contains("weather:on_load"));
}
