//! Manifest scanner for discovering extension packages.
//!
//! Two predicates are deliberately kept apart:
//! - [`is_package_dir`] only looks at the top level of one directory (install)
//! - [`scan_manifests`] walks the whole tree under the managed root (rescan)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::manifest::PackageDescriptor;

/// Prefixes of the runtime's own working directories under the root. They are
/// never scanned, whatever `skip_hidden_dirs` says.
pub const WORK_DIR_PREFIXES: [&str; 2] = [".staging-", ".trash-"];

/// Whether `name` is one of the runtime's working directories.
pub fn is_work_dir(name: &str) -> bool {
    WORK_DIR_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// A descriptor file that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidManifest {
    /// Descriptor file path
    pub manifest_path: PathBuf,
    /// Why it was skipped
    pub error: String,
}

/// Result of a full scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Valid descriptors, in walk order, one per id
    pub descriptors: Vec<PackageDescriptor>,
    /// Skipped descriptor files
    pub invalid: Vec<InvalidManifest>,
}

/// Options for [`scan_manifests`].
#[derive(Debug, Clone)]
pub struct ScanOptions<'a> {
    /// Descriptor file name
    pub manifest_file: &'a str,
    /// Skip directories whose name starts with `.`
    pub skip_hidden_dirs: bool,
}

impl Default for ScanOptions<'_> {
    fn default() -> Self {
        Self {
            manifest_file: crate::MANIFEST_FILE,
            skip_hidden_dirs: true,
        }
    }
}

/// Whether `path` has a descriptor at its top level.
pub fn is_package_dir(path: &Path, manifest_file: &str) -> bool {
    path.join(manifest_file).is_file()
}

/// Immediate subdirectories of `root` that are packages.
pub fn find_package_dirs(root: &Path, manifest_file: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && is_package_dir(path, manifest_file))
        .collect();
    dirs.sort();
    dirs
}

/// Recursively find and parse every descriptor under `root`.
///
/// Invalid descriptors are reported and skipped; they never abort the scan.
/// When two descriptors share an id, the later one in walk order wins.
pub fn scan_manifests(root: &Path, options: &ScanOptions<'_>) -> ScanReport {
    let mut report = ScanReport::default();
    if !root.is_dir() {
        tracing::debug!("Extension root does not exist: {:?}", root);
        return report;
    }

    let skip_hidden = options.skip_hidden_dirs;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !(is_work_dir(&name) || (skip_hidden && name.starts_with('.')))
        });

    let mut index_by_id: HashMap<String, usize> = HashMap::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Error walking extension root {:?}: {}", root, e);
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() != options.manifest_file {
            continue;
        }

        let manifest_path = entry.into_path();
        match PackageDescriptor::from_file(&manifest_path) {
            Ok(descriptor) => {
                if let Some(&index) = index_by_id.get(&descriptor.id) {
                    let previous = &report.descriptors[index];
                    tracing::warn!(
                        extension = %descriptor.id,
                        "Duplicate extension id; {:?} replaces {:?}",
                        descriptor.manifest_path,
                        previous.manifest_path
                    );
                    report.descriptors[index] = descriptor;
                } else {
                    index_by_id.insert(descriptor.id.clone(), report.descriptors.len());
                    report.descriptors.push(descriptor);
                }
            }
            Err(e) => {
                tracing::warn!("Skipping extension manifest {:?}: {}", manifest_path, e);
                report.invalid.push(InvalidManifest {
                    manifest_path,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::debug!(
        "Scanned {:?}: {} extensions, {} invalid",
        root,
        report.descriptors.len(),
        report.invalid.len()
    );
    report
}
