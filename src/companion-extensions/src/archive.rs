//! Package archive and directory copy helpers.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::{ExtensionError, Result};

/// Validate that an archive entry does not escape `dest_dir`.
pub fn validate_path_safe(
    dest_dir: &Path,
    entry_name: &str,
) -> std::result::Result<PathBuf, String> {
    if entry_name.contains('\0') {
        return Err("Path contains null byte".to_string());
    }

    let entry_path = Path::new(entry_name);
    if entry_path.is_absolute() {
        return Err(format!("Absolute path not allowed: {entry_name}"));
    }
    for component in entry_path.components() {
        match component {
            Component::ParentDir => {
                return Err(format!("Path traversal not allowed: {entry_name}"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("Rooted path not allowed: {entry_name}"));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(dest_dir.join(entry_path))
}

/// Extract a zip archive into `dest_dir`. Returns the number of files written.
///
/// Entries escaping the destination fail the whole extraction. Symlink
/// entries are not supported and are written as regular files.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(dest_dir)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_name = entry.name().to_string();
        let outpath = validate_path_safe(dest_dir, &entry_name).map_err(ExtensionError::Archive)?;

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        io::copy(&mut entry, &mut outfile)?;
        written += 1;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o777));
            }
        }
    }

    tracing::debug!("Extracted {} files from {:?}", written, archive_path);
    Ok(written)
}

/// Write `package_dir` into a zip archive at `archive_path`.
///
/// Entry names are relative to the package directory's parent, so the
/// archive's top level is the package directory itself. The archive is
/// written next to the target and renamed into place.
pub fn export_dir(package_dir: &Path, archive_path: &Path) -> Result<usize> {
    if !package_dir.is_dir() {
        return Err(ExtensionError::NotAPackage(package_dir.to_path_buf()));
    }
    if archive_within(package_dir, archive_path)? {
        return Err(ExtensionError::Archive(format!(
            "cannot export {} into itself: {}",
            package_dir.display(),
            archive_path.display()
        )));
    }
    let base = package_dir.parent().unwrap_or(package_dir);
    if let Some(parent) = archive_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = archive_path.with_extension("zip.tmp");
    let result = write_zip(package_dir, base, &temp_path);
    match result {
        Ok(count) => {
            fs::rename(&temp_path, archive_path)?;
            tracing::debug!(
                "Exported {} files from {:?} to {:?}",
                count,
                package_dir,
                archive_path
            );
            Ok(count)
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

/// Whether `archive_path` would land inside `package_dir`.
fn archive_within(package_dir: &Path, archive_path: &Path) -> io::Result<bool> {
    let target = std::path::absolute(archive_path)?;
    Ok(target.starts_with(std::path::absolute(package_dir)?)
        || target.starts_with(package_dir.canonicalize()?))
}

fn write_zip(package_dir: &Path, base: &Path, temp_path: &Path) -> Result<usize> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(temp_path)?));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut count = 0;
    for entry in WalkDir::new(package_dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let name = archive_name(relative);

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options.unix_permissions(file_mode(path)))?;
            let mut file = File::open(path)?;
            io::copy(&mut file, &mut zip)?;
            count += 1;
        } else {
            tracing::debug!("Skipping non-regular file in export: {:?}", path);
        }
    }
    zip.finish()?;
    Ok(count)
}

/// Zip entry name with `/` separators.
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o777)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}

/// Recursively copy `src` to `dst`. Symlinks are skipped.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!("Skipping symlink during copy: {:?}", entry.path());
        }
    }
    Ok(())
}
