use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use walkdir::WalkDir;

use crate::error::{EseError, IoResultExt, Result};

/// Name of the scratch directory packages are extracted into.
pub const UNTAR_DIR: &str = "UNTAR";

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !path.is_dir() {
        fs::create_dir(path).at(path)?;
    }
    Ok(())
}

pub fn create_dirs(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).at(path)
}

pub fn file_size(path: impl AsRef<Path>) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub fn file_is_non_empty(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    path.is_file() && file_size(path) > 0
}

/// Returns `true` if `dir` exists and contains at least one entry.
pub fn dir_is_non_empty(dir: impl AsRef<Path>) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Sets world-writable permissions on `path`.
///
/// Failure is reported as a warning; the flow continues.
pub fn set_world_writable(path: impl AsRef<Path>) {
    let path = path.as_ref();
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o777)) {
        log::warn!("cannot change permissions of {path:?}: {e}");
    }
}

pub fn make_executable(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut perms = fs::metadata(path).at(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).at(path)
}

/// Writes `contents` to `path`, creating the parent directory if needed.
pub fn write_file(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        create_dirs(parent)?;
    }
    fs::write(path, contents).at(path)
}

/// Copies a file or a directory tree into `dest_dir`, keeping its file name.
///
/// Both the source and the destination directory must already exist.
pub fn copy_into(src: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let src = src.as_ref();
    let dest_dir = dest_dir.as_ref();

    if !src.exists() {
        return Err(EseError::MissingPath(src.to_owned()));
    }
    if !dest_dir.is_dir() {
        return Err(EseError::MissingPath(dest_dir.to_owned()));
    }
    let name = src
        .file_name()
        .ok_or_else(|| EseError::InvalidArgument(format!("cannot copy {src:?}: no file name")))?;
    let dest = dest_dir.join(name);

    if src.is_dir() {
        for entry in WalkDir::new(src).sort_by_file_name() {
            let entry = entry?;
            let Ok(rel) = entry.path().strip_prefix(src) else {
                continue;
            };
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                create_dirs(&target)?;
            } else {
                fs::copy(entry.path(), &target).at(entry.path())?;
            }
            set_world_writable(&target);
        }
    } else {
        fs::copy(src, &dest).at(src)?;
        set_world_writable(&dest);
    }

    Ok(dest)
}

/// Creates a symbolic link at `link` pointing to `target`, replacing any existing entry.
pub fn symlink_force(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();
    let link = link.as_ref();
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link).at(link)?;
    }
    std::os::unix::fs::symlink(target, link).at(link)
}

pub fn is_tar_archive(path: impl AsRef<Path>) -> bool {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".tar")
}

/// Strips the archive extension from a package file name.
pub fn package_stem(path: impl AsRef<Path>) -> String {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for ext in [".tar.gz", ".tgz", ".tar"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    name
}

/// Extracts a `.tar`, `.tar.gz` or `.tgz` archive into `dest`.
pub fn untar(archive: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let archive = archive.as_ref();
    let dest = dest.as_ref();
    if !archive.is_file() {
        return Err(EseError::MissingPath(archive.to_owned()));
    }
    create_dirs(dest)?;

    let file = fs::File::open(archive).at(archive)?;
    let name = archive.to_string_lossy().to_lowercase();
    let result = if name.ends_with(".tar") {
        tar::Archive::new(file).unpack(dest)
    } else {
        tar::Archive::new(GzDecoder::new(file)).unpack(dest)
    };
    result.map_err(|source| EseError::Archive {
        path: archive.to_owned(),
        source,
    })
}

/// Lists the subdirectories of `dir`, sorted by name.
///
/// An unreadable directory is reported as a warning and treated as empty.
pub fn list_subdirs(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    let dir = dir.as_ref();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("cannot read directory {dir:?}: {e}");
            return Vec::new();
        }
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Lists the regular files (or links to files) directly inside `dir`, sorted by name.
pub fn list_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Recursively finds files below `root` accepted by `filter`.
///
/// Directories named [`UNTAR_DIR`] are not descended into when `skip_scratch` is set.
pub fn find_files(
    root: impl AsRef<Path>,
    skip_scratch: bool,
    filter: impl Fn(&Path) -> bool,
) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(skip_scratch && e.file_type().is_dir() && is_scratch_dir(e.path())));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_dir() && filter(entry.path()) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

fn is_scratch_dir(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().eq_ignore_ascii_case(UNTAR_DIR))
        .unwrap_or(false)
}

/// Removes every [`UNTAR_DIR`] scratch directory below `root`.
pub fn remove_scratch_dirs(root: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    let mut scratch = Vec::new();
    let mut walker = WalkDir::new(root).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        if entry.file_type().is_dir() && is_scratch_dir(entry.path()) {
            scratch.push(entry.into_path());
            walker.skip_current_dir();
        }
    }
    for dir in scratch.iter() {
        log::info!("Removing directory {dir:?}");
        fs::remove_dir_all(dir).at(dir)?;
    }
    Ok(scratch)
}
