//! Plain-directory storage backend.
//!
//! Used where btrfs is unavailable (unprivileged development, tests). A
//! snapshot is a full copy of the parent tree. Sealing is persisted as a
//! sidecar marker next to the directory (`.<name>.sealed`) and by removing
//! the write bits from the root directory; the marker also records the
//! root's original mode so that unsealing and snapshots restore it.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::SubvolError;

#[derive(Debug, Serialize, Deserialize)]
struct SealMarker {
  version: u32,
  root_mode: u32,
}

fn marker_path(path: &Path) -> PathBuf {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  path.with_file_name(format!(".{name}.sealed"))
}

fn read_marker(path: &Path) -> Result<Option<SealMarker>, SubvolError> {
  let marker = marker_path(path);
  match fs::read_to_string(&marker) {
    Ok(contents) => serde_json::from_str(&contents)
      .map(Some)
      .map_err(|source| SubvolError::Marker { path: marker, source }),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(SubvolError::io(&marker, e)),
  }
}

pub fn create(path: &Path) -> Result<(), SubvolError> {
  fs::create_dir(path).map_err(|e| SubvolError::io(path, e))?;
  fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| SubvolError::io(path, e))
}

/// Copy the parent tree into `dest`, preserving modes and symlinks.
pub fn snapshot(parent: &Path, dest: &Path) -> Result<(), SubvolError> {
  // Directories are created writable and get their real modes afterwards,
  // deepest first, so read-only directories can still be populated.
  let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

  for entry in WalkDir::new(parent).follow_links(false) {
    let entry = entry.map_err(|e| SubvolError::Walk {
      path: parent.to_path_buf(),
      source: e,
    })?;
    let rel = entry.path().strip_prefix(parent).unwrap_or(entry.path());
    let target = dest.join(rel);
    let metadata = entry.path().symlink_metadata().map_err(|e| SubvolError::io(entry.path(), e))?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
      fs::create_dir(&target).map_err(|e| SubvolError::io(&target, e))?;
      fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).map_err(|e| SubvolError::io(&target, e))?;
      dir_modes.push((target, metadata.permissions().mode()));
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path()).map_err(|e| SubvolError::io(entry.path(), e))?;
      std::os::unix::fs::symlink(&link, &target).map_err(|e| SubvolError::io(&target, e))?;
    } else {
      fs::copy(entry.path(), &target).map_err(|e| SubvolError::io(entry.path(), e))?;
    }
  }

  // A sealed parent has its root write bits stripped; the child gets the
  // original mode back.
  if let Some(marker) = read_marker(parent)?
    && let Some(root) = dir_modes.first_mut()
  {
    root.1 = marker.root_mode;
  }

  for (dir, mode) in dir_modes.iter().rev() {
    fs::set_permissions(dir, fs::Permissions::from_mode(*mode)).map_err(|e| SubvolError::io(dir, e))?;
  }

  debug!(parent = %parent.display(), dest = %dest.display(), dirs = dir_modes.len(), "copied parent tree");
  Ok(())
}

pub fn is_readonly(path: &Path) -> Result<bool, SubvolError> {
  Ok(read_marker(path)?.is_some())
}

pub fn set_readonly(path: &Path, readonly: bool) -> Result<(), SubvolError> {
  let existing = read_marker(path)?;

  if readonly {
    if existing.is_some() {
      return Ok(());
    }
    let metadata = fs::metadata(path).map_err(|e| SubvolError::io(path, e))?;
    let root_mode = metadata.permissions().mode() & 0o7777;
    let marker = SealMarker { version: 1, root_mode };
    let contents = serde_json::to_vec(&marker).map_err(|source| SubvolError::Marker {
      path: marker_path(path),
      source,
    })?;
    // Marker first: a crash after this point still leaves the volume sealed.
    let marker_file = marker_path(path);
    fs::write(&marker_file, contents).map_err(|e| SubvolError::io(&marker_file, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(root_mode & !0o222)).map_err(|e| SubvolError::io(path, e))
  } else {
    let Some(marker) = existing else {
      return Ok(());
    };
    fs::set_permissions(path, fs::Permissions::from_mode(marker.root_mode)).map_err(|e| SubvolError::io(path, e))?;
    let marker_file = marker_path(path);
    fs::remove_file(&marker_file).map_err(|e| SubvolError::io(&marker_file, e))
  }
}

/// Remove the tree, restoring owner write permission on every directory
/// first so read-only directories can be emptied.
pub fn delete(path: &Path) -> Result<(), SubvolError> {
  // Pre-order so each directory is writable before we descend into it.
  for entry in WalkDir::new(path).follow_links(false) {
    let entry = entry.map_err(|e| SubvolError::Walk {
      path: path.to_path_buf(),
      source: e,
    })?;
    if entry.file_type().is_dir() {
      let mode = entry
        .metadata()
        .map(|m| m.permissions().mode())
        .unwrap_or(0o755);
      if let Err(e) = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700)) {
        warn!(path = ?entry.path(), error = %e, "failed to make directory writable, continuing");
      }
    }
  }

  fs::remove_dir_all(path).map_err(|e| SubvolError::io(path, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn seal_strips_root_write_bits_and_restores_them() {
    let temp = TempDir::new().unwrap();
    let vol = temp.path().join("vol");
    create(&vol).unwrap();

    set_readonly(&vol, true).unwrap();
    assert!(is_readonly(&vol).unwrap());
    let mode = fs::metadata(&vol).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o555);
    assert!(temp.path().join(".vol.sealed").exists());

    set_readonly(&vol, false).unwrap();
    assert!(!is_readonly(&vol).unwrap());
    let mode = fs::metadata(&vol).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
  }

  #[test]
  fn sealing_twice_keeps_original_mode() {
    let temp = TempDir::new().unwrap();
    let vol = temp.path().join("vol");
    create(&vol).unwrap();

    set_readonly(&vol, true).unwrap();
    set_readonly(&vol, true).unwrap();
    set_readonly(&vol, false).unwrap();

    let mode = fs::metadata(&vol).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
  }

  #[test]
  fn snapshot_preserves_modes_and_links() {
    let temp = TempDir::new().unwrap();
    let parent = temp.path().join("parent");
    create(&parent).unwrap();
    fs::create_dir(parent.join("ro")).unwrap();
    fs::write(parent.join("ro/file"), "x").unwrap();
    fs::set_permissions(parent.join("ro"), fs::Permissions::from_mode(0o555)).unwrap();
    std::os::unix::fs::symlink("ro/file", parent.join("link")).unwrap();

    let child = temp.path().join("child");
    snapshot(&parent, &child).unwrap();

    assert_eq!(fs::read_to_string(child.join("ro/file")).unwrap(), "x");
    assert_eq!(fs::read_link(child.join("link")).unwrap(), PathBuf::from("ro/file"));
    let mode = fs::metadata(child.join("ro")).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o555);

    delete(&child).unwrap();
    delete(&parent).unwrap();
    assert!(!child.exists());
  }
}
