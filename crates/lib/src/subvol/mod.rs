//! Subvolume handle: the mutable-then-sealed target of an image build.
//!
//! A [`Subvol`] wraps a location on persistent storage. Every mutation goes
//! through the handle, and every mutation first checks the sealed state, so
//! that once [`Subvol::set_readonly`] has succeeded no further writes can be
//! issued through any handle to that location, including handles reopened
//! from the path in a later process.
//!
//! Two storage backends are supported:
//!
//! - **Btrfs**: real subvolumes, snapshots and the `ro` property
//! - **Directory**: plain directories for unprivileged development and tests

pub mod btrfs;
pub mod directory;
pub mod lock;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::item::path::ImagePath;

pub use lock::{BuildLock, LockError};

/// Storage engine backing a subvolume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
  #[default]
  Btrfs,
  Directory,
}

/// Errors raised by subvolume operations.
#[derive(Debug, Error)]
pub enum SubvolError {
  /// Mutation attempted after the subvolume was sealed.
  #[error("subvolume {path} is sealed read-only")]
  Sealed { path: PathBuf },

  #[error("subvolume {path} already exists")]
  AlreadyExists { path: PathBuf },

  #[error("subvolume {path} does not exist")]
  NotFound { path: PathBuf },

  #[error("path {path} resolves outside subvolume {subvol}")]
  Escapes { path: String, subvol: PathBuf },

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to traverse {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("`{cmd}` failed with exit code {code:?}: {stderr}")]
  Command {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("{operation} is not supported by the {backend:?} backend")]
  Unsupported {
    operation: &'static str,
    backend: StorageBackend,
  },

  #[error("corrupt seal marker {path}: {source}")]
  Marker {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

impl SubvolError {
  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    SubvolError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Handle to an on-disk subvolume.
#[derive(Debug)]
pub struct Subvol {
  path: PathBuf,
  backend: StorageBackend,
  sealed: AtomicBool,
}

impl Subvol {
  /// A handle for a subvolume that does not exist yet.
  ///
  /// The subvolume itself is created later by [`Subvol::create_empty`] or
  /// [`Subvol::snapshot_from`].
  pub fn at(path: impl Into<PathBuf>, backend: StorageBackend) -> Self {
    Self {
      path: path.into(),
      backend,
      sealed: AtomicBool::new(false),
    }
  }

  /// Open an existing subvolume, reading its persisted read-only state.
  pub fn open(path: impl Into<PathBuf>, backend: StorageBackend) -> Result<Self, SubvolError> {
    let path = path.into();
    if !path.is_dir() {
      return Err(SubvolError::NotFound { path });
    }
    let sealed = read_sealed(&path, backend)?;
    Ok(Self {
      path,
      backend,
      sealed: AtomicBool::new(sealed),
    })
  }

  pub fn backend(&self) -> StorageBackend {
    self.backend
  }

  /// The canonical location of the subvolume.
  ///
  /// Falls back to the configured path when it cannot be canonicalized
  /// (e.g. before the subvolume has been created).
  pub fn path(&self) -> PathBuf {
    dunce::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone())
  }

  /// The path as configured, without canonicalization.
  pub fn raw_path(&self) -> &Path {
    &self.path
  }

  pub fn exists(&self) -> bool {
    self.path.is_dir()
  }

  /// Resolve an in-image path to a host path under this subvolume.
  ///
  /// Refuses to traverse symlinks in the parent chain that point outside
  /// the subvolume.
  pub fn path_in(&self, image_path: &ImagePath) -> Result<PathBuf, SubvolError> {
    let resolved = self.path.join(image_path.as_rel());
    if let Some(parent) = resolved.parent()
      && let Ok(real_parent) = dunce::canonicalize(parent)
      && let Ok(real_root) = dunce::canonicalize(&self.path)
      && !real_parent.starts_with(&real_root)
    {
      return Err(SubvolError::Escapes {
        path: image_path.to_string(),
        subvol: self.path.clone(),
      });
    }
    Ok(resolved)
  }

  /// Whether the subvolume is sealed read-only.
  pub fn is_readonly(&self) -> bool {
    self.sealed.load(Ordering::SeqCst)
  }

  /// Re-read the persisted read-only state from storage.
  pub fn persisted_readonly(&self) -> Result<bool, SubvolError> {
    read_sealed(&self.path, self.backend)
  }

  /// Fails with [`SubvolError::Sealed`] if this handle or any other handle
  /// has sealed the subvolume. The persisted state is consulted on every
  /// call while the cached flag is clear, since another handle may have
  /// sealed the location since this one was created.
  pub(crate) fn ensure_mutable(&self) -> Result<(), SubvolError> {
    if !self.is_readonly() && self.path.is_dir() && read_sealed(&self.path, self.backend)? {
      self.sealed.store(true, Ordering::SeqCst);
    }
    if self.is_readonly() {
      return Err(SubvolError::Sealed {
        path: self.path.clone(),
      });
    }
    Ok(())
  }

  /// Create a new, empty subvolume at this handle's location.
  pub fn create_empty(&self) -> Result<(), SubvolError> {
    self.ensure_mutable()?;
    if self.path.exists() {
      return Err(SubvolError::AlreadyExists {
        path: self.path.clone(),
      });
    }
    info!(path = %self.path.display(), backend = ?self.backend, "creating empty subvolume");
    match self.backend {
      StorageBackend::Btrfs => btrfs::create(&self.path),
      StorageBackend::Directory => directory::create(&self.path),
    }
  }

  /// Create this subvolume as a copy-on-write clone of `parent`.
  pub fn snapshot_from(&self, parent: &Path) -> Result<(), SubvolError> {
    self.ensure_mutable()?;
    if self.path.exists() {
      return Err(SubvolError::AlreadyExists {
        path: self.path.clone(),
      });
    }
    if !parent.is_dir() {
      return Err(SubvolError::NotFound {
        path: parent.to_path_buf(),
      });
    }
    info!(
      parent = %parent.display(),
      path = %self.path.display(),
      backend = ?self.backend,
      "snapshotting parent subvolume"
    );
    match self.backend {
      StorageBackend::Btrfs => btrfs::snapshot(parent, &self.path),
      StorageBackend::Directory => directory::snapshot(parent, &self.path),
    }
  }

  /// Seal (`true`) or unseal (`false`) the subvolume.
  ///
  /// Sealing is persisted by the storage backend, so it survives process
  /// restarts and is observed by handles reopened from the path.
  pub fn set_readonly(&self, readonly: bool) -> Result<(), SubvolError> {
    debug!(path = %self.path.display(), readonly, "setting subvolume read-only state");
    match self.backend {
      StorageBackend::Btrfs => btrfs::set_readonly(&self.path, readonly)?,
      StorageBackend::Directory => directory::set_readonly(&self.path, readonly)?,
    }
    self.sealed.store(readonly, Ordering::SeqCst);
    Ok(())
  }

  /// Delete the subvolume, unsealing it first if needed.
  pub fn delete(self) -> Result<(), SubvolError> {
    if !self.path.exists() {
      return Ok(());
    }
    info!(path = %self.path.display(), "deleting subvolume");
    if self.persisted_readonly()? {
      self.set_readonly(false)?;
    }
    match self.backend {
      StorageBackend::Btrfs => btrfs::delete(&self.path),
      StorageBackend::Directory => directory::delete(&self.path),
    }
  }

  /// Write a sendstream of this subvolume to `out`, incremental against
  /// `parent` when given.
  pub fn send_to(&self, out: &Path, parent: Option<&Subvol>) -> Result<(), SubvolError> {
    match self.backend {
      StorageBackend::Btrfs => btrfs::send(&self.path, parent.map(|p| p.raw_path()), out),
      StorageBackend::Directory => Err(SubvolError::Unsupported {
        operation: "send",
        backend: self.backend,
      }),
    }
  }

  // ============ Mutation API ============

  /// Create a directory (and missing parents) with the given mode.
  pub fn create_dir(&self, image_path: &ImagePath, mode: u32) -> Result<(), SubvolError> {
    self.ensure_mutable()?;
    let target = self.path_in(image_path)?;
    std::fs::create_dir_all(&target).map_err(|e| SubvolError::io(&target, e))?;
    set_mode(&target, mode)
  }

  /// Write `contents` to a file, replacing any existing file.
  pub fn write_file(&self, image_path: &ImagePath, contents: &[u8], mode: u32) -> Result<(), SubvolError> {
    self.ensure_mutable()?;
    let target = self.path_in(image_path)?;
    std::fs::write(&target, contents).map_err(|e| SubvolError::io(&target, e))?;
    set_mode(&target, mode)
  }

  /// Copy a host file into the image.
  pub fn copy_in(&self, source: &Path, image_path: &ImagePath, mode: u32) -> Result<(), SubvolError> {
    self.ensure_mutable()?;
    let target = self.path_in(image_path)?;
    std::fs::copy(source, &target).map_err(|e| SubvolError::io(source, e))?;
    set_mode(&target, mode)
  }

  /// Create a symlink at `image_path` pointing to `target`.
  pub fn symlink(&self, target: &str, image_path: &ImagePath) -> Result<(), SubvolError> {
    self.ensure_mutable()?;
    let link = self.path_in(image_path)?;
    std::os::unix::fs::symlink(target, &link).map_err(|e| SubvolError::io(&link, e))
  }

  /// Remove a file, symlink or directory tree.
  pub fn remove(&self, image_path: &ImagePath) -> Result<(), SubvolError> {
    self.ensure_mutable()?;
    let target = self.path_in(image_path)?;
    let metadata = std::fs::symlink_metadata(&target).map_err(|e| SubvolError::io(&target, e))?;
    if metadata.is_dir() {
      std::fs::remove_dir_all(&target).map_err(|e| SubvolError::io(&target, e))
    } else {
      std::fs::remove_file(&target).map_err(|e| SubvolError::io(&target, e))
    }
  }

  /// Write a metadata file under the image's `.meta` directory.
  pub fn write_meta(&self, rel: &str, contents: &[u8]) -> Result<(), SubvolError> {
    let image_path = ImagePath::new(rel).map_err(|_| SubvolError::Escapes {
      path: rel.to_string(),
      subvol: self.path.clone(),
    })?;
    if let Some(parent) = image_path.parent() {
      self.ensure_mutable()?;
      let dir = self.path_in(&parent)?;
      std::fs::create_dir_all(&dir).map_err(|e| SubvolError::io(&dir, e))?;
    }
    self.write_file(&image_path, contents, 0o644)
  }

  // ============ Read API ============

  pub fn read_text(&self, image_path: &ImagePath) -> Result<String, SubvolError> {
    let target = self.path_in(image_path)?;
    std::fs::read_to_string(&target).map_err(|e| SubvolError::io(&target, e))
  }

  pub fn contains(&self, image_path: &ImagePath) -> bool {
    self
      .path_in(image_path)
      .map(|p| std::fs::symlink_metadata(p).is_ok())
      .unwrap_or(false)
  }

  /// Every path present in the subvolume, excluding build metadata.
  pub fn scan_paths(&self) -> Result<Vec<ImagePath>, SubvolError> {
    scan_tree(&self.path)
  }
}

/// List every path in the tree rooted at `root` as image paths.
///
/// The root itself is included as `/`; the `.meta` directory is skipped.
/// Symlinks are reported but not followed.
pub fn scan_tree(root: &Path) -> Result<Vec<ImagePath>, SubvolError> {
  let mut paths = Vec::new();
  let walker = walkdir::WalkDir::new(root)
    .follow_links(false)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| !(e.depth() == 1 && e.file_name() == crate::consts::META_DIR));

  for entry in walker {
    let entry = entry.map_err(|e| SubvolError::Walk {
      path: root.to_path_buf(),
      source: e,
    })?;
    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
    if let Ok(image_path) = ImagePath::from_relative(rel) {
      paths.push(image_path);
    }
  }

  Ok(paths)
}

fn set_mode(path: &Path, mode: u32) -> Result<(), SubvolError> {
  use std::os::unix::fs::PermissionsExt;

  std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| SubvolError::io(path, e))
}

fn read_sealed(path: &Path, backend: StorageBackend) -> Result<bool, SubvolError> {
  match backend {
    StorageBackend::Btrfs => btrfs::is_readonly(path),
    StorageBackend::Directory => directory::is_readonly(path),
  }
}
