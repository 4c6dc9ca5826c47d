//! Concrete filesystem items.

use std::fs::File;
use std::path::PathBuf;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ImagePath, Item, ItemError};
use crate::consts::META_MOUNTS_DIR;
use crate::options::LayerOptions;
use crate::subvol::Subvol;

fn parent_of(path: &ImagePath) -> Vec<ImagePath> {
  path.parent().into_iter().collect()
}

/// Create a directory.
#[derive(Debug, Clone)]
pub struct MakeDir {
  pub id: String,
  pub path: ImagePath,
  pub mode: u32,
}

impl MakeDir {
  pub fn new(path: ImagePath, mode: u32) -> Self {
    Self {
      id: format!("make_dir:{path}"),
      path,
      mode,
    }
  }
}

impl Item for MakeDir {
  fn id(&self) -> &str {
    &self.id
  }

  fn provides(&self) -> Vec<ImagePath> {
    vec![self.path.clone()]
  }

  fn requires(&self) -> Vec<ImagePath> {
    parent_of(&self.path)
  }

  fn build(&self, subvol: &Subvol, _opts: &LayerOptions) -> Result<(), ItemError> {
    debug!(path = %self.path, mode = format!("0o{:o}", self.mode), "creating directory");
    subvol.create_dir(&self.path, self.mode)?;
    Ok(())
  }
}

/// Copy a file from the host (or from scratch space) into the image.
#[derive(Debug, Clone)]
pub struct InstallFile {
  pub id: String,
  pub source: PathBuf,
  pub dest: ImagePath,
  pub mode: u32,
  /// Expected hex sha256 of the source.
  pub sha256: Option<String>,
}

impl InstallFile {
  pub fn new(source: PathBuf, dest: ImagePath, mode: u32) -> Self {
    Self {
      id: format!("install_file:{dest}"),
      source,
      dest,
      mode,
      sha256: None,
    }
  }

  fn verify_checksum(&self, expected: &str) -> Result<(), ItemError> {
    let mut file = File::open(&self.source).map_err(|source| ItemError::Io {
      path: self.source.clone(),
      source,
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|source| ItemError::Io {
      path: self.source.clone(),
      source,
    })?;
    let actual = hex::encode(hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
      return Err(ItemError::ChecksumMismatch {
        path: self.source.clone(),
        expected: expected.to_string(),
        actual,
      });
    }
    Ok(())
  }
}

impl Item for InstallFile {
  fn id(&self) -> &str {
    &self.id
  }

  fn provides(&self) -> Vec<ImagePath> {
    vec![self.dest.clone()]
  }

  fn requires(&self) -> Vec<ImagePath> {
    parent_of(&self.dest)
  }

  fn build(&self, subvol: &Subvol, _opts: &LayerOptions) -> Result<(), ItemError> {
    if let Some(expected) = &self.sha256 {
      self.verify_checksum(expected)?;
    }
    debug!(source = %self.source.display(), dest = %self.dest, "installing file");
    subvol.copy_in(&self.source, &self.dest, self.mode)?;
    Ok(())
  }
}

/// Create a symlink.
#[derive(Debug, Clone)]
pub struct Symlink {
  pub id: String,
  pub link: ImagePath,
  pub target: String,
}

impl Symlink {
  pub fn new(link: ImagePath, target: impl Into<String>) -> Self {
    Self {
      id: format!("symlink:{link}"),
      link,
      target: target.into(),
    }
  }
}

impl Item for Symlink {
  fn id(&self) -> &str {
    &self.id
  }

  fn provides(&self) -> Vec<ImagePath> {
    vec![self.link.clone()]
  }

  /// The link's directory, plus the target when it is an absolute in-image
  /// path.
  fn requires(&self) -> Vec<ImagePath> {
    let mut requires = parent_of(&self.link);
    if self.target.starts_with('/')
      && let Ok(target) = ImagePath::new(&self.target)
    {
      requires.push(target);
    }
    requires
  }

  fn build(&self, subvol: &Subvol, _opts: &LayerOptions) -> Result<(), ItemError> {
    debug!(link = %self.link, target = %self.target, "creating symlink");
    subvol.symlink(&self.target, &self.link)?;
    Ok(())
  }
}

#[derive(Debug, Serialize)]
struct MountRecord<'a> {
  source: &'a PathBuf,
  mountpoint: &'a ImagePath,
}

/// Declare a host path to be mounted into the image at runtime.
///
/// The build only creates the mountpoint and records the mount under
/// `/.meta/mounts`; nothing is mounted while building.
#[derive(Debug, Clone)]
pub struct HostMount {
  pub id: String,
  pub source: PathBuf,
  pub mountpoint: ImagePath,
}

impl HostMount {
  pub fn new(source: PathBuf, mountpoint: ImagePath) -> Self {
    Self {
      id: format!("host_mount:{mountpoint}"),
      source,
      mountpoint,
    }
  }

  /// `/` becomes `_`; literal `%` and `_` are percent-escaped first so
  /// distinct mountpoints never share a record.
  fn record_name(&self) -> String {
    let mut name = String::with_capacity(self.mountpoint.as_rel().len());
    for c in self.mountpoint.as_rel().chars() {
      match c {
        '%' => name.push_str("%25"),
        '_' => name.push_str("%5F"),
        '/' => name.push('_'),
        c => name.push(c),
      }
    }
    format!("{META_MOUNTS_DIR}/{name}.json")
  }
}

impl Item for HostMount {
  fn id(&self) -> &str {
    &self.id
  }

  fn provides(&self) -> Vec<ImagePath> {
    vec![self.mountpoint.clone()]
  }

  fn requires(&self) -> Vec<ImagePath> {
    parent_of(&self.mountpoint)
  }

  fn build(&self, subvol: &Subvol, opts: &LayerOptions) -> Result<(), ItemError> {
    if !opts.host_mounts_allowed() {
      return Err(ItemError::HostMountNotAllowed {
        layer: opts.layer_target.clone(),
      });
    }

    subvol.create_dir(&self.mountpoint, 0o755)?;
    let record = MountRecord {
      source: &self.source,
      mountpoint: &self.mountpoint,
    };
    let contents = serde_json::to_vec_pretty(&record).map_err(|e| ItemError::Other(e.to_string()))?;
    subvol.write_meta(&self.record_name(), &contents)?;
    Ok(())
  }
}
