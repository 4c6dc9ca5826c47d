//! The versioned document describing a built subvolume.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::DESCRIPTOR_VERSION;
use crate::subvol::{Subvol, SubvolError};

/// Raised after the filesystem content is already complete, so these never
/// mean the image itself is bad.
#[derive(Debug, Error)]
pub enum DescriptorError {
  #[error("failed to canonicalize {path}: {source}")]
  Canonicalize {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("subvolume {subvol} is not under subvolumes dir {subvolumes_dir}")]
  NotUnderSubvolumesDir { subvol: PathBuf, subvolumes_dir: PathBuf },

  #[error(transparent)]
  Subvol(#[from] SubvolError),

  #[error("failed to serialize descriptor: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to write descriptor: {0}")]
  Write(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeOnDisk {
  pub version: u32,
  pub subvolumes_dir: PathBuf,
  /// Location of the subvolume relative to `subvolumes_dir`.
  pub subvolume_rel_path: PathBuf,
  /// Host the subvolume was built on.
  pub hostname: String,
  pub readonly: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_layer_path: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_appliance_path: Option<PathBuf>,
}

fn canonical(path: &Path) -> Result<PathBuf, DescriptorError> {
  dunce::canonicalize(path).map_err(|source| DescriptorError::Canonicalize {
    path: path.to_path_buf(),
    source,
  })
}

impl SubvolumeOnDisk {
  pub fn from_subvolume_path(
    subvol: &Subvol,
    subvolumes_dir: &Path,
    parent_layer: Option<&Path>,
    build_appliance: Option<&Path>,
  ) -> Result<Self, DescriptorError> {
    let subvolumes_dir = canonical(subvolumes_dir)?;
    let path = canonical(subvol.raw_path())?;
    let rel = path
      .strip_prefix(&subvolumes_dir)
      .map_err(|_| DescriptorError::NotUnderSubvolumesDir {
        subvol: path.clone(),
        subvolumes_dir: subvolumes_dir.clone(),
      })?
      .to_path_buf();

    Ok(Self {
      version: DESCRIPTOR_VERSION,
      subvolume_rel_path: rel,
      hostname: rustix::system::uname().nodename().to_string_lossy().into_owned(),
      readonly: subvol.persisted_readonly()?,
      parent_layer_path: parent_layer.map(canonical).transpose()?,
      build_appliance_path: build_appliance.map(canonical).transpose()?,
      subvolumes_dir,
    })
  }

  pub fn to_json_writer(&self, mut writer: impl Write) -> Result<(), DescriptorError> {
    serde_json::to_writer_pretty(&mut writer, self).map_err(DescriptorError::Serialize)?;
    writeln!(writer).map_err(DescriptorError::Write)
  }
}
