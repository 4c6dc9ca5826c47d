//! Loading feature JSON into build items.
//!
//! A feature file is a JSON array of objects tagged by `kind`:
//!
//! ```json
//! [
//!   {"kind": "parent_layer", "layer": "//images:base"},
//!   {"kind": "make_dir", "path": "/etc/app", "mode": 493},
//!   {"kind": "install_file", "dest": "/etc/app/conf", "contents": "x=1\n"}
//! ]
//! ```
//!
//! When no feature makes the subvolume, one is added implicitly: a
//! snapshot of the parent layer if one was given, else an empty subvolume.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use super::fs::{HostMount, InstallFile, MakeDir, Symlink};
use super::{ImageItem, ImagePath, PathError, PhaseItem, PhaseKind};
use crate::options::{ConfigError, LayerOptions};
use crate::subvol::{SubvolError, scan_tree};

#[derive(Debug, Error)]
pub enum FeatureError {
  #[error("failed to read feature file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid feature file {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid path in {feature} feature: {source}")]
  Path {
    feature: &'static str,
    #[source]
    source: PathError,
  },

  #[error("install_file {dest} needs exactly one of `source`, `source_target` or `contents`")]
  InvalidSource { dest: String },

  #[error("parent_layer feature needs exactly one of `layer` or `path`")]
  InvalidParent,

  #[error("make_dir cannot target the image root")]
  RootDir,

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("failed to scan parent layer: {0}")]
  Parent(#[from] SubvolError),

  #[error("failed to prepare scratch space: {0}")]
  Scratch(#[source] std::io::Error),
}

fn default_dir_mode() -> u32 {
  0o755
}

fn default_file_mode() -> u32 {
  0o444
}

/// One entry of a feature file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureDef {
  ParentLayer {
    /// Build target whose output is the parent subvolume.
    #[serde(default)]
    layer: Option<String>,
    /// Explicit parent subvolume path.
    #[serde(default)]
    path: Option<PathBuf>,
  },
  FromScratch,
  InstallPackages {
    names: Vec<String>,
  },
  MakeDir {
    path: String,
    #[serde(default = "default_dir_mode")]
    mode: u32,
  },
  InstallFile {
    dest: String,
    #[serde(default)]
    source: Option<PathBuf>,
    #[serde(default)]
    source_target: Option<String>,
    #[serde(default)]
    contents: Option<String>,
    #[serde(default = "default_file_mode")]
    mode: u32,
    #[serde(default)]
    sha256: Option<String>,
  },
  Symlink {
    target: String,
    link: String,
  },
  HostMount {
    source: PathBuf,
    mountpoint: String,
  },
}

/// Per-build temporary directory for staged item inputs.
///
/// Owned by the compile invocation and dropped only after the subvolume
/// has been sealed.
#[derive(Debug)]
pub struct ScratchSpace {
  dir: TempDir,
  counter: AtomicUsize,
}

impl ScratchSpace {
  pub fn new() -> Result<Self, FeatureError> {
    let dir = tempfile::Builder::new()
      .prefix("strata-scratch-")
      .tempdir()
      .map_err(FeatureError::Scratch)?;
    Ok(Self {
      dir,
      counter: AtomicUsize::new(0),
    })
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Write `contents` to a fresh file in scratch space.
  pub fn stage(&self, contents: &[u8]) -> Result<PathBuf, FeatureError> {
    let n = self.counter.fetch_add(1, Ordering::Relaxed);
    let path = self.dir.path().join(format!("staged-{n}"));
    std::fs::write(&path, contents).map_err(FeatureError::Scratch)?;
    Ok(path)
  }
}

fn image_path(feature: &'static str, raw: &str) -> Result<ImagePath, FeatureError> {
  ImagePath::new(raw).map_err(|source| FeatureError::Path { feature, source })
}

/// Read one feature file.
pub fn read_feature_file(path: &Path) -> Result<Vec<FeatureDef>, FeatureError> {
  let raw = std::fs::read_to_string(path).map_err(|source| FeatureError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  serde_json::from_str(&raw).map_err(|source| FeatureError::Json {
    path: path.to_path_buf(),
    source,
  })
}

fn parent_layer_item(parent: &Path) -> Result<ImageItem, FeatureError> {
  let provides = scan_tree(parent)?;
  debug!(parent = %parent.display(), paths = provides.len(), "scanned parent layer");
  Ok(ImageItem::Phase(PhaseItem::ParentLayer {
    id: format!("parent_layer:{}", parent.display()),
    path: parent.to_path_buf(),
    provides,
  }))
}

/// Convert feature definitions into build items.
pub fn items_from_defs(
  defs: Vec<FeatureDef>,
  parent_layer: Option<&Path>,
  opts: &LayerOptions,
  scratch: &ScratchSpace,
) -> Result<Vec<ImageItem>, FeatureError> {
  let mut items = Vec::with_capacity(defs.len() + 1);

  for def in defs {
    let item = match def {
      FeatureDef::ParentLayer { layer, path } => {
        let parent = match (layer, path) {
          (Some(layer), None) => opts.target_path(&layer)?.to_path_buf(),
          (None, Some(path)) => path,
          _ => return Err(FeatureError::InvalidParent),
        };
        parent_layer_item(&parent)?
      }
      FeatureDef::FromScratch => ImageItem::Phase(PhaseItem::FromScratch {
        id: "from_scratch".to_string(),
      }),
      FeatureDef::InstallPackages { names } => ImageItem::Phase(PhaseItem::InstallPackages {
        id: format!("install_packages:{}", names.join(",")),
        names,
      }),
      FeatureDef::MakeDir { path, mode } => {
        let path = image_path("make_dir", &path)?;
        if path.is_root() {
          return Err(FeatureError::RootDir);
        }
        ImageItem::dep(MakeDir::new(path, mode))
      }
      FeatureDef::InstallFile {
        dest,
        source,
        source_target,
        contents,
        mode,
        sha256,
      } => {
        let source = match (source, source_target, contents) {
          (Some(source), None, None) => source,
          (None, Some(target), None) => opts.target_path(&target)?.to_path_buf(),
          (None, None, Some(contents)) => scratch.stage(contents.as_bytes())?,
          _ => return Err(FeatureError::InvalidSource { dest }),
        };
        let mut item = InstallFile::new(source, image_path("install_file", &dest)?, mode);
        item.sha256 = sha256;
        ImageItem::dep(item)
      }
      FeatureDef::Symlink { target, link } => ImageItem::dep(Symlink::new(image_path("symlink", &link)?, target)),
      FeatureDef::HostMount { source, mountpoint } => {
        ImageItem::dep(HostMount::new(source, image_path("host_mount", &mountpoint)?))
      }
    };
    items.push(item);
  }

  let makes_subvol = items
    .iter()
    .any(|item| matches!(item, ImageItem::Phase(phase) if phase.kind() == PhaseKind::MakeSubvol));
  if !makes_subvol {
    let implicit = match parent_layer {
      Some(parent) => parent_layer_item(parent)?,
      None => ImageItem::Phase(PhaseItem::FromScratch {
        id: "from_scratch".to_string(),
      }),
    };
    debug!(item = implicit.id(), "adding implicit subvolume-making item");
    items.push(implicit);
  }

  Ok(items)
}

/// Load every feature file into build items.
pub fn load_items(
  paths: &[PathBuf],
  parent_layer: Option<&Path>,
  opts: &LayerOptions,
  scratch: &ScratchSpace,
) -> Result<Vec<ImageItem>, FeatureError> {
  let mut defs = Vec::new();
  for path in paths {
    defs.extend(read_feature_file(path)?);
  }
  info!(files = paths.len(), features = defs.len(), "loaded features");
  items_from_defs(defs, parent_layer, opts, scratch)
}
