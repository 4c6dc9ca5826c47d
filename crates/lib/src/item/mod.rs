//! Build directives ("items") consumed by the dependency graph.
//!
//! Two shapes of item exist:
//!
//! - [`Item`]: an ordinary directive with declared provided and required
//!   paths. These are ordered by the dependency graph and built
//!   concurrently in batches.
//! - [`PhaseItem`]: a coarse setup step (making the subvolume, installing
//!   packages) whose ordering is fixed by its [`PhaseKind`] rather than by
//!   dependency edges.

pub mod features;
pub mod fs;
pub mod path;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::options::{ConfigError, LayerOptions};
use crate::subvol::{Subvol, SubvolError};

pub use path::{ImagePath, PathError};

/// Errors raised by an item's build.
#[derive(Debug, Error)]
pub enum ItemError {
  #[error(transparent)]
  Subvol(#[from] SubvolError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    path: PathBuf,
    expected: String,
    actual: String,
  },

  #[error("layer {layer} is not allowed to declare host mounts")]
  HostMountNotAllowed { layer: String },

  #[error("item build panicked: {0}")]
  Panicked(String),

  #[error("{0}")]
  Other(String),
}

/// An ordinary build directive.
///
/// Implementations must be cheap to share across threads: the scheduler
/// clones the `Arc` into one blocking task per item of a batch.
pub trait Item: Send + Sync + fmt::Debug {
  /// Human-readable identity used in logs and errors.
  fn id(&self) -> &str;

  /// Paths this item creates. Must not overlap any other item's.
  fn provides(&self) -> Vec<ImagePath>;

  /// Paths that must exist before this item builds.
  fn requires(&self) -> Vec<ImagePath>;

  /// Apply the item to the subvolume.
  fn build(&self, subvol: &Subvol, opts: &LayerOptions) -> Result<(), ItemError>;
}

/// Statically ordered setup phases. Earlier variants run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
  /// Create the subvolume, from scratch or from a parent layer.
  MakeSubvol,
  /// Install packages from the pinned repository snapshot.
  InstallPackages,
}

impl fmt::Display for PhaseKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PhaseKind::MakeSubvol => f.write_str("make_subvol"),
      PhaseKind::InstallPackages => f.write_str("install_packages"),
    }
  }
}

/// Items whose ordering is determined by their phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseItem {
  /// Snapshot an existing layer. `provides` is the parent's full path set.
  ParentLayer {
    id: String,
    path: PathBuf,
    provides: Vec<ImagePath>,
  },
  /// Start from an empty subvolume.
  FromScratch { id: String },
  /// Install the named packages.
  InstallPackages { id: String, names: Vec<String> },
}

impl PhaseItem {
  pub fn kind(&self) -> PhaseKind {
    match self {
      PhaseItem::ParentLayer { .. } | PhaseItem::FromScratch { .. } => PhaseKind::MakeSubvol,
      PhaseItem::InstallPackages { .. } => PhaseKind::InstallPackages,
    }
  }

  pub fn id(&self) -> &str {
    match self {
      PhaseItem::ParentLayer { id, .. } | PhaseItem::FromScratch { id } | PhaseItem::InstallPackages { id, .. } => id,
    }
  }

  /// Paths known to exist once this item's phase has run, or `None` when
  /// that is only known after the phase has actually run.
  pub fn declared_provides(&self) -> Option<Vec<ImagePath>> {
    match self {
      PhaseItem::ParentLayer { provides, .. } => Some(provides.clone()),
      PhaseItem::FromScratch { .. } => Some(vec![ImagePath::root()]),
      PhaseItem::InstallPackages { .. } => None,
    }
  }
}

/// Any item handed to the dependency graph.
#[derive(Debug, Clone)]
pub enum ImageItem {
  Phase(PhaseItem),
  Dep(Arc<dyn Item>),
}

impl ImageItem {
  /// Wrap an ordinary item.
  pub fn dep(item: impl Item + 'static) -> Self {
    ImageItem::Dep(Arc::new(item))
  }

  pub fn id(&self) -> &str {
    match self {
      ImageItem::Phase(item) => item.id(),
      ImageItem::Dep(item) => item.id(),
    }
  }
}

impl From<PhaseItem> for ImageItem {
  fn from(item: PhaseItem) -> Self {
    ImageItem::Phase(item)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn phase_kinds_are_ordered() {
    assert!(PhaseKind::MakeSubvol < PhaseKind::InstallPackages);
  }

  #[test]
  fn phase_item_provisions() {
    let scratch = PhaseItem::FromScratch { id: "scratch".into() };
    assert_eq!(scratch.kind(), PhaseKind::MakeSubvol);
    assert_eq!(scratch.declared_provides(), Some(vec![ImagePath::root()]));

    let packages = PhaseItem::InstallPackages {
      id: "rpms".into(),
      names: vec!["bash".into()],
    };
    assert_eq!(packages.kind(), PhaseKind::InstallPackages);
    assert!(packages.declared_provides().is_none());
  }
}
