//! Immutable per-invocation build configuration.
//!
//! [`LayerOptions`] is created once per compile invocation and threaded
//! through every phase and item build. Nothing in it is mutated afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::META_FLAVOR_FILE;
use crate::subvol::StorageBackend;

/// Package manager used by the package installation phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageInstaller {
  #[default]
  Dnf,
  Yum,
}

impl PackageInstaller {
  pub fn binary(self) -> &'static str {
    match self {
      PackageInstaller::Dnf => "dnf",
      PackageInstaller::Yum => "yum",
    }
  }
}

/// Serialized configuration of an image flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorConfig {
  pub name: String,

  /// Target whose output is the build appliance subvolume.
  #[serde(default)]
  pub build_appliance: Option<String>,

  #[serde(default)]
  pub rpm_installer: PackageInstaller,

  /// Directory holding the pinned package-repository snapshot.
  #[serde(default)]
  pub rpm_repo_snapshot: Option<PathBuf>,

  /// Allow a layer to change flavor relative to its parent.
  #[serde(default)]
  pub unsafe_bypass_flavor_check: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid flavor config: {0}")]
  Flavor(#[source] serde_json::Error),

  #[error("no flavor config given and no parent layer to inherit one from")]
  MissingFlavor,

  #[error("failed to read flavor of parent layer {path}: {source}")]
  ParentFlavorIo {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid flavor recorded in parent layer {path}: {source}")]
  ParentFlavorJson {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to read targets-and-outputs file {path}: {source}")]
  TargetsIo {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid targets-and-outputs file {path}: {source}")]
  TargetsJson {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("target {0} has no known output path")]
  UnknownTarget(String),

  #[error("failed to read version set {path}: {source}")]
  VersionSetIo {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{path}:{line}: expected `epoch<TAB>name<TAB>version<TAB>release<TAB>arch`, got {content:?}")]
  VersionSetLine {
    path: PathBuf,
    line: usize,
    content: String,
  },
}

impl FlavorConfig {
  pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
    serde_json::from_str(raw).map_err(ConfigError::Flavor)
  }

  /// Read the flavor a parent layer was built with.
  ///
  /// The unsafe bypass is never inherited: it exists to force a new
  /// flavor onto a single layer.
  pub fn from_parent_layer(parent: &Path) -> Result<Self, ConfigError> {
    let path = parent.join(META_FLAVOR_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::ParentFlavorIo {
      path: path.clone(),
      source,
    })?;
    let mut flavor: FlavorConfig =
      serde_json::from_str(&raw).map_err(|source| ConfigError::ParentFlavorJson { path, source })?;
    flavor.unsafe_bypass_flavor_check = false;
    Ok(flavor)
  }

  /// Use the explicit flavor if given, else inherit the parent's.
  pub fn resolve(explicit: Option<&str>, parent_layer: Option<&Path>) -> Result<Self, ConfigError> {
    match (explicit, parent_layer) {
      (Some(raw), _) => Self::from_json(raw),
      (None, Some(parent)) => Self::from_parent_layer(parent),
      (None, None) => Err(ConfigError::MissingFlavor),
    }
  }
}

/// Load a JSON map of build target name to output path.
pub fn load_targets_and_outputs(path: &Path) -> Result<BTreeMap<String, PathBuf>, ConfigError> {
  let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::TargetsIo {
    path: path.to_path_buf(),
    source,
  })?;
  serde_json::from_str(&raw).map_err(|source| ConfigError::TargetsJson {
    path: path.to_path_buf(),
    source,
  })
}

/// One pinned package build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envra {
  pub epoch: u64,
  pub name: String,
  pub version: String,
  pub release: String,
  pub arch: String,
}

impl Envra {
  fn parse(line: &str) -> Option<Self> {
    let mut fields = line.split('\t');
    let envra = Envra {
      epoch: fields.next()?.parse().ok()?,
      name: fields.next()?.to_string(),
      version: fields.next()?.to_string(),
      release: fields.next()?.to_string(),
      arch: fields.next()?.to_string(),
    };
    let complete = [&envra.name, &envra.version, &envra.release, &envra.arch]
      .iter()
      .all(|field| !field.is_empty());
    (fields.next().is_none() && complete).then_some(envra)
  }

  /// `name-epoch:version-release.arch`, the form dnf and yum install.
  pub fn install_spec(&self) -> String {
    format!(
      "{}-{}:{}-{}.{}",
      self.name, self.epoch, self.version, self.release, self.arch
    )
  }
}

/// Package versions pinned by a version-set override file.
///
/// The file holds one TAB-separated ENVRA per line. A name may be pinned
/// for several architectures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSet {
  pins: BTreeMap<String, Vec<Envra>>,
}

impl VersionSet {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::VersionSetIo {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&raw, path)
  }

  /// Parse the contents of `path`. Blank lines are ignored.
  pub fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
    let mut pins: BTreeMap<String, Vec<Envra>> = BTreeMap::new();
    for (index, line) in raw.lines().enumerate() {
      if line.trim().is_empty() {
        continue;
      }
      let envra = Envra::parse(line).ok_or_else(|| ConfigError::VersionSetLine {
        path: path.to_path_buf(),
        line: index + 1,
        content: line.to_string(),
      })?;
      pins.entry(envra.name.clone()).or_default().push(envra);
    }
    debug!(path = %path.display(), packages = pins.len(), "loaded version set");
    Ok(Self { pins })
  }

  pub fn is_empty(&self) -> bool {
    self.pins.is_empty()
  }

  /// What to ask the installer for to get `name`: its pinned builds, or
  /// the bare name when it is not pinned.
  pub fn install_specs(&self, name: &str) -> Vec<String> {
    match self.pins.get(name) {
      Some(pinned) => pinned.iter().map(Envra::install_spec).collect(),
      None => vec![name.to_string()],
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreflightError {
  #[error("refusing to run with pathological umask 0o{0:o}")]
  PathologicalUmask(u32),
}

/// Process state checked once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preflight {
  pub umask: u32,
}

impl Preflight {
  /// Inspect the process umask.
  ///
  /// A umask denying the owner execute permission makes freshly created
  /// directories untraversable, so it is rejected up front.
  pub fn check() -> Result<Self, PreflightError> {
    use rustix::fs::Mode;
    use rustix::process::umask;

    let current = umask(Mode::empty());
    umask(current);
    Self::from_umask(current.bits())
  }

  pub fn from_umask(umask: u32) -> Result<Self, PreflightError> {
    if umask & 0o100 != 0 {
      return Err(PreflightError::PathologicalUmask(umask));
    }
    debug!(umask = format!("0o{umask:03o}"), "preflight passed");
    Ok(Self { umask })
  }
}

/// Options shared by every item build of one layer.
#[derive(Debug, Clone)]
pub struct LayerOptions {
  /// Name of the layer being built; also its identity in error messages.
  pub layer_target: String,
  pub flavor: FlavorConfig,
  /// Resolved build appliance subvolume, if the flavor names one.
  pub build_appliance: Option<PathBuf>,
  /// URL the package installer should fetch from.
  pub repo_url: Option<String>,
  /// Pinned package versions for the installer.
  pub version_set: VersionSet,
  pub artifacts_may_require_repo: bool,
  pub target_to_path: BTreeMap<String, PathBuf>,
  pub subvolumes_dir: PathBuf,
  /// Layers that may declare host mounts.
  pub allowed_host_mount_targets: BTreeSet<String>,
  pub storage: StorageBackend,
  pub preflight: Preflight,
  pub debug: bool,
}

impl LayerOptions {
  /// Minimal options for `layer_target`, mainly useful for tests.
  pub fn new(layer_target: impl Into<String>, subvolumes_dir: impl Into<PathBuf>) -> Self {
    let layer_target = layer_target.into();
    Self {
      flavor: FlavorConfig {
        name: "default".to_string(),
        build_appliance: None,
        rpm_installer: PackageInstaller::default(),
        rpm_repo_snapshot: None,
        unsafe_bypass_flavor_check: false,
      },
      layer_target,
      build_appliance: None,
      repo_url: None,
      version_set: VersionSet::default(),
      artifacts_may_require_repo: false,
      target_to_path: BTreeMap::new(),
      subvolumes_dir: subvolumes_dir.into(),
      allowed_host_mount_targets: BTreeSet::new(),
      storage: StorageBackend::Directory,
      preflight: Preflight { umask: 0o022 },
      debug: false,
    }
  }

  /// Output path of a referenced build target.
  pub fn target_path(&self, target: &str) -> Result<&Path, ConfigError> {
    self
      .target_to_path
      .get(target)
      .map(PathBuf::as_path)
      .ok_or_else(|| ConfigError::UnknownTarget(target.to_string()))
  }

  pub fn host_mounts_allowed(&self) -> bool {
    self.allowed_host_mount_targets.contains(&self.layer_target)
  }
}
