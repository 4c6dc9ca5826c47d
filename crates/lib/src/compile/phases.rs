//! Builders for the statically ordered phases.
//!
//! Each [`PhaseKind`] has exactly one builder, which receives every item of
//! that kind at once.

use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::{META_ARTIFACTS_REQUIRE_REPO, META_FLAVOR_FILE};
use crate::graph::Phase;
use crate::item::{PhaseItem, PhaseKind};
use crate::options::{ConfigError, FlavorConfig, LayerOptions, VersionSet};
use crate::subvol::{Subvol, SubvolError};

#[derive(Debug, Error)]
pub enum PhaseError {
  #[error(transparent)]
  Subvol(#[from] SubvolError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(
    "parent layer has flavor {parent}, but this layer is {layer}; \
     set unsafe_bypass_flavor_check to force a flavor change"
  )]
  FlavorMismatch { parent: String, layer: String },

  #[error("no package repository available for {installer}")]
  NoRepository { installer: &'static str },

  #[error("failed to run {program}: {source}")]
  Spawn {
    program: &'static str,
    #[source]
    source: std::io::Error,
  },

  #[error("`{cmd}` failed with exit code {code:?}: {stderr}")]
  Installer {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("failed to serialize layer metadata: {0}")]
  Meta(#[source] serde_json::Error),

  #[error("phase {phase} got an item of another kind: {item}")]
  WrongKind { phase: PhaseKind, item: String },
}

impl Phase {
  /// Run this phase's builder against the subvolume.
  pub fn build(&self, subvol: &Subvol, opts: &LayerOptions) -> Result<(), PhaseError> {
    match self.kind {
      PhaseKind::MakeSubvol => make_subvol(&self.items, subvol, opts),
      PhaseKind::InstallPackages => install_packages(&self.items, subvol, opts),
    }
  }
}

fn check_parent_flavor(parent: &Path, opts: &LayerOptions) -> Result<(), PhaseError> {
  if opts.flavor.unsafe_bypass_flavor_check {
    warn!(parent = %parent.display(), flavor = %opts.flavor.name, "skipping parent flavor check");
    return Ok(());
  }
  let parent_flavor = FlavorConfig::from_parent_layer(parent)?;
  if parent_flavor.name != opts.flavor.name {
    return Err(PhaseError::FlavorMismatch {
      parent: parent_flavor.name,
      layer: opts.flavor.name.clone(),
    });
  }
  Ok(())
}

fn make_subvol(items: &[PhaseItem], subvol: &Subvol, opts: &LayerOptions) -> Result<(), PhaseError> {
  for item in items {
    match item {
      PhaseItem::ParentLayer { path, .. } => {
        check_parent_flavor(path, opts)?;
        subvol.snapshot_from(path)?;
      }
      PhaseItem::FromScratch { .. } => subvol.create_empty()?,
      PhaseItem::InstallPackages { id, .. } => {
        return Err(PhaseError::WrongKind {
          phase: PhaseKind::MakeSubvol,
          item: id.clone(),
        });
      }
    }
  }

  let flavor = serde_json::to_vec_pretty(&opts.flavor).map_err(PhaseError::Meta)?;
  subvol.write_meta(META_FLAVOR_FILE, &flavor)?;
  if opts.artifacts_may_require_repo {
    subvol.write_meta(META_ARTIFACTS_REQUIRE_REPO, b"1\n")?;
  }
  Ok(())
}

/// Every requested package, sorted and deduplicated.
fn merged_package_names(items: &[PhaseItem]) -> Result<Vec<String>, PhaseError> {
  let mut names = Vec::new();
  for item in items {
    match item {
      PhaseItem::InstallPackages { names: item_names, .. } => names.extend(item_names.iter().cloned()),
      other => {
        return Err(PhaseError::WrongKind {
          phase: PhaseKind::InstallPackages,
          item: other.id().to_string(),
        });
      }
    }
  }
  names.sort();
  names.dedup();
  Ok(names)
}

/// Arguments for one installer run, with pinned versions substituted for
/// their bare names.
fn installer_args(root: &Path, repo_url: &str, names: &[String], version_set: &VersionSet) -> Vec<OsString> {
  let mut args: Vec<OsString> = vec![
    "--installroot".into(),
    root.as_os_str().to_os_string(),
    "--assumeyes".into(),
    "--setopt=reposdir=/dev/null".into(),
    format!("--repofrompath=snapshot,{repo_url}").into(),
    "--repo=snapshot".into(),
    "install".into(),
  ];
  args.extend(
    names
      .iter()
      .flat_map(|name| version_set.install_specs(name))
      .map(OsString::from),
  );
  args
}

fn install_packages(items: &[PhaseItem], subvol: &Subvol, opts: &LayerOptions) -> Result<(), PhaseError> {
  let names = merged_package_names(items)?;
  if names.is_empty() {
    debug!("no packages requested");
    return Ok(());
  }
  subvol.ensure_mutable()?;

  let installer = opts.flavor.rpm_installer.binary();
  let repo_url = opts
    .repo_url
    .as_deref()
    .ok_or(PhaseError::NoRepository { installer })?;
  let root = subvol.path();
  let args = installer_args(&root, repo_url, &names, &opts.version_set);

  let rendered = format!(
    "{installer} {}",
    args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
  );
  info!(
    installer,
    packages = names.len(),
    pinned = !opts.version_set.is_empty(),
    "installing packages"
  );

  let output = Command::new(installer)
    .args(&args)
    .output()
    .map_err(|source| PhaseError::Spawn {
      program: installer,
      source,
    })?;
  if !output.status.success() {
    return Err(PhaseError::Installer {
      cmd: rendered,
      code: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::item::ImagePath;
  use crate::subvol::StorageBackend;
  use tempfile::TempDir;

  fn phase(kind: PhaseKind, items: Vec<PhaseItem>) -> Phase {
    Phase { kind, items }
  }

  #[test]
  fn from_scratch_writes_flavor() {
    let temp = TempDir::new().unwrap();
    let subvol = Subvol::at(temp.path().join("vol"), StorageBackend::Directory);
    let mut opts = LayerOptions::new("//img:test", temp.path());
    opts.artifacts_may_require_repo = true;

    phase(PhaseKind::MakeSubvol, vec![PhaseItem::FromScratch { id: "s".into() }])
      .build(&subvol, &opts)
      .unwrap();

    let flavor = FlavorConfig::from_parent_layer(subvol.raw_path()).unwrap();
    assert_eq!(flavor.name, "default");
    assert!(subvol.raw_path().join(META_ARTIFACTS_REQUIRE_REPO).exists());
  }

  fn built_parent(temp: &TempDir, flavor: &str) -> std::path::PathBuf {
    let parent = Subvol::at(temp.path().join("parent"), StorageBackend::Directory);
    let mut opts = LayerOptions::new("//img:parent", temp.path());
    opts.flavor.name = flavor.to_string();
    phase(PhaseKind::MakeSubvol, vec![PhaseItem::FromScratch { id: "s".into() }])
      .build(&parent, &opts)
      .unwrap();
    parent.create_dir(&ImagePath::new("/etc").unwrap(), 0o755).unwrap();
    parent.set_readonly(true).unwrap();
    parent.raw_path().to_path_buf()
  }

  fn parent_item(path: &std::path::Path) -> PhaseItem {
    PhaseItem::ParentLayer {
      id: "parent".into(),
      path: path.to_path_buf(),
      provides: vec![],
    }
  }

  #[test]
  fn parent_layer_snapshot_keeps_contents() {
    let temp = TempDir::new().unwrap();
    let parent = built_parent(&temp, "default");
    let child = Subvol::at(temp.path().join("child"), StorageBackend::Directory);
    let opts = LayerOptions::new("//img:child", temp.path());

    phase(PhaseKind::MakeSubvol, vec![parent_item(&parent)])
      .build(&child, &opts)
      .unwrap();
    assert!(child.contains(&ImagePath::new("/etc").unwrap()));
  }

  #[test]
  fn flavor_change_needs_bypass() {
    let temp = TempDir::new().unwrap();
    let parent = built_parent(&temp, "centos8");
    let mut opts = LayerOptions::new("//img:child", temp.path());
    opts.flavor.name = "centos9".into();

    let child = Subvol::at(temp.path().join("child"), StorageBackend::Directory);
    let err = phase(PhaseKind::MakeSubvol, vec![parent_item(&parent)])
      .build(&child, &opts)
      .unwrap_err();
    assert!(matches!(err, PhaseError::FlavorMismatch { .. }));
    assert!(!child.exists());

    opts.flavor.unsafe_bypass_flavor_check = true;
    phase(PhaseKind::MakeSubvol, vec![parent_item(&parent)])
      .build(&child, &opts)
      .unwrap();
    let recorded = FlavorConfig::from_parent_layer(child.raw_path()).unwrap();
    assert_eq!(recorded.name, "centos9");
  }

  #[test]
  fn package_names_are_merged() {
    let items = vec![
      PhaseItem::InstallPackages {
        id: "a".into(),
        names: vec!["vim".into(), "bash".into()],
      },
      PhaseItem::InstallPackages {
        id: "b".into(),
        names: vec!["bash".into(), "curl".into()],
      },
    ];
    assert_eq!(merged_package_names(&items).unwrap(), vec!["bash", "curl", "vim"]);
  }

  #[test]
  fn packages_need_a_repository() {
    let temp = TempDir::new().unwrap();
    let subvol = Subvol::at(temp.path().join("vol"), StorageBackend::Directory);
    subvol.create_empty().unwrap();
    let opts = LayerOptions::new("//img:test", temp.path());

    let err = phase(
      PhaseKind::InstallPackages,
      vec![PhaseItem::InstallPackages {
        id: "rpms".into(),
        names: vec!["bash".into()],
      }],
    )
    .build(&subvol, &opts)
    .unwrap_err();
    assert!(matches!(err, PhaseError::NoRepository { installer: "dnf" }));
  }

  #[test]
  fn pinned_versions_reach_the_installer() {
    let pins = VersionSet::parse("0\tbash\t5.1.8\t6.el9\tx86_64\n", Path::new("pins.tsv")).unwrap();
    let names = vec!["bash".to_string(), "curl".to_string()];

    let args = installer_args(Path::new("/subvols/vol"), "http://127.0.0.1:8080", &names, &pins);
    let args: Vec<String> = args.into_iter().map(|a| a.into_string().unwrap()).collect();

    let install = args.iter().position(|a| a == "install").unwrap();
    assert_eq!(&args[install + 1..], ["bash-0:5.1.8-6.el9.x86_64", "curl"]);
    assert_eq!(&args[..2], ["--installroot", "/subvols/vol"]);
    assert!(args.contains(&"--repofrompath=snapshot,http://127.0.0.1:8080".to_string()));
  }

  #[test]
  fn unpinned_names_are_installed_as_given() {
    let names = vec!["vim".to_string()];
    let args = installer_args(Path::new("/vol"), "file:///snap", &names, &VersionSet::default());
    assert_eq!(args.last(), Some(&OsString::from("vim")));
  }
}
