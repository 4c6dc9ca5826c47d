//! Normalized in-image resource paths.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
  #[error("path is empty")]
  Empty,

  #[error("path {0:?} escapes the image root")]
  Escapes(String),

  #[error("path {0:?} is not valid UTF-8")]
  NotUtf8(String),
}

/// An absolute path inside the image being built.
///
/// Always starts with `/`, never ends with `/` (except for the root itself),
/// and never contains `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImagePath(String);

impl ImagePath {
  /// Normalize `raw` into an image path. Relative inputs are anchored at `/`.
  pub fn new(raw: &str) -> Result<Self, PathError> {
    if raw.is_empty() {
      return Err(PathError::Empty);
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
      match part {
        "" | "." => {}
        ".." => return Err(PathError::Escapes(raw.to_string())),
        other => parts.push(other),
      }
    }

    Ok(Self(format!("/{}", parts.join("/"))))
  }

  /// Build an image path from a host path relative to an image root.
  pub fn from_relative(rel: &Path) -> Result<Self, PathError> {
    let mut parts = Vec::new();
    for component in rel.components() {
      match component {
        Component::Normal(part) => {
          let part = part
            .to_str()
            .ok_or_else(|| PathError::NotUtf8(rel.display().to_string()))?;
          parts.push(part);
        }
        Component::CurDir | Component::RootDir => {}
        Component::ParentDir | Component::Prefix(_) => return Err(PathError::Escapes(rel.display().to_string())),
      }
    }
    Ok(Self(format!("/{}", parts.join("/"))))
  }

  /// The image root, `/`.
  pub fn root() -> Self {
    Self("/".to_string())
  }

  pub fn is_root(&self) -> bool {
    self.0 == "/"
  }

  /// The parent directory, or `None` for the root.
  pub fn parent(&self) -> Option<ImagePath> {
    if self.is_root() {
      return None;
    }
    match self.0.rfind('/') {
      Some(0) => Some(Self::root()),
      Some(idx) => Some(Self(self.0[..idx].to_string())),
      None => None,
    }
  }

  /// The path without its leading `/`, suitable for joining onto a host path.
  pub fn as_rel(&self) -> &str {
    &self.0[1..]
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The last path component, or `/` for the root.
  pub fn file_name(&self) -> &str {
    self.0.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("/")
  }
}

impl fmt::Display for ImagePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl TryFrom<String> for ImagePath {
  type Error = PathError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::new(&value)
  }
}

impl From<ImagePath> for String {
  fn from(value: ImagePath) -> Self {
    value.0
  }
}

/// Render a list of paths as `a, b, c` for error messages.
pub fn display_paths(paths: &[ImagePath]) -> String {
  paths.iter().map(ImagePath::as_str).collect::<Vec<_>>().join(", ")
}
