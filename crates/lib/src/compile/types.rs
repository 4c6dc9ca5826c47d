//! Types for the build scheduler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::phases::PhaseError;
use crate::graph::GraphError;
use crate::item::path::display_paths;
use crate::item::{ImagePath, ItemError, PhaseKind};
use crate::subvol::SubvolError;

/// Errors that abort a build.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("phase {phase} failed: {source}")]
  Phase {
    phase: PhaseKind,
    #[source]
    source: PhaseError,
  },

  #[error("item {item} (providing {}) failed in batch {batch}: {source}", display_paths(provides))]
  Item {
    item: String,
    provides: Vec<ImagePath>,
    batch: usize,
    #[source]
    source: ItemError,
  },

  #[error("failed to inspect subvolume: {0}")]
  Subvol(#[from] SubvolError),

  #[error("build succeeded but sealing the subvolume failed: {0}")]
  Seal(#[source] SubvolError),

  #[error("build task failed: {0}")]
  Join(String),
}

impl BuildError {
  /// Whether this error indicates a defect rather than bad input.
  pub fn is_internal(&self) -> bool {
    match self {
      BuildError::Item { source, .. } => matches!(
        source,
        ItemError::Panicked(_) | ItemError::Subvol(SubvolError::Sealed { .. })
      ),
      BuildError::Phase {
        source: PhaseError::Subvol(SubvolError::Sealed { .. }),
        ..
      } => true,
      BuildError::Graph(GraphError::BatchOutstanding { .. } | GraphError::BatchNotOutstanding { .. }) => true,
      BuildError::Join(_) => true,
      _ => false,
    }
  }
}

/// How the scheduler executes a batch.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Run a batch's items concurrently. Profiling turns this off so item
  /// timings don't overlap.
  pub concurrent: bool,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self { concurrent: true }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEventKind {
  PhaseStarted { phase: PhaseKind },
  PhaseFinished { phase: PhaseKind, ok: bool },
  ItemStarted { item: String, batch: usize },
  ItemFinished { item: String, batch: usize, ok: bool, duration_ms: u64 },
  Sealed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildEvent {
  /// Global order in which events were recorded.
  pub seq: usize,
  #[serde(flatten)]
  pub kind: BuildEventKind,
}

/// Thread-safe, ordered event log shared with item tasks.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
  events: Arc<Mutex<Vec<BuildEvent>>>,
}

impl EventRecorder {
  pub fn record(&self, kind: BuildEventKind) {
    let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let seq = events.len();
    events.push(BuildEvent { seq, kind });
  }

  pub fn snapshot(&self) -> Vec<BuildEvent> {
    self
      .events
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
  pub phase: PhaseKind,
  pub items: usize,
  pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchTiming {
  pub index: usize,
  pub items: Vec<String>,
  pub duration_ms: u64,
}

/// What happened during a successful build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
  pub layer_target: String,
  pub phases: Vec<PhaseTiming>,
  pub batches: Vec<BatchTiming>,
  pub events: Vec<BuildEvent>,
  pub total_ms: u64,
}

impl BuildReport {
  pub fn new(layer_target: &str) -> Self {
    Self {
      layer_target: layer_target.to_string(),
      ..Default::default()
    }
  }

  pub fn item_count(&self) -> usize {
    self.batches.iter().map(|b| b.items.len()).sum()
  }
}

pub(crate) fn millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
