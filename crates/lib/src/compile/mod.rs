//! Build scheduling.
//!
//! [`run`] drives a validated [`DependencyGraph`] against a subvolume:
//! 1. every phase, serially, in kind order
//! 2. every dependency batch, with one blocking task per item and a full
//!    barrier between batches
//! 3. a single seal of the subvolume once everything has succeeded
//!
//! A failing item fails its batch. Siblings already running are allowed to
//! finish, the next batch is never computed, and the subvolume is left
//! unsealed for the caller to discard.

pub mod driver;
pub mod phases;
pub mod types;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::graph::{Batch, DependencyGraph, PhasesProvide};
use crate::item::{ImageItem, Item, ItemError};
use crate::options::LayerOptions;
use crate::subvol::Subvol;

pub use driver::{CompileError, CompileRequest, build_image, build_image_with};
pub use phases::PhaseError;
pub use types::{
  BatchTiming, BuildError, BuildEvent, BuildEventKind, BuildReport, EventRecorder, PhaseTiming, SchedulerConfig,
};

use types::millis;

/// Build `items` into `subvol` and seal it.
pub async fn compile_items_to_subvol(
  items: Vec<ImageItem>,
  subvol: Arc<Subvol>,
  opts: Arc<LayerOptions>,
  config: &SchedulerConfig,
) -> Result<BuildReport, BuildError> {
  let graph = DependencyGraph::construct(items, &opts.layer_target)?;
  run(&graph, subvol, opts, config).await
}

/// Run every phase and batch of `graph`, then seal the subvolume.
pub async fn run(
  graph: &DependencyGraph,
  subvol: Arc<Subvol>,
  opts: Arc<LayerOptions>,
  config: &SchedulerConfig,
) -> Result<BuildReport, BuildError> {
  let started = Instant::now();
  let recorder = EventRecorder::default();
  let mut report = BuildReport::new(graph.layer_target());

  for phase in graph.ordered_phases() {
    let kind = phase.kind;
    let items = phase.items.len();
    info!(phase = %kind, items, "running phase");

    recorder.record(BuildEventKind::PhaseStarted { phase: kind });
    let phase_started = Instant::now();
    let (task_subvol, task_opts) = (Arc::clone(&subvol), Arc::clone(&opts));
    let result = tokio::task::spawn_blocking(move || phase.build(&task_subvol, &task_opts))
      .await
      .map_err(|e| BuildError::Join(e.to_string()))?;
    recorder.record(BuildEventKind::PhaseFinished {
      phase: kind,
      ok: result.is_ok(),
    });
    report.phases.push(PhaseTiming {
      phase: kind,
      items,
      duration_ms: millis(phase_started.elapsed()),
    });

    if let Err(source) = result {
      error!(phase = %kind, error = %source, "phase failed");
      return Err(BuildError::Phase { phase: kind, source });
    }
  }

  let produced = PhasesProvide::scan(&subvol)?;
  let mut batches = graph.dependency_batches(produced);

  while let Some(batch) = batches.next_batch()? {
    info!(batch = batch.index, items = batch.len(), "building batch");
    let batch_started = Instant::now();

    let outcome = if config.concurrent {
      build_concurrently(&batch, &subvol, &opts, &recorder).await
    } else {
      build_serially(&batch, &subvol, &opts, &recorder).await
    };

    report.batches.push(BatchTiming {
      index: batch.index,
      items: batch.ids().into_iter().map(String::from).collect(),
      duration_ms: millis(batch_started.elapsed()),
    });

    if let Some((position, source)) = outcome? {
      let item = &batch.items[position];
      error!(batch = batch.index, item = item.id(), error = %source, "item failed");
      return Err(BuildError::Item {
        item: item.id().to_string(),
        provides: item.provides(),
        batch: batch.index,
        source,
      });
    }
    batches.mark_built(&batch)?;
  }

  subvol.set_readonly(true).map_err(BuildError::Seal)?;
  recorder.record(BuildEventKind::Sealed);

  report.events = recorder.snapshot();
  report.total_ms = millis(started.elapsed());
  info!(
    phases = report.phases.len(),
    batches = report.batches.len(),
    items = report.item_count(),
    "build complete, subvolume sealed"
  );
  Ok(report)
}

/// Outcome of one batch: the earliest failing item (by batch position) and
/// its error, if any.
type BatchOutcome = Result<Option<(usize, ItemError)>, BuildError>;

async fn build_concurrently(
  batch: &Batch,
  subvol: &Arc<Subvol>,
  opts: &Arc<LayerOptions>,
  recorder: &EventRecorder,
) -> BatchOutcome {
  let mut join_set = JoinSet::new();

  for (position, item) in batch.items.iter().enumerate() {
    let item = Arc::clone(item);
    let subvol = Arc::clone(subvol);
    let opts = Arc::clone(opts);
    let recorder = recorder.clone();
    let index = batch.index;

    join_set.spawn_blocking(move || (position, build_one(item.as_ref(), &subvol, &opts, &recorder, index)));
  }

  let mut failures = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok((_, Ok(()))) => {}
      Ok((position, Err(e))) => failures.push((position, e)),
      Err(e) => return Err(BuildError::Join(e.to_string())),
    }
  }

  failures.sort_by_key(|(position, _)| *position);
  Ok(failures.into_iter().next())
}

/// One item at a time; used while profiling. Stops at the first failure
/// since nothing else is in flight.
async fn build_serially(
  batch: &Batch,
  subvol: &Arc<Subvol>,
  opts: &Arc<LayerOptions>,
  recorder: &EventRecorder,
) -> BatchOutcome {
  for (position, item) in batch.items.iter().enumerate() {
    let item = Arc::clone(item);
    let subvol = Arc::clone(subvol);
    let opts = Arc::clone(opts);
    let recorder = recorder.clone();
    let index = batch.index;

    let result = tokio::task::spawn_blocking(move || build_one(item.as_ref(), &subvol, &opts, &recorder, index))
      .await
      .map_err(|e| BuildError::Join(e.to_string()))?;
    if let Err(e) = result {
      return Ok(Some((position, e)));
    }
  }
  Ok(None)
}

fn build_one(
  item: &dyn Item,
  subvol: &Subvol,
  opts: &LayerOptions,
  recorder: &EventRecorder,
  batch: usize,
) -> Result<(), ItemError> {
  recorder.record(BuildEventKind::ItemStarted {
    item: item.id().to_string(),
    batch,
  });
  debug!(item = item.id(), batch, "building item");
  let started = Instant::now();

  let result = catch_unwind(AssertUnwindSafe(|| item.build(subvol, opts)))
    .unwrap_or_else(|payload| Err(ItemError::Panicked(panic_message(payload.as_ref()))));

  recorder.record(BuildEventKind::ItemFinished {
    item: item.id().to_string(),
    batch,
    ok: result.is_ok(),
    duration_ms: millis(started.elapsed()),
  });
  result
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
