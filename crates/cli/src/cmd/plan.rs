//! Implementation of the `strata plan` command.
//!
//! Loads the features of a layer and shows the phases and dependency
//! batches a compile would run, without touching any subvolume. Paths
//! provided by package installation are only known at build time, so a
//! layer relying on them may not be plannable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use strata_lib::graph::DependencyGraph;
use strata_lib::item::PhaseKind;
use strata_lib::item::features::{ScratchSpace, load_items};
use strata_lib::options::{LayerOptions, load_targets_and_outputs};

use crate::output::{OutputFormat, print_info, print_json, print_stat, print_warning};

#[derive(Args, Debug)]
pub struct PlanArgs {
  /// Name of the layer being planned
  #[arg(long)]
  pub layer_target: String,

  /// Feature file to plan from (repeatable)
  #[arg(long = "feature-json")]
  pub feature_json: Vec<PathBuf>,

  /// Subvolume the layer would start from
  #[arg(long)]
  pub parent_layer: Option<PathBuf>,

  /// JSON map of build targets to their output paths
  #[arg(long)]
  pub targets_and_outputs: Option<PathBuf>,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

#[derive(Debug, Serialize)]
struct PhasePlan {
  phase: PhaseKind,
  items: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LayerPlan {
  layer_target: String,
  phases: Vec<PhasePlan>,
  batches: Vec<Vec<String>>,
}

pub fn cmd_plan(args: PlanArgs) -> Result<()> {
  let mut opts = LayerOptions::new(&args.layer_target, PathBuf::new());
  if let Some(path) = &args.targets_and_outputs {
    opts.target_to_path = load_targets_and_outputs(path)?;
  }

  let scratch = ScratchSpace::new()?;
  let items = load_items(&args.feature_json, args.parent_layer.as_deref(), &opts, &scratch)
    .context("Failed to load features")?;
  let graph = DependencyGraph::construct(items, &args.layer_target)?;

  if graph.has_opaque_phases() && !args.output.is_json() {
    print_warning("package installation runs first; paths it provides are unknown until build time");
  }

  let phases: Vec<PhasePlan> = graph
    .ordered_phases()
    .into_iter()
    .map(|phase| PhasePlan {
      phase: phase.kind,
      items: phase.items.iter().map(|item| item.id().to_string()).collect(),
    })
    .collect();
  let batches: Vec<Vec<String>> = graph
    .dependency_batches(graph.declared_phase_provides())
    .plan()?
    .iter()
    .map(|batch| batch.ids().into_iter().map(str::to_string).collect())
    .collect();

  let plan = LayerPlan {
    layer_target: args.layer_target,
    phases,
    batches,
  };

  if args.output.is_json() {
    return print_json(&plan);
  }

  print_info(&format!("Layer {}", plan.layer_target));
  for phase in &plan.phases {
    print_stat(&format!("phase {}", phase.phase), &phase.items.join(", "));
  }
  for (index, batch) in plan.batches.iter().enumerate() {
    print_stat(&format!("batch {index}"), &batch.join(", "));
  }
  Ok(())
}
