//! Dependency graph over build items.
//!
//! The graph validates a layer's items up front and exposes two traversal
//! orders:
//!
//! - [`DependencyGraph::ordered_phases`]: the fixed sequence of coarse
//!   setup phases, grouped by [`PhaseKind`].
//! - [`DependencyGraph::dependency_batches`]: a lazy sequence of batches of
//!   ordinary items. No member of a batch depends on another member, so a
//!   batch can be built concurrently.
//!
//! Construction fails, before anything touches storage, on:
//! 1. more than one subvolume-making item (`PhaseConflict`)
//! 2. two items providing the same path (`DuplicateProvision`)
//! 3. a requirement nothing provides (`UnsatisfiedRequirement`)
//! 4. a cycle among ordinary items, self-loops included (`CyclicDependency`)

pub mod batches;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::{debug, info};

use crate::item::path::display_paths;
use crate::item::{ImageItem, ImagePath, Item, PhaseItem, PhaseKind};

pub use batches::{Batch, DependencyBatches, PhasesProvide, PreSatisfied};

/// Owner name used when a path is provided by the phases' output.
pub const PHASES_OWNER: &str = "phases";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("both {first} and {second} provide {path}")]
  DuplicateProvision {
    path: ImagePath,
    first: String,
    second: String,
  },

  #[error("phase {phase} accepts a single item, got: {}", items.join(", "))]
  PhaseConflict { phase: PhaseKind, items: Vec<String> },

  #[error("{item} requires {path}, which nothing provides")]
  UnsatisfiedRequirement { item: String, path: ImagePath },

  #[error("dependency cycle between {} over {}", items.join(", "), display_paths(paths))]
  CyclicDependency { items: Vec<String>, paths: Vec<ImagePath> },

  #[error("batch {batch} must be marked built before the next batch is computed")]
  BatchOutstanding { batch: usize },

  #[error("batch {batch} was marked built, but the outstanding batch is {outstanding:?}")]
  BatchNotOutstanding { batch: usize, outstanding: Option<usize> },
}

/// All items of one phase kind, built together by that kind's builder.
#[derive(Debug, Clone)]
pub struct Phase {
  pub kind: PhaseKind,
  pub items: Vec<PhaseItem>,
}

/// A validated dependency graph for one layer.
#[derive(Debug)]
pub struct DependencyGraph {
  layer_target: String,
  phases: BTreeMap<PhaseKind, Vec<PhaseItem>>,

  /// Ordinary items, indexed by position.
  items: Vec<Arc<dyn Item>>,
  provides: Vec<Vec<ImagePath>>,
  requires: Vec<Vec<ImagePath>>,

  /// Ordinary item providing each path.
  provider: HashMap<ImagePath, usize>,

  /// Paths phases are known to provide before they run.
  phase_provides: HashSet<ImagePath>,

  /// Whether some phase provides paths only known after it has run.
  opaque_phases: bool,

  /// Edges run from the providing item to the requiring item.
  graph: DiGraph<usize, ImagePath>,
}

fn dedup(mut paths: Vec<ImagePath>) -> Vec<ImagePath> {
  paths.sort();
  paths.dedup();
  paths
}

impl DependencyGraph {
  /// Validate `items` and index them by provided and required paths.
  pub fn construct(items: Vec<ImageItem>, layer_target: &str) -> Result<Self, GraphError> {
    let mut phases: BTreeMap<PhaseKind, Vec<PhaseItem>> = BTreeMap::new();
    let mut deps = Vec::new();
    for item in items {
      match item {
        ImageItem::Phase(phase) => phases.entry(phase.kind()).or_default().push(phase),
        ImageItem::Dep(dep) => deps.push(dep),
      }
    }

    if let Some(makers) = phases.get(&PhaseKind::MakeSubvol)
      && makers.len() > 1
    {
      return Err(GraphError::PhaseConflict {
        phase: PhaseKind::MakeSubvol,
        items: makers.iter().map(|i| i.id().to_string()).collect(),
      });
    }

    // (path -> owner id) across phases and ordinary items.
    let mut owners: HashMap<ImagePath, String> = HashMap::new();
    let mut phase_provides = HashSet::new();
    let mut opaque_phases = false;

    for phase_item in phases.values().flatten() {
      let Some(declared) = phase_item.declared_provides() else {
        opaque_phases = true;
        continue;
      };
      for path in dedup(declared) {
        if let Some(first) = owners.insert(path.clone(), phase_item.id().to_string()) {
          return Err(GraphError::DuplicateProvision {
            path,
            first,
            second: phase_item.id().to_string(),
          });
        }
        phase_provides.insert(path);
      }
    }

    let provides: Vec<_> = deps.iter().map(|d| dedup(d.provides())).collect();
    let requires: Vec<_> = deps.iter().map(|d| dedup(d.requires())).collect();

    let mut provider = HashMap::new();
    for (idx, dep) in deps.iter().enumerate() {
      for path in &provides[idx] {
        if let Some(first) = owners.insert(path.clone(), dep.id().to_string()) {
          return Err(GraphError::DuplicateProvision {
            path: path.clone(),
            first,
            second: dep.id().to_string(),
          });
        }
        provider.insert(path.clone(), idx);
      }
    }

    for (idx, dep) in deps.iter().enumerate() {
      for path in &requires[idx] {
        let satisfied = provider.contains_key(path) || phase_provides.contains(path);
        if !satisfied && !opaque_phases {
          return Err(GraphError::UnsatisfiedRequirement {
            item: dep.id().to_string(),
            path: path.clone(),
          });
        }
      }
    }

    let mut graph = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..deps.len()).map(|idx| graph.add_node(idx)).collect();
    for (idx, reqs) in requires.iter().enumerate() {
      for path in reqs {
        if let Some(&from) = provider.get(path) {
          graph.add_edge(nodes[from], nodes[idx], path.clone());
        }
      }
    }

    let dep_graph = Self {
      layer_target: layer_target.to_string(),
      phases,
      items: deps,
      provides,
      requires,
      provider,
      phase_provides,
      opaque_phases,
      graph,
    };
    dep_graph.verify_acyclic()?;

    info!(
      layer = layer_target,
      phases = dep_graph.phases.len(),
      items = dep_graph.items.len(),
      "dependency graph constructed"
    );
    Ok(dep_graph)
  }

  /// Reject cycles, reporting the member items and the paths linking them.
  fn verify_acyclic(&self) -> Result<(), GraphError> {
    for scc in tarjan_scc(&self.graph) {
      let cyclic = scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]);
      if !cyclic {
        continue;
      }

      let members: HashSet<NodeIndex> = scc.iter().copied().collect();
      let mut items: Vec<String> = scc
        .iter()
        .map(|&node| self.items[self.graph[node]].id().to_string())
        .collect();
      items.sort();

      let mut paths: Vec<ImagePath> = self
        .graph
        .edge_indices()
        .filter_map(|edge| {
          let (from, to) = self.graph.edge_endpoints(edge)?;
          (members.contains(&from) && members.contains(&to)).then(|| self.graph[edge].clone())
        })
        .collect();
      paths.sort();
      paths.dedup();

      debug!(items = ?items, "cycle detected");
      return Err(GraphError::CyclicDependency { items, paths });
    }
    Ok(())
  }

  pub fn layer_target(&self) -> &str {
    &self.layer_target
  }

  /// Phases in execution order.
  pub fn ordered_phases(&self) -> Vec<Phase> {
    self
      .phases
      .iter()
      .map(|(kind, items)| Phase {
        kind: *kind,
        items: items.clone(),
      })
      .collect()
  }

  /// Start peeling dependency batches, treating `pre` as the output of the
  /// phases.
  pub fn dependency_batches<P: PreSatisfied>(&self, pre: P) -> DependencyBatches<'_, P> {
    DependencyBatches::new(self, pre)
  }

  /// Paths the phases are known to provide without running them.
  pub fn declared_phase_provides(&self) -> &HashSet<ImagePath> {
    &self.phase_provides
  }

  pub fn has_opaque_phases(&self) -> bool {
    self.opaque_phases
  }

  pub fn item_count(&self) -> usize {
    self.items.len()
  }

  pub(crate) fn item(&self, idx: usize) -> &Arc<dyn Item> {
    &self.items[idx]
  }

  pub(crate) fn provides_of(&self, idx: usize) -> &[ImagePath] {
    &self.provides[idx]
  }

  pub(crate) fn requires_of(&self, idx: usize) -> &[ImagePath] {
    &self.requires[idx]
  }

  pub(crate) fn provider_of(&self, path: &ImagePath) -> Option<usize> {
    self.provider.get(path).copied()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::item::ItemError;
  use crate::options::LayerOptions;
  use crate::subvol::Subvol;

  /// An item that only declares paths.
  #[derive(Debug)]
  pub(crate) struct Decl {
    pub id: String,
    pub provides: Vec<ImagePath>,
    pub requires: Vec<ImagePath>,
  }

  impl Item for Decl {
    fn id(&self) -> &str {
      &self.id
    }
    fn provides(&self) -> Vec<ImagePath> {
      self.provides.clone()
    }
    fn requires(&self) -> Vec<ImagePath> {
      self.requires.clone()
    }
    fn build(&self, _subvol: &Subvol, _opts: &LayerOptions) -> Result<(), ItemError> {
      Ok(())
    }
  }

  pub(crate) fn decl(id: &str, provides: &[&str], requires: &[&str]) -> ImageItem {
    ImageItem::dep(Decl {
      id: id.to_string(),
      provides: provides.iter().map(|p| ImagePath::new(p).unwrap()).collect(),
      requires: requires.iter().map(|p| ImagePath::new(p).unwrap()).collect(),
    })
  }

  fn scratch() -> ImageItem {
    PhaseItem::FromScratch { id: "from_scratch".into() }.into()
  }

  fn p(s: &str) -> ImagePath {
    ImagePath::new(s).unwrap()
  }

  #[test]
  fn duplicate_provision_names_both_items() {
    let err = DependencyGraph::construct(
      vec![
        decl("hosts-a", &["/etc/hosts"], &[]),
        decl("hosts-b", &["/etc/hosts"], &[]),
      ],
      "//img:test",
    )
    .unwrap_err();

    assert_eq!(
      err,
      GraphError::DuplicateProvision {
        path: p("/etc/hosts"),
        first: "hosts-a".into(),
        second: "hosts-b".into(),
      }
    );
  }

  #[test]
  fn item_colliding_with_parent_layer_is_duplicate() {
    let parent = PhaseItem::ParentLayer {
      id: "parent".into(),
      path: "/parent".into(),
      provides: vec![ImagePath::root(), p("/etc")],
    };
    let err = DependencyGraph::construct(vec![parent.into(), decl("etc", &["/etc"], &["/"])], "//img:test").unwrap_err();
    assert!(matches!(err, GraphError::DuplicateProvision { first, .. } if first == "parent"));
  }

  #[test]
  fn unsatisfied_requirement() {
    let err = DependencyGraph::construct(vec![scratch(), decl("b", &["/a/b"], &["/a"])], "//img:test").unwrap_err();
    assert_eq!(
      err,
      GraphError::UnsatisfiedRequirement {
        item: "b".into(),
        path: p("/a"),
      }
    );
  }

  #[test]
  fn opaque_phase_defers_unsatisfied_check() {
    let packages = PhaseItem::InstallPackages {
      id: "rpms".into(),
      names: vec!["bash".into()],
    };
    let graph = DependencyGraph::construct(
      vec![scratch(), packages.into(), decl("conf", &["/etc/bash.conf"], &["/etc"])],
      "//img:test",
    )
    .unwrap();
    assert!(graph.has_opaque_phases());
  }

  #[test]
  fn cycle_reports_members_and_paths() {
    let err = DependencyGraph::construct(
      vec![decl("a", &["/a"], &["/b"]), decl("b", &["/b"], &["/a"])],
      "//img:test",
    )
    .unwrap_err();
    assert_eq!(
      err,
      GraphError::CyclicDependency {
        items: vec!["a".into(), "b".into()],
        paths: vec![p("/a"), p("/b")],
      }
    );
  }

  #[test]
  fn self_loop_is_a_cycle() {
    let err = DependencyGraph::construct(vec![decl("loop", &["/x"], &["/x"])], "//img:test").unwrap_err();
    assert!(matches!(err, GraphError::CyclicDependency { items, .. } if items == vec!["loop".to_string()]));
  }

  #[test]
  fn single_subvolume_maker() {
    let parent = PhaseItem::ParentLayer {
      id: "parent".into(),
      path: "/parent".into(),
      provides: vec![ImagePath::root()],
    };
    let err = DependencyGraph::construct(vec![scratch(), parent.into()], "//img:test").unwrap_err();
    assert!(matches!(err, GraphError::PhaseConflict { phase: PhaseKind::MakeSubvol, .. }));
  }

  #[test]
  fn phases_are_ordered_by_kind() {
    let packages = PhaseItem::InstallPackages {
      id: "rpms".into(),
      names: vec![],
    };
    let graph = DependencyGraph::construct(vec![packages.into(), scratch()], "//img:test").unwrap();
    let kinds: Vec<_> = graph.ordered_phases().iter().map(|phase| phase.kind).collect();
    assert_eq!(kinds, vec![PhaseKind::MakeSubvol, PhaseKind::InstallPackages]);
  }
}
