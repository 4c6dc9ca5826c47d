//! Lazy Kahn-style peeling of the dependency graph into batches.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::{DependencyGraph, GraphError, PHASES_OWNER};
use crate::item::{ImagePath, Item};
use crate::subvol::{Subvol, SubvolError};

/// Paths that exist before any dependency batch runs.
pub trait PreSatisfied {
  fn is_satisfied(&self, path: &ImagePath) -> bool;
}

impl PreSatisfied for HashSet<ImagePath> {
  fn is_satisfied(&self, path: &ImagePath) -> bool {
    self.contains(path)
  }
}

impl PreSatisfied for &HashSet<ImagePath> {
  fn is_satisfied(&self, path: &ImagePath) -> bool {
    self.contains(path)
  }
}

/// What the phases actually produced, scanned from the subvolume once they
/// have all run.
#[derive(Debug, Default)]
pub struct PhasesProvide {
  paths: HashSet<ImagePath>,
}

impl PhasesProvide {
  pub fn scan(subvol: &Subvol) -> Result<Self, SubvolError> {
    let paths: HashSet<_> = subvol.scan_paths()?.into_iter().collect();
    debug!(paths = paths.len(), "scanned phase output");
    Ok(Self { paths })
  }

  pub fn len(&self) -> usize {
    self.paths.len()
  }

  pub fn is_empty(&self) -> bool {
    self.paths.is_empty()
  }
}

impl PreSatisfied for PhasesProvide {
  fn is_satisfied(&self, path: &ImagePath) -> bool {
    self.paths.contains(path)
  }
}

/// One group of mutually independent items.
#[derive(Debug, Clone)]
pub struct Batch {
  pub index: usize,
  pub items: Vec<Arc<dyn Item>>,
  members: Vec<usize>,
}

impl Batch {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn ids(&self) -> Vec<&str> {
    self.items.iter().map(|item| item.id()).collect()
  }
}

/// A finite, non-restartable sequence of batches.
///
/// Each batch returned by [`next_batch`](Self::next_batch) must be passed
/// to [`mark_built`](Self::mark_built) before the next one can be computed,
/// since its provisions are what unlock later items.
pub struct DependencyBatches<'g, P> {
  graph: &'g DependencyGraph,
  pre: P,
  remaining: BTreeSet<usize>,
  built: HashSet<usize>,
  outstanding: Option<usize>,
  next_index: usize,
  checked_pre: bool,
}

impl<'g, P: PreSatisfied> DependencyBatches<'g, P> {
  pub(super) fn new(graph: &'g DependencyGraph, pre: P) -> Self {
    Self {
      graph,
      pre,
      remaining: (0..graph.item_count()).collect(),
      built: HashSet::new(),
      outstanding: None,
      next_index: 0,
      checked_pre: false,
    }
  }

  /// Items can't recreate what the phases already produced.
  fn check_pre_collisions(&self) -> Result<(), GraphError> {
    for idx in 0..self.graph.item_count() {
      if let Some(path) = self.graph.provides_of(idx).iter().find(|p| self.pre.is_satisfied(p)) {
        return Err(GraphError::DuplicateProvision {
          path: path.clone(),
          first: PHASES_OWNER.to_string(),
          second: self.graph.item(idx).id().to_string(),
        });
      }
    }
    Ok(())
  }

  fn requirement_met(&self, path: &ImagePath) -> bool {
    match self.graph.provider_of(path) {
      Some(provider) => self.built.contains(&provider),
      None => self.pre.is_satisfied(path),
    }
  }

  /// The first requirement of `idx` that nothing will ever satisfy.
  fn unsatisfiable(&self, idx: usize) -> Option<&ImagePath> {
    self
      .graph
      .requires_of(idx)
      .iter()
      .find(|path| self.graph.provider_of(path).is_none() && !self.pre.is_satisfied(path))
  }

  /// Compute the next batch, or `None` once every item has been emitted.
  pub fn next_batch(&mut self) -> Result<Option<Batch>, GraphError> {
    if let Some(batch) = self.outstanding {
      return Err(GraphError::BatchOutstanding { batch });
    }
    if !self.checked_pre {
      self.check_pre_collisions()?;
      self.checked_pre = true;
    }
    if self.remaining.is_empty() {
      return Ok(None);
    }

    let members: Vec<usize> = self
      .remaining
      .iter()
      .copied()
      .filter(|&idx| self.graph.requires_of(idx).iter().all(|p| self.requirement_met(p)))
      .collect();

    if members.is_empty() {
      let stuck = self
        .remaining
        .iter()
        .find_map(|&idx| self.unsatisfiable(idx).map(|path| (idx, path.clone())));
      let (idx, path) = match stuck {
        Some(found) => found,
        None => {
          // Only reachable with a cycle, which construction rejects.
          let idx = *self.remaining.iter().next().unwrap_or(&0);
          let path = self.graph.requires_of(idx).first().cloned().unwrap_or_else(ImagePath::root);
          (idx, path)
        }
      };
      return Err(GraphError::UnsatisfiedRequirement {
        item: self.graph.item(idx).id().to_string(),
        path,
      });
    }

    for idx in &members {
      self.remaining.remove(idx);
    }

    let index = self.next_index;
    self.next_index += 1;
    self.outstanding = Some(index);

    debug!(batch = index, items = members.len(), "computed dependency batch");
    Ok(Some(Batch {
      index,
      items: members.iter().map(|&idx| Arc::clone(self.graph.item(idx))).collect(),
      members,
    }))
  }

  /// Record that every item of `batch` has been built.
  ///
  /// `batch` must be the one most recently returned by
  /// [`next_batch`](Self::next_batch).
  pub fn mark_built(&mut self, batch: &Batch) -> Result<(), GraphError> {
    if self.outstanding != Some(batch.index) {
      return Err(GraphError::BatchNotOutstanding {
        batch: batch.index,
        outstanding: self.outstanding,
      });
    }
    self.built.extend(batch.members.iter().copied());
    self.outstanding = None;
    Ok(())
  }

  /// Peel every batch without building anything, for planning.
  pub fn plan(mut self) -> Result<Vec<Batch>, GraphError> {
    let mut batches = Vec::new();
    while let Some(batch) = self.next_batch()? {
      self.mark_built(&batch)?;
      batches.push(batch);
    }
    Ok(batches)
  }
}

#[cfg(test)]
mod tests {
  use super::super::tests::decl;
  use super::*;
  use crate::item::{ImageItem, PhaseItem};
  use proptest::prelude::*;

  fn p(s: &str) -> ImagePath {
    ImagePath::new(s).unwrap()
  }

  fn nothing() -> HashSet<ImagePath> {
    HashSet::new()
  }

  #[test]
  fn chain_peels_one_item_per_batch() {
    let graph =
      DependencyGraph::construct(vec![decl("b", &["/a/b"], &["/a"]), decl("a", &["/a"], &[])], "//img:test").unwrap();
    let batches = graph.dependency_batches(nothing()).plan().unwrap();

    let ids: Vec<_> = batches.iter().map(|b| b.ids()).collect();
    assert_eq!(ids, vec![vec!["a"], vec!["b"]]);
  }

  #[test]
  fn independent_items_share_a_batch() {
    let graph =
      DependencyGraph::construct(vec![decl("x", &["/x"], &[]), decl("y", &["/y"], &[])], "//img:test").unwrap();
    let batches = graph.dependency_batches(nothing()).plan().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
  }

  #[test]
  fn side_effect_only_item_lands_in_first_batch() {
    let graph = DependencyGraph::construct(
      vec![decl("a", &["/a"], &[]), decl("b", &["/a/b"], &["/a"]), decl("noop", &[], &[])],
      "//img:test",
    )
    .unwrap();
    let batches = graph.dependency_batches(nothing()).plan().unwrap();
    assert!(batches[0].ids().contains(&"noop"));
  }

  #[test]
  fn next_batch_requires_mark_built() {
    let graph =
      DependencyGraph::construct(vec![decl("a", &["/a"], &[]), decl("b", &["/b"], &["/a"])], "//img:test").unwrap();
    let mut batches = graph.dependency_batches(nothing());

    let first = batches.next_batch().unwrap().unwrap();
    assert_eq!(
      batches.next_batch().unwrap_err(),
      GraphError::BatchOutstanding { batch: 0 }
    );

    batches.mark_built(&first).unwrap();
    let second = batches.next_batch().unwrap().unwrap();
    assert_eq!(second.ids(), vec!["b"]);
    batches.mark_built(&second).unwrap();
    assert!(batches.next_batch().unwrap().is_none());
  }

  #[test]
  fn marking_a_stale_batch_is_rejected() {
    let graph =
      DependencyGraph::construct(vec![decl("a", &["/a"], &[]), decl("b", &["/b"], &["/a"])], "//img:test").unwrap();
    let mut batches = graph.dependency_batches(nothing());

    let first = batches.next_batch().unwrap().unwrap();
    batches.mark_built(&first).unwrap();
    assert_eq!(
      batches.mark_built(&first).unwrap_err(),
      GraphError::BatchNotOutstanding {
        batch: 0,
        outstanding: None
      }
    );

    let second = batches.next_batch().unwrap().unwrap();
    assert_eq!(
      batches.mark_built(&first).unwrap_err(),
      GraphError::BatchNotOutstanding {
        batch: 0,
        outstanding: Some(1)
      }
    );
    // The rejected call leaves the real outstanding batch untouched.
    batches.mark_built(&second).unwrap();
    assert!(batches.next_batch().unwrap().is_none());
  }

  #[test]
  fn pre_satisfied_paths_unlock_items() {
    let packages = PhaseItem::InstallPackages {
      id: "rpms".into(),
      names: vec!["bash".into()],
    };
    let scratch = PhaseItem::FromScratch { id: "from_scratch".into() };
    let items: Vec<ImageItem> = vec![
      scratch.into(),
      packages.into(),
      decl("conf", &["/etc/bash.conf"], &["/etc"]),
    ];
    let graph = DependencyGraph::construct(items, "//img:test").unwrap();

    let produced: HashSet<_> = [p("/"), p("/etc")].into_iter().collect();
    let batches = graph.dependency_batches(produced).plan().unwrap();
    assert_eq!(batches[0].ids(), vec!["conf"]);

    let err = graph.dependency_batches(nothing()).plan().unwrap_err();
    assert_eq!(
      err,
      GraphError::UnsatisfiedRequirement {
        item: "conf".into(),
        path: p("/etc"),
      }
    );
  }

  #[test]
  fn item_recreating_phase_output_is_duplicate() {
    let graph = DependencyGraph::construct(vec![decl("etc", &["/etc"], &[])], "//img:test").unwrap();
    let produced: HashSet<_> = [p("/etc")].into_iter().collect();
    let err = graph.dependency_batches(produced).plan().unwrap_err();
    assert!(matches!(err, GraphError::DuplicateProvision { first, .. } if first == PHASES_OWNER));
  }

  /// Random DAGs: item `i` provides `/i` and may require any `/j`, `j < i`.
  fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..24).prop_flat_map(|n| {
      (0..n)
        .map(|i| proptest::collection::vec(0..i.max(1), 0..4).prop_map(move |reqs| if i == 0 { vec![] } else { reqs }))
        .collect::<Vec<_>>()
    })
  }

  proptest! {
    #[test]
    fn batches_never_contain_dependent_pairs(requires in dag_strategy()) {
      let items: Vec<ImageItem> = requires
        .iter()
        .enumerate()
        .map(|(i, reqs)| {
          let provides = format!("/{i}");
          let reqs: Vec<String> = reqs.iter().map(|j| format!("/{j}")).collect();
          let reqs: Vec<&str> = reqs.iter().map(String::as_str).collect();
          decl(&i.to_string(), &[provides.as_str()], &reqs)
        })
        .collect();
      let graph = DependencyGraph::construct(items, "//img:prop").unwrap();
      let batches = graph.dependency_batches(nothing()).plan().unwrap();

      let total: usize = batches.iter().map(Batch::len).sum();
      prop_assert_eq!(total, requires.len());

      for batch in &batches {
        for a in &batch.items {
          for b in &batch.items {
            let provided = a.provides();
            prop_assert!(b.requires().iter().all(|r| !provided.contains(r)));
          }
        }
      }
    }
  }
}
