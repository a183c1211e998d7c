use crate::executor::ExecutionResult;
use std::collections::BTreeSet;
use std::collections::btree_set;

/// A set of coverage map indices that were hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeSet {
    edges: BTreeSet<usize>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every non-zero byte position of `bitmap` becomes one edge.
    pub fn from_bitmap(bitmap: &[u8]) -> Self {
        bitmap
            .iter()
            .enumerate()
            .filter(|(_, hits)| **hits != 0)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn contains(&self, edge: usize) -> bool {
        self.edges.contains(&edge)
    }

    pub fn is_subset(&self, other: &EdgeSet) -> bool {
        self.edges.is_subset(&other.edges)
    }

    /// Number of edges in `self` that are missing from `known`.
    pub fn count_new(&self, known: &EdgeSet) -> usize {
        self.edges.difference(&known.edges).count()
    }

    /// Adds every edge of `other`, returning how many were new.
    pub fn merge(&mut self, other: &EdgeSet) -> usize {
        let before = self.edges.len();
        self.edges.extend(other.edges.iter().copied());
        self.edges.len() - before
    }

    pub fn iter(&self) -> btree_set::Iter<'_, usize> {
        self.edges.iter()
    }
}

impl FromIterator<usize> for EdgeSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self {
            edges: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a EdgeSet {
    type Item = &'a usize;
    type IntoIter = btree_set::Iter<'a, usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.edges.iter()
    }
}

/// New coverage found by one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    /// Edges seen for the first time.
    pub new_edges: usize,
    /// Size of the global edge set after merging.
    pub total_edges: usize,
}

/// Decides whether an execution is worth keeping.
pub trait Feedback {
    /// Pure check; does not update any state.
    fn is_interesting(&self, result: &ExecutionResult) -> bool;

    /// Folds `result` into the feedback state.
    ///
    /// # Arguments
    /// * `result`: The outcome of the execution that just finished.
    ///
    /// # Returns
    /// `Some` with the newly found coverage exactly when the execution was
    /// interesting, `None` otherwise. Only an interesting result changes state.
    fn observe(&mut self, result: &ExecutionResult) -> Option<Discovery>;
}

/// Keeps the global set of discovered edges. The set only ever grows.
#[derive(Debug, Default)]
pub struct CoverageFeedback {
    known: EdgeSet,
}

impl CoverageFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known_edges(&self) -> &EdgeSet {
        &self.known
    }

    pub fn edge_count(&self) -> usize {
        self.known.len()
    }
}

impl Feedback for CoverageFeedback {
    fn is_interesting(&self, result: &ExecutionResult) -> bool {
        !result.edges.is_empty() && !result.edges.is_subset(&self.known)
    }

    fn observe(&mut self, result: &ExecutionResult) -> Option<Discovery> {
        if !self.is_interesting(result) {
            return None;
        }
        let new_edges = self.known.merge(&result.edges);
        Some(Discovery {
            new_edges,
            total_edges: self.known.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionStatus;

    fn normal(edges: &[usize]) -> ExecutionResult {
        ExecutionResult::new(
            edges.iter().copied().collect(),
            ExecutionStatus::Normal(0),
        )
    }

    #[test]
    fn from_bitmap_takes_non_zero_positions() {
        let mut bitmap = vec![0u8; 16];
        bitmap[0] = 1;
        bitmap[5] = 200;
        bitmap[15] = 255;
        let edges = EdgeSet::from_bitmap(&bitmap);
        assert_eq!(edges.iter().copied().collect::<Vec<_>>(), vec![0, 5, 15]);
        assert!(EdgeSet::from_bitmap(&[0; 8]).is_empty());
    }

    #[test]
    fn coverage_feedback_reports_only_new_edges() {
        let mut feedback = CoverageFeedback::new();

        let first = feedback.observe(&normal(&[5])).expect("edge 5 is new");
        assert_eq!(
            first,
            Discovery {
                new_edges: 1,
                total_edges: 1
            }
        );

        assert!(feedback.observe(&normal(&[5])).is_none());
        assert!(!feedback.is_interesting(&normal(&[5])));

        let second = feedback.observe(&normal(&[5, 7, 9])).unwrap();
        assert_eq!(second.new_edges, 2);
        assert_eq!(second.total_edges, 3);
        assert_eq!(feedback.edge_count(), 3);
    }

    #[test]
    fn empty_edge_sets_are_never_interesting() {
        let mut feedback = CoverageFeedback::new();
        assert!(feedback.observe(&normal(&[])).is_none());
        assert!(feedback.observe(&ExecutionResult::timeout()).is_none());
        assert_eq!(feedback.edge_count(), 0);
    }

    #[test]
    fn known_edges_never_shrink() {
        let mut feedback = CoverageFeedback::new();
        let mut previous = 0;
        for edges in [&[1usize, 2][..], &[2], &[], &[3, 1], &[0]] {
            feedback.observe(&normal(edges));
            assert!(feedback.edge_count() >= previous);
            previous = feedback.edge_count();
        }
        assert_eq!(previous, 4);
    }

    #[test]
    fn is_interesting_does_not_mutate() {
        let feedback = CoverageFeedback::new();
        assert!(feedback.is_interesting(&normal(&[4])));
        assert!(feedback.is_interesting(&normal(&[4])));
        assert_eq!(feedback.known_edges().len(), 0);
    }
}
