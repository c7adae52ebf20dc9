//! Dependency-ordered work queue
//!
//! The queue works on the graph restricted to the queued nodes, where two
//! queued nodes linked only through unqueued ones get a direct edge. A node
//! becomes ready once every such parent reached a terminal status. Ready nodes come out in topological order so runs are
//! deterministic for a single thread.

use dagforge_manifest::{DependencyGraph, NodeId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct GraphQueue {
    /// Position in the topological order, used as priority
    rank: BTreeMap<NodeId, usize>,
    /// Unfinished parents per queued node
    pending: BTreeMap<NodeId, usize>,
    /// Children in the queued subgraph
    children: BTreeMap<NodeId, Vec<NodeId>>,
    ready: BTreeSet<(usize, NodeId)>,
    in_progress: BTreeSet<NodeId>,
    finished: BTreeSet<NodeId>,
}

impl GraphQueue {
    /// Queue `order` (a topological order of the nodes to run)
    pub fn new(graph: &DependencyGraph, order: &[NodeId]) -> Self {
        let rank: BTreeMap<NodeId, usize> = order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let queued: BTreeSet<NodeId> = rank.keys().cloned().collect();
        let graph = graph.subgraph(&queued);

        let mut pending = BTreeMap::new();
        let mut ready = BTreeSet::new();
        for (id, position) in &rank {
            let parents = graph.parents(id).len();
            if parents == 0 {
                ready.insert((*position, id.clone()));
            }
            pending.insert(id.clone(), parents);
        }

        Self {
            rank,
            pending,
            children: graph.forward_edges(),
            ready,
            in_progress: BTreeSet::new(),
            finished: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rank.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rank.is_empty()
    }

    /// Every queued node reached a terminal status
    pub fn is_done(&self) -> bool {
        self.finished.len() == self.rank.len()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Take the next ready node
    pub fn next(&mut self) -> Option<NodeId> {
        let (_, id) = self.ready.pop_first()?;
        self.in_progress.insert(id.clone());
        Some(id)
    }

    /// Mark a node finished; returns the nodes that became ready
    pub fn mark_done(&mut self, id: &str) -> Vec<NodeId> {
        self.in_progress.remove(id);
        if !self.finished.insert(id.to_string()) {
            return Vec::new();
        }

        let mut unlocked = Vec::new();
        for child in self.children.get(id).cloned().unwrap_or_default() {
            if self.finished.contains(&child) {
                continue;
            }
            if let Some(count) = self.pending.get_mut(&child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    if let Some(position) = self.rank.get(&child) {
                        self.ready.insert((*position, child.clone()));
                        unlocked.push(child);
                    }
                }
            }
        }
        unlocked
    }

    /// Remove every queued descendant of `id` that has not started
    ///
    /// The removed nodes count as finished and are returned in order.
    pub fn skip_descendants(&mut self, id: &str) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = self.children.get(id).cloned().unwrap_or_default().into();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            queue.extend(self.children.get(&next).cloned().unwrap_or_default());
        }

        let mut skipped: Vec<(usize, NodeId)> = seen
            .into_iter()
            .filter(|n| !self.finished.contains(n) && !self.in_progress.contains(n))
            .filter_map(|n| self.rank.get(&n).map(|r| (*r, n)))
            .collect();
        skipped.sort();

        for (position, node) in &skipped {
            self.ready.remove(&(*position, node.clone()));
            self.finished.insert(node.clone());
        }
        skipped.into_iter().map(|(_, n)| n).collect()
    }

    /// Nodes not started yet, in order
    pub fn drain_remaining(&mut self) -> Vec<NodeId> {
        let mut remaining: Vec<(usize, NodeId)> = self
            .rank
            .iter()
            .filter(|(id, _)| !self.finished.contains(*id) && !self.in_progress.contains(*id))
            .map(|(id, r)| (*r, id.clone()))
            .collect();
        remaining.sort();
        self.ready.clear();
        for (_, id) in &remaining {
            self.finished.insert(id.clone());
        }
        remaining.into_iter().map(|(_, id)| id).collect()
    }
}
