//! Lineage graph of snapshots
//!
//! The graph is an arena of snapshot headers keyed by id, with parent links
//! stored as ids and a child index derived from them. There is exactly one
//! root. The head pointer names the snapshot the scopes were last committed
//! from or restored to.
//!
//! The graph only holds headers. Layers stay on disk and are loaded by the
//! resolver when needed.
//!
//! # Thread Safety
//!
//! `LineageGraph` is not synchronized; the engine keeps it behind a lock.

use crate::error::{Result, StrataError};
use crate::snapshot::Snapshot;
use crate::types::PrunePolicy;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace, warn};

/// Structural effect of pruning one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalPlan {
    /// Snapshot the prune was requested for
    pub target: String,
    /// Policy the plan was made under
    pub policy: PrunePolicy,
    /// Snapshots to delete, leaves first
    pub removed: Vec<String>,
    /// Children that move to `new_parent`
    pub reparented: Vec<String>,
    /// Parent of the reparented children (`None` when a child becomes root)
    pub new_parent: Option<String>,
    /// Head after the prune, if it changes
    pub new_head: Option<Option<String>>,
}

/// Tree of immutable snapshot headers
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    nodes: BTreeMap<String, Snapshot>,
    children: BTreeMap<String, Vec<String>>,
    root: Option<String>,
    head: Option<String>,
}

impl LineageGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the graph from stored headers
    ///
    /// Fails on a second root, a missing parent or a cycle. A head that names
    /// an unknown snapshot falls back to the root.
    pub fn from_snapshots(snapshots: Vec<Snapshot>, head: Option<String>) -> Result<Self> {
        let mut graph = Self::new();
        let mut by_id: BTreeMap<String, Snapshot> = BTreeMap::new();

        for snapshot in snapshots {
            if snapshot.is_root() {
                if let Some(existing) = &graph.root {
                    return Err(StrataError::RootAlreadyExists(existing.clone()));
                }
                graph.root = Some(snapshot.id.clone());
            }
            by_id.insert(snapshot.id.clone(), snapshot);
        }

        for snapshot in by_id.values() {
            if let Some(parent) = &snapshot.parent_id {
                if !by_id.contains_key(parent) {
                    return Err(StrataError::MissingParent {
                        id: snapshot.id.clone(),
                        parent: parent.clone(),
                    });
                }
                graph.children.entry(parent.clone()).or_default().push(snapshot.id.clone());
            }
        }
        graph.nodes = by_id;
        for kids in graph.children.values_mut() {
            kids.sort_by(|a, b| {
                let (sa, sb) = (&graph.nodes[a], &graph.nodes[b]);
                sa.created_at.cmp(&sb.created_at).then_with(|| a.cmp(b))
            });
        }

        // Every node must be reachable from the root; anything else sits on a cycle
        let reachable = match &graph.root {
            Some(root) => {
                let mut seen = graph.subtree_ids(root);
                seen.insert(root.clone());
                seen
            }
            None => BTreeSet::new(),
        };
        if let Some(stray) = graph.nodes.keys().find(|id| !reachable.contains(*id)) {
            return Err(StrataError::CycleDetected(stray.clone()));
        }

        graph.head = match head {
            Some(id) if graph.nodes.contains_key(&id) => Some(id),
            Some(id) => {
                warn!("Head {} is not in the lineage; falling back to the root", id);
                graph.root.clone()
            }
            None => None,
        };

        debug!("Loaded lineage with {} snapshot(s)", graph.nodes.len());
        Ok(graph)
    }

    /// Add a new snapshot
    pub fn insert(&mut self, snapshot: Snapshot) -> Result<()> {
        if self.nodes.contains_key(&snapshot.id) {
            return Err(StrataError::InvalidSnapshot {
                id: snapshot.id.clone(),
                reason: "a snapshot with this id already exists".to_string(),
            });
        }
        match &snapshot.parent_id {
            None => {
                if let Some(root) = &self.root {
                    return Err(StrataError::RootAlreadyExists(root.clone()));
                }
                self.root = Some(snapshot.id.clone());
            }
            Some(parent) => {
                if !self.nodes.contains_key(parent) {
                    return Err(StrataError::MissingParent {
                        id: snapshot.id.clone(),
                        parent: parent.clone(),
                    });
                }
                self.children.entry(parent.clone()).or_default().push(snapshot.id.clone());
            }
        }
        trace!("Inserted snapshot {}", snapshot.short_id());
        self.nodes.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    /// Snapshot by id
    pub fn get(&self, id: &str) -> Option<&Snapshot> {
        self.nodes.get(id)
    }

    /// Snapshot by id, or `SnapshotNotFound`
    pub fn require(&self, id: &str) -> Result<&Snapshot> {
        self.nodes.get(id).ok_or_else(|| StrataError::SnapshotNotFound(id.to_string()))
    }

    /// Resolve a full id or a unique id prefix
    pub fn resolve_prefix(&self, prefix: &str) -> Result<&Snapshot> {
        if prefix.is_empty() {
            return Err(StrataError::SnapshotNotFound(String::new()));
        }
        if let Some(exact) = self.nodes.get(prefix) {
            return Ok(exact);
        }
        let mut matches = self.nodes.range(prefix.to_string()..).take_while(|(id, _)| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some((_, only)), None) => Ok(only),
            (None, _) => Err(StrataError::SnapshotNotFound(prefix.to_string())),
            _ => Err(StrataError::AmbiguousSnapshotId {
                prefix: prefix.to_string(),
                matches: self.nodes.keys().filter(|id| id.starts_with(prefix)).count(),
            }),
        }
    }

    /// Whether `id` is in the graph
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of snapshots
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no snapshots
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All snapshots, oldest first
    pub fn snapshots(&self) -> Vec<&Snapshot> {
        let mut all: Vec<&Snapshot> = self.nodes.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// The root snapshot
    pub fn root(&self) -> Option<&Snapshot> {
        self.root.as_ref().and_then(|id| self.nodes.get(id))
    }

    /// The head snapshot
    pub fn head(&self) -> Option<&Snapshot> {
        self.head.as_ref().and_then(|id| self.nodes.get(id))
    }

    /// Id of the head snapshot
    pub fn head_id(&self) -> Option<&str> {
        self.head.as_deref()
    }

    /// Move the head pointer
    pub fn set_head(&mut self, id: &str) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(StrataError::SnapshotNotFound(id.to_string()));
        }
        self.head = Some(id.to_string());
        trace!("Head is now {}", crate::utils::short_id(id));
        Ok(())
    }

    /// Snapshots from the root down to `id`, inclusive
    pub fn chain(&self, id: &str) -> Result<Vec<&Snapshot>> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = self.require(id)?;
        loop {
            if !seen.insert(current.id.as_str()) {
                return Err(StrataError::CycleDetected(current.id.clone()));
            }
            chain.push(current);
            match &current.parent_id {
                None => break,
                Some(parent) => {
                    current = self.nodes.get(parent).ok_or_else(|| StrataError::MissingParent {
                        id: current.id.clone(),
                        parent: parent.clone(),
                    })?;
                }
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Distance from the root
    pub fn depth(&self, id: &str) -> Result<usize> {
        Ok(self.chain(id)?.len() - 1)
    }

    /// Direct children, oldest first
    pub fn children(&self, id: &str) -> Vec<&Snapshot> {
        self.children
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// Every descendant, breadth first
    pub fn descendants(&self, id: &str) -> Vec<&Snapshot> {
        let mut out = Vec::new();
        let mut queue: VecDeque<&String> = self.children.get(id).map(|c| c.iter().collect()).unwrap_or_default();
        while let Some(child) = queue.pop_front() {
            if let Some(snapshot) = self.nodes.get(child) {
                out.push(snapshot);
                if let Some(grandchildren) = self.children.get(child) {
                    queue.extend(grandchildren.iter());
                }
            }
        }
        out
    }

    fn subtree_ids(&self, id: &str) -> BTreeSet<String> {
        self.descendants(id).into_iter().map(|s| s.id.clone()).collect()
    }

    /// Work out what pruning `id` under `policy` does, without changing anything
    pub fn plan_removal(&self, id: &str, policy: PrunePolicy) -> Result<RemovalPlan> {
        let target = self.require(id)?;
        let children: Vec<String> = self.children(id).iter().map(|c| c.id.clone()).collect();

        let (removed, reparented, new_parent) = match policy {
            _ if children.is_empty() => (vec![id.to_string()], Vec::new(), None),
            PrunePolicy::Reject => {
                return Err(StrataError::SnapshotHasChildren {
                    id: id.to_string(),
                    children: children.len(),
                });
            }
            PrunePolicy::Reparent => {
                if target.is_root() && children.len() > 1 {
                    // Several children cannot all become the root
                    return Err(StrataError::SnapshotHasChildren {
                        id: id.to_string(),
                        children: children.len(),
                    });
                }
                (vec![id.to_string()], children, target.parent_id.clone())
            }
            PrunePolicy::Cascade => {
                let mut removed: Vec<String> = self.descendants(id).iter().map(|s| s.id.clone()).collect();
                removed.reverse();
                removed.push(id.to_string());
                (removed, Vec::new(), None)
            }
        };

        let removed_set: BTreeSet<&str> = removed.iter().map(String::as_str).collect();
        let new_head = match self.head.as_deref() {
            Some(head) if removed_set.contains(head) => {
                let survivor = self
                    .chain(head)?
                    .into_iter()
                    .rev()
                    .find(|s| !removed_set.contains(s.id.as_str()))
                    .map(|s| s.id.clone());
                // Pruning a root with a single child under reparent promotes the child
                Some(survivor.or_else(|| reparented.first().cloned()))
            }
            _ => None,
        };

        Ok(RemovalPlan {
            target: id.to_string(),
            policy,
            removed,
            reparented,
            new_parent,
            new_head,
        })
    }

    /// Apply a removal plan once the reattached child headers are persisted
    pub fn apply_removal(&mut self, plan: &RemovalPlan, reattached: Vec<Snapshot>) -> Result<()> {
        let expected: BTreeSet<&str> = plan.reparented.iter().map(String::as_str).collect();
        let got: BTreeSet<&str> = reattached.iter().map(|s| s.id.as_str()).collect();
        if expected != got {
            return Err(StrataError::internal("reattached snapshots do not match the removal plan"));
        }

        for id in &plan.removed {
            if let Some(removed) = self.nodes.remove(id) {
                self.children.remove(id);
                match &removed.parent_id {
                    Some(parent) => {
                        if let Some(siblings) = self.children.get_mut(parent) {
                            siblings.retain(|c| c != id);
                            if siblings.is_empty() {
                                self.children.remove(parent);
                            }
                        }
                    }
                    None => self.root = None,
                }
            }
        }

        for child in reattached {
            match &child.parent_id {
                Some(parent) => {
                    let siblings = self.children.entry(parent.clone()).or_default();
                    siblings.push(child.id.clone());
                }
                None => {
                    if let Some(root) = &self.root {
                        return Err(StrataError::RootAlreadyExists(root.clone()));
                    }
                    self.root = Some(child.id.clone());
                }
            }
            self.nodes.insert(child.id.clone(), child);
        }
        let nodes = &self.nodes;
        for kids in self.children.values_mut() {
            kids.sort_by(|a, b| nodes[a].created_at.cmp(&nodes[b].created_at).then_with(|| a.cmp(b)));
        }

        if let Some(new_head) = &plan.new_head {
            self.head = new_head.clone();
        }
        debug!("Removed {} snapshot(s) from the lineage", plan.removed.len());
        Ok(())
    }

    /// Scopes that have a layer in any snapshot
    pub fn scopes_in_use(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for snapshot in self.nodes.values() {
            for scope in snapshot.scopes.keys() {
                *counts.entry(scope.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Tree view for display
    pub fn tree(&self) -> Option<LineageNode> {
        self.root.as_deref().map(|root| self.build_node(root))
    }

    fn build_node(&self, id: &str) -> LineageNode {
        LineageNode {
            snapshot: self.nodes[id].clone(),
            is_head: self.head.as_deref() == Some(id),
            children: self
                .children
                .get(id)
                .map(|kids| kids.iter().map(|c| self.build_node(c)).collect())
                .unwrap_or_default(),
        }
    }

    /// Summary counts
    pub fn stats(&self) -> LineageStats {
        let leaves = self.nodes.keys().filter(|id| !self.children.contains_key(*id)).count();
        let branch_points = self.children.values().filter(|c| c.len() > 1).count();
        let max_depth = self
            .nodes
            .keys()
            .filter(|id| !self.children.contains_key(*id))
            .filter_map(|id| self.depth(id).ok())
            .max()
            .unwrap_or(0);
        LineageStats {
            total_snapshots: self.nodes.len(),
            leaf_snapshots: leaves,
            branch_points,
            max_depth,
        }
    }
}

/// A snapshot and its subtree, for display
#[derive(Debug, Clone)]
pub struct LineageNode {
    /// Header
    pub snapshot: Snapshot,
    /// Whether this is the head
    pub is_head: bool,
    /// Children, oldest first
    pub children: Vec<LineageNode>,
}

impl LineageNode {
    /// Render the subtree with box-drawing connectors
    pub fn format_tree(&self, prefix: &str, is_last: bool) -> String {
        let mut result = String::new();
        let connector = if is_last { "└── " } else { "├── " };
        let marker = if self.is_head { "* " } else { "" };

        result.push_str(prefix);
        result.push_str(connector);
        result.push_str(marker);
        result.push_str(&self.snapshot.display_format());
        result.push('\n');

        let extension = if is_last { "    " } else { "│   " };
        let child_prefix = format!("{}{}", prefix, extension);
        for (i, child) in self.children.iter().enumerate() {
            result.push_str(&child.format_tree(&child_prefix, i == self.children.len() - 1));
        }
        result
    }
}

/// Lineage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineageStats {
    /// Number of snapshots
    pub total_snapshots: usize,
    /// Snapshots without children
    pub leaf_snapshots: usize,
    /// Snapshots with more than one child
    pub branch_points: usize,
    /// Longest root-to-leaf distance
    pub max_depth: usize,
}
