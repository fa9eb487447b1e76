//! Rooted, strictly bifurcating time trees.
//!
//! Uses arena-style storage: nodes live in a flat `Vec` and are referenced
//! by `NodeId` (a `usize` index). Tips occupy ids `0..tip_count`, internal
//! nodes follow. Node heights and parent/child links are [`Versioned`], so
//! the whole tree takes part in the store/accept/restore protocol without
//! copying any node data.
//!
//! Structural changes go through a [`TreeEdit`] transaction: detach and
//! attach children freely, then [`TreeEdit::commit`] validates the result
//! and either publishes [`TreeEvent::Topology`] notifications or rolls the
//! tree back to its pre-edit shape.

use std::sync::atomic::{AtomicU64, Ordering};

use sylva_core::{
    EventBus, Listenable, Result, Storable, SubscriptionId, Summarizable, SylvaError, Versioned,
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

fn next_instance() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// Index into the tree's node arena.
pub type NodeId = usize;

/// Change notification published by a [`TimeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TreeEvent {
    /// The node's height changed, which moves its own branch and the
    /// branches of its children.
    Height(NodeId),
    /// The node's child set changed.
    Topology(NodeId),
}

impl TreeEvent {
    /// The node the event refers to.
    pub fn node(self) -> NodeId {
        match self {
            TreeEvent::Height(n) | TreeEvent::Topology(n) => n,
        }
    }
}

/// One coalescence used to build a tree: `left` and `right` join under a
/// new internal node at `height`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Join {
    pub left: NodeId,
    pub right: NodeId,
    pub height: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Links {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
struct Node {
    taxon: Option<String>,
    height: Versioned<f64>,
    links: Versioned<Links>,
}

/// A rooted binary tree with node heights, stored as an arena of nodes.
///
/// A clone is a new tree: it gets its own [`instance_id`](Self::instance_id)
/// and starts without subscribers.
#[derive(Debug)]
pub struct TimeTree {
    nodes: Vec<Node>,
    root: Versioned<NodeId>,
    tip_count: usize,
    events: EventBus<TreeEvent>,
    instance: u64,
}

impl Clone for TimeTree {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            root: self.root.clone(),
            tip_count: self.tip_count,
            events: EventBus::new(),
            instance: next_instance(),
        }
    }
}

impl TimeTree {
    /// Build a tree from tip names, tip heights and `tip_count - 1` joins.
    ///
    /// Join `k` creates internal node `tip_count + k`; the last join is the
    /// root. Each join may only reference nodes created before it, and every
    /// node except the root must be joined exactly once.
    ///
    /// Heights are not required to be ordered; see
    /// [`is_valid_state`](Self::is_valid_state).
    pub fn new(taxa: Vec<String>, tip_heights: Vec<f64>, joins: &[Join]) -> Result<Self> {
        let tip_count = taxa.len();
        if tip_count < 2 {
            return Err(SylvaError::InvalidInput(format!(
                "a tree needs at least 2 tips, got {}",
                tip_count
            )));
        }
        if tip_heights.len() != tip_count {
            return Err(SylvaError::InvalidInput(format!(
                "expected {} tip heights, got {}",
                tip_count,
                tip_heights.len()
            )));
        }
        if joins.len() != tip_count - 1 {
            return Err(SylvaError::InvalidInput(format!(
                "expected {} joins for {} tips, got {}",
                tip_count - 1,
                tip_count,
                joins.len()
            )));
        }
        let mut sorted: Vec<&str> = taxa.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(SylvaError::InvalidInput(format!(
                "duplicate taxon name '{}'",
                w[0]
            )));
        }

        let mut nodes: Vec<Node> = Vec::with_capacity(2 * tip_count - 1);
        for (name, &h) in taxa.into_iter().zip(&tip_heights) {
            if !h.is_finite() {
                return Err(SylvaError::InvalidInput(format!(
                    "tip '{}' has non-finite height {}",
                    name, h
                )));
            }
            nodes.push(Node {
                taxon: Some(name),
                height: Versioned::new(h),
                links: Versioned::new(Links::default()),
            });
        }

        let mut parents: Vec<Option<NodeId>> = vec![None; 2 * tip_count - 1];
        for (k, join) in joins.iter().enumerate() {
            let id = tip_count + k;
            for child in [join.left, join.right] {
                if child >= id {
                    return Err(SylvaError::InvalidInput(format!(
                        "join {} references node {} which does not exist yet",
                        k, child
                    )));
                }
                if parents[child].is_some() {
                    return Err(SylvaError::InvalidInput(format!(
                        "node {} is joined more than once",
                        child
                    )));
                }
                parents[child] = Some(id);
            }
            if join.left == join.right {
                return Err(SylvaError::InvalidInput(format!(
                    "join {} uses node {} twice",
                    k, join.left
                )));
            }
            if !join.height.is_finite() {
                return Err(SylvaError::InvalidInput(format!(
                    "join {} has non-finite height {}",
                    k, join.height
                )));
            }
            nodes.push(Node {
                taxon: None,
                height: Versioned::new(join.height),
                links: Versioned::new(Links {
                    parent: None,
                    children: vec![join.left, join.right],
                }),
            });
        }
        for (node, parent) in nodes.iter_mut().zip(parents) {
            node.links.modify(|l| l.parent = parent);
            node.links.accept();
        }

        let tree = Self {
            root: Versioned::new(nodes.len() - 1),
            nodes,
            tip_count,
            events: EventBus::new(),
            instance: next_instance(),
        };
        tree.validate()?;
        Ok(tree)
    }

    /// Parse a rooted, strictly bifurcating Newick string.
    pub fn from_newick(input: &str) -> Result<Self> {
        crate::newick::parse(input)
    }

    /// Serialize the current tree to Newick with branch lengths.
    pub fn to_newick(&self) -> String {
        crate::newick::write(self)
    }

    /// Process-unique token identifying this tree.
    pub fn instance_id(&self) -> u64 {
        self.instance
    }

    /// The root node id.
    #[inline]
    pub fn root(&self) -> NodeId {
        *self.root.get()
    }

    /// Parent of `node` (None for the root).
    ///
    /// # Panics
    ///
    /// Panics if `node` is out of range, like slice indexing.
    #[inline]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].links.get().parent
    }

    /// Ordered children of `node` (empty for tips).
    #[inline]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].links.get().children
    }

    /// The `i`-th child of `node`.
    #[inline]
    pub fn child(&self, node: NodeId, i: usize) -> Option<NodeId> {
        self.children(node).get(i).copied()
    }

    /// Number of children of `node`.
    #[inline]
    pub fn child_count(&self, node: NodeId) -> usize {
        self.children(node).len()
    }

    /// Height (age) of `node`.
    #[inline]
    pub fn height(&self, node: NodeId) -> f64 {
        *self.nodes[node].height.get()
    }

    /// Length of the branch above `node`: `height(parent) - height(node)`.
    #[inline]
    pub fn branch_length(&self, node: NodeId) -> Option<f64> {
        self.parent(node)
            .map(|p| self.height(p) - self.height(node))
    }

    /// True for tips.
    #[inline]
    pub fn is_leaf(&self, node: NodeId) -> bool {
        node < self.tip_count
    }

    /// True for the root.
    #[inline]
    pub fn is_root(&self, node: NodeId) -> bool {
        node == self.root()
    }

    /// Taxon name of a tip.
    pub fn taxon_name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node).and_then(|n| n.taxon.as_deref())
    }

    /// The tip carrying `name`.
    pub fn tip_by_name(&self, name: &str) -> Option<NodeId> {
        (0..self.tip_count).find(|&id| self.nodes[id].taxon.as_deref() == Some(name))
    }

    /// True if `node` is a valid id.
    #[inline]
    pub fn contains(&self, node: NodeId) -> bool {
        node < self.nodes.len()
    }

    /// Number of tips.
    #[inline]
    pub fn tip_count(&self) -> usize {
        self.tip_count
    }

    /// Total number of nodes.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of internal nodes, root included.
    #[inline]
    pub fn internal_count(&self) -> usize {
        self.nodes.len() - self.tip_count
    }

    /// Post-order (children before parent) node ids.
    pub fn postorder(&self) -> Vec<NodeId> {
        // Reverse of a preorder that visits the rightmost child first.
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            result.push(id);
            stack.extend_from_slice(self.children(id));
        }
        result.reverse();
        result
    }

    /// Pre-order (parent before children) node ids.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            result.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        result
    }

    /// Ancestors of `node`, nearest first, ending at the root.
    pub fn ancestors(&self, node: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.parent(node),
        }
    }

    /// Number of tips reachable from the root.
    pub fn reachable_tip_count(&self) -> usize {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![self.root()];
        let mut tips = 0;
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id], true) {
                continue;
            }
            if self.is_leaf(id) {
                tips += 1;
            }
            stack.extend_from_slice(self.children(id));
        }
        tips
    }

    /// True if every height is finite and no branch length is negative.
    pub fn is_valid_state(&self) -> bool {
        (0..self.nodes.len()).all(|id| {
            self.height(id).is_finite() && self.branch_length(id).map_or(true, |b| b >= 0.0)
        })
    }

    /// True if every child is strictly younger than its parent.
    pub fn is_height_ordered(&self) -> bool {
        (0..self.nodes.len()).all(|id| self.branch_length(id).map_or(true, |b| b > 0.0))
    }

    /// Set the height of `node` and notify subscribers.
    pub fn set_height(&mut self, node: NodeId, height: f64) -> Result<()> {
        self.check_node(node)?;
        if !height.is_finite() {
            return Err(SylvaError::InvalidInput(format!(
                "non-finite height {} for node {}",
                height, node
            )));
        }
        self.nodes[node].height.set(height);
        self.events.publish(TreeEvent::Height(node));
        Ok(())
    }

    /// Set the branch above `node` by moving `node` relative to its parent.
    pub fn set_branch_length(&mut self, node: NodeId, length: f64) -> Result<()> {
        self.check_node(node)?;
        let parent = self.parent(node).ok_or_else(|| {
            SylvaError::InvalidInput(format!("root node {} has no branch", node))
        })?;
        self.set_height(node, self.height(parent) - length)
    }

    /// Open an edit transaction.
    pub fn begin_edit(&mut self) -> TreeEdit<'_> {
        TreeEdit {
            tree: self,
            log: Vec::new(),
            finished: false,
        }
    }

    /// Check every structural invariant of the current tree.
    pub fn validate(&self) -> Result<()> {
        let root = self.find_root()?;
        if root != self.root() {
            return Err(SylvaError::InvalidTree(format!(
                "recorded root {} has a parent; actual root is {}",
                self.root(),
                root
            )));
        }
        self.validate_from(root)
    }

    fn find_root(&self) -> Result<NodeId> {
        let mut roots = (0..self.nodes.len()).filter(|&id| self.parent(id).is_none());
        match (roots.next(), roots.next()) {
            (Some(root), None) => Ok(root),
            (None, _) => Err(SylvaError::InvalidTree("no root: every node has a parent".into())),
            (Some(a), Some(b)) => Err(SylvaError::InvalidTree(format!(
                "more than one parentless node ({} and {})",
                a, b
            ))),
        }
    }

    fn validate_from(&self, root: NodeId) -> Result<()> {
        for id in 0..self.nodes.len() {
            let children = self.children(id);
            let expected = if self.is_leaf(id) { 0 } else { 2 };
            if children.len() != expected {
                return Err(SylvaError::InvalidTree(format!(
                    "node {} has {} children, expected {}",
                    id,
                    children.len(),
                    expected
                )));
            }
            for &child in children {
                if self.parent(child) != Some(id) {
                    return Err(SylvaError::InvalidTree(format!(
                        "node {} lists child {} whose parent is {:?}",
                        id,
                        child,
                        self.parent(child)
                    )));
                }
            }
        }

        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        let mut visited = 0;
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id], true) {
                return Err(SylvaError::InvalidTree(format!("cycle through node {}", id)));
            }
            visited += 1;
            stack.extend_from_slice(self.children(id));
        }
        if visited != self.nodes.len() {
            let orphan = seen.iter().position(|&s| !s).unwrap_or_default();
            return Err(SylvaError::InvalidTree(format!(
                "{} nodes unreachable from root {} (first: {})",
                self.nodes.len() - visited,
                root,
                orphan
            )));
        }
        Ok(())
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node >= self.nodes.len() {
            return Err(SylvaError::InvalidInput(format!(
                "node index {} out of range ({})",
                node,
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

impl Storable for TimeTree {
    fn store_state(&mut self) {
        self.events.store();
        self.root.store();
        for node in &mut self.nodes {
            node.height.store();
            node.links.store();
        }
    }

    fn restore_state(&mut self) {
        self.root.restore();
        for node in &mut self.nodes {
            node.height.restore();
            node.links.restore();
        }
        self.events.restore();
    }

    fn accept_state(&mut self) {
        self.events.accept();
        self.root.accept();
        for node in &mut self.nodes {
            node.height.accept();
            node.links.accept();
        }
    }
}

impl Listenable for TimeTree {
    type Event = TreeEvent;

    fn subscribe(&mut self) -> SubscriptionId {
        self.events.subscribe()
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        self.events.unsubscribe(id);
    }

    fn drain_events(&mut self, id: SubscriptionId) -> Vec<TreeEvent> {
        self.events.drain(id)
    }
}

impl Summarizable for TimeTree {
    fn summary(&self) -> String {
        format!(
            "TimeTree: {} nodes ({} tips), root height {}",
            self.node_count(),
            self.tip_count,
            self.height(self.root())
        )
    }
}

/// Iterator over the ancestors of a node.
pub struct Ancestors<'a> {
    tree: &'a TimeTree,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree.parent(id);
        Some(id)
    }
}

#[derive(Debug, Clone, Copy)]
enum EditOp {
    Removed {
        parent: NodeId,
        child: NodeId,
        index: usize,
    },
    Added {
        parent: NodeId,
        child: NodeId,
    },
}

/// A structural edit in progress.
///
/// Dropping the guard without a successful [`commit`](Self::commit) rolls
/// every change back, so readers never observe a half-edited tree.
pub struct TreeEdit<'a> {
    tree: &'a mut TimeTree,
    log: Vec<EditOp>,
    finished: bool,
}

impl TreeEdit<'_> {
    /// Detach `child` from `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.tree.check_node(parent)?;
        self.tree.check_node(child)?;
        let index = self
            .tree
            .children(parent)
            .iter()
            .position(|&c| c == child)
            .ok_or_else(|| {
                SylvaError::InvalidTree(format!("node {} is not a child of {}", child, parent))
            })?;
        self.tree.nodes[parent].links.modify(|l| {
            l.children.remove(index);
        });
        self.tree.nodes[child].links.modify(|l| l.parent = None);
        self.log.push(EditOp::Removed {
            parent,
            child,
            index,
        });
        Ok(())
    }

    /// Attach the detached node `child` under `parent`.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.tree.check_node(parent)?;
        self.tree.check_node(child)?;
        if parent == child {
            return Err(SylvaError::InvalidTree(format!(
                "node {} cannot be its own child",
                child
            )));
        }
        if self.tree.is_leaf(parent) {
            return Err(SylvaError::InvalidTree(format!(
                "cannot attach {} under tip {}",
                child, parent
            )));
        }
        if let Some(current) = self.tree.parent(child) {
            return Err(SylvaError::InvalidTree(format!(
                "node {} is still attached to {}",
                child, current
            )));
        }
        if self.tree.child_count(parent) >= 2 {
            return Err(SylvaError::InvalidTree(format!(
                "node {} already has two children",
                parent
            )));
        }
        self.tree.nodes[parent].links.modify(|l| l.children.push(child));
        self.tree.nodes[child].links.modify(|l| l.parent = Some(parent));
        self.log.push(EditOp::Added { parent, child });
        Ok(())
    }

    /// Validate the edited tree and publish topology events.
    ///
    /// On failure the tree is rolled back and [`SylvaError::InvalidTree`]
    /// is returned.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let checked = self
            .tree
            .find_root()
            .and_then(|root| self.tree.validate_from(root).map(|()| root));
        let root = match checked {
            Ok(root) => root,
            Err(e) => {
                self.rollback();
                return Err(e);
            }
        };
        if root != self.tree.root() {
            self.tree.root.set(root);
        }

        let mut touched: Vec<NodeId> = Vec::with_capacity(self.log.len());
        for op in self.log.drain(..) {
            let parent = match op {
                EditOp::Removed { parent, .. } | EditOp::Added { parent, .. } => parent,
            };
            if !touched.contains(&parent) {
                touched.push(parent);
            }
        }
        for node in touched {
            self.tree.events.publish(TreeEvent::Topology(node));
        }
        Ok(())
    }

    fn rollback(&mut self) {
        while let Some(op) = self.log.pop() {
            match op {
                EditOp::Removed {
                    parent,
                    child,
                    index,
                } => {
                    self.tree.nodes[parent]
                        .links
                        .modify(|l| l.children.insert(index, child));
                    self.tree.nodes[child]
                        .links
                        .modify(|l| l.parent = Some(parent));
                }
                EditOp::Added { parent, child } => {
                    self.tree.nodes[parent].links.modify(|l| {
                        if let Some(pos) = l.children.iter().rposition(|&c| c == child) {
                            l.children.remove(pos);
                        }
                    });
                    self.tree.nodes[child].links.modify(|l| l.parent = None);
                }
            }
        }
    }
}

impl Drop for TreeEdit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ((A:1,B:1)AB:1,(C:0.5,D:0.5)CD:1.5) with root height 2.
    fn sample_tree() -> TimeTree {
        TimeTree::new(
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
            vec![0.0; 4],
            &[
                Join { left: 0, right: 1, height: 1.0 },
                Join { left: 2, right: 3, height: 0.5 },
                Join { left: 4, right: 5, height: 2.0 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn ids_and_counts() {
        let tree = sample_tree();
        assert_eq!(tree.tip_count(), 4);
        assert_eq!(tree.node_count(), 7);
        assert_eq!(tree.internal_count(), 3);
        assert_eq!(tree.root(), 6);
        assert!(tree.is_leaf(0));
        assert!(!tree.is_leaf(4));
        assert_eq!(tree.taxon_name(2), Some("C"));
        assert_eq!(tree.tip_by_name("D"), Some(3));
        assert_eq!(tree.taxon_name(5), None);
    }

    #[test]
    fn parent_child_queries() {
        let tree = sample_tree();
        assert_eq!(tree.parent(0), Some(4));
        assert_eq!(tree.parent(6), None);
        assert_eq!(tree.child(6, 0), Some(4));
        assert_eq!(tree.child(6, 1), Some(5));
        assert_eq!(tree.child(6, 2), None);
        assert_eq!(tree.child_count(0), 0);
        assert_eq!(tree.ancestors(2).collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn branch_lengths_from_heights() {
        let tree = sample_tree();
        assert_eq!(tree.branch_length(0), Some(1.0));
        assert_eq!(tree.branch_length(2), Some(0.5));
        assert_eq!(tree.branch_length(5), Some(1.5));
        assert_eq!(tree.branch_length(6), None);
    }

    #[test]
    fn traversal_orders() {
        let tree = sample_tree();
        assert_eq!(tree.postorder(), vec![0, 1, 4, 2, 3, 5, 6]);
        assert_eq!(tree.preorder(), vec![6, 4, 0, 1, 5, 2, 3]);
    }

    #[test]
    fn rejects_duplicate_taxa() {
        let err = TimeTree::new(
            vec!["A".into(), "A".into()],
            vec![0.0; 2],
            &[Join { left: 0, right: 1, height: 1.0 }],
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_node_joined_twice() {
        let err = TimeTree::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec![0.0; 3],
            &[
                Join { left: 0, right: 1, height: 1.0 },
                Join { left: 0, right: 3, height: 2.0 },
            ],
        );
        assert!(err.is_err());
    }

    #[test]
    fn set_height_publishes_event() {
        let mut tree = sample_tree();
        let sub = tree.subscribe();
        tree.set_height(4, 1.2).unwrap();
        assert_eq!(tree.height(4), 1.2);
        assert_eq!(tree.drain_events(sub), vec![TreeEvent::Height(4)]);
        assert!(tree.drain_events(sub).is_empty());
    }

    #[test]
    fn set_branch_length_moves_child() {
        let mut tree = sample_tree();
        tree.set_branch_length(0, 0.25).unwrap();
        assert!((tree.height(0) - 0.75).abs() < 1e-12);
        assert!(tree.set_branch_length(6, 1.0).is_err());
    }

    #[test]
    fn negative_branch_is_invalid_state() {
        let mut tree = sample_tree();
        assert!(tree.is_valid_state());
        tree.set_height(0, 1.5).unwrap();
        assert!(!tree.is_valid_state());
        assert!(!tree.is_height_ordered());
    }

    #[test]
    fn committed_swap_changes_topology() {
        let mut tree = sample_tree();
        let sub = tree.subscribe();
        let mut edit = tree.begin_edit();
        edit.remove_child(4, 0).unwrap();
        edit.remove_child(5, 2).unwrap();
        edit.add_child(5, 0).unwrap();
        edit.add_child(4, 2).unwrap();
        edit.commit().unwrap();

        assert_eq!(tree.parent(0), Some(5));
        assert_eq!(tree.parent(2), Some(4));
        assert_eq!(tree.children(4), &[1, 2]);
        assert!(tree.validate().is_ok());
        assert_eq!(
            tree.drain_events(sub),
            vec![TreeEvent::Topology(4), TreeEvent::Topology(5)]
        );
    }

    #[test]
    fn invalid_commit_rolls_back() {
        let mut tree = sample_tree();
        let sub = tree.subscribe();
        let before = tree.to_newick();
        let mut edit = tree.begin_edit();
        edit.remove_child(4, 0).unwrap();
        let err = edit.commit().unwrap_err();
        assert!(matches!(err, SylvaError::InvalidTree(_)));
        assert_eq!(tree.to_newick(), before);
        assert_eq!(tree.children(4), &[0, 1]);
        assert!(tree.validate().is_ok());
        assert!(tree.drain_events(sub).is_empty());
    }

    #[test]
    fn dropped_edit_rolls_back() {
        let mut tree = sample_tree();
        {
            let mut edit = tree.begin_edit();
            edit.remove_child(6, 5).unwrap();
            edit.remove_child(4, 1).unwrap();
            edit.add_child(4, 5).unwrap();
        }
        assert_eq!(tree.children(4), &[0, 1]);
        assert_eq!(tree.children(6), &[4, 5]);
        assert_eq!(tree.parent(5), Some(6));
    }

    #[test]
    fn add_child_guards() {
        let mut tree = sample_tree();
        let mut edit = tree.begin_edit();
        assert!(edit.add_child(4, 2).is_err(), "2 is still attached");
        edit.remove_child(5, 2).unwrap();
        assert!(edit.add_child(4, 2).is_err(), "4 already has two children");
        assert!(edit.add_child(0, 2).is_err(), "tips cannot have children");
        assert!(edit.remove_child(4, 3).is_err(), "3 is not a child of 4");
    }

    #[test]
    fn cycle_is_rejected() {
        let mut tree = sample_tree();
        // Regraft AB under CD: root -> [CD, A], CD -> [D, AB], AB -> [B, C].
        let mut edit = tree.begin_edit();
        edit.remove_child(6, 4).unwrap();
        edit.remove_child(4, 0).unwrap();
        edit.add_child(6, 0).unwrap();
        edit.remove_child(5, 2).unwrap();
        edit.add_child(4, 2).unwrap();
        edit.add_child(5, 4).unwrap();
        edit.commit().unwrap();
        assert!(tree.validate().is_ok());

        // Hanging CD under its own child AB detaches a CD <-> AB cycle.
        let mut edit = tree.begin_edit();
        edit.remove_child(6, 5).unwrap();
        edit.remove_child(4, 1).unwrap();
        edit.add_child(4, 5).unwrap();
        edit.add_child(6, 1).unwrap();
        assert!(matches!(edit.commit(), Err(SylvaError::InvalidTree(_))));
        assert!(tree.validate().is_ok());
        assert_eq!(tree.reachable_tip_count(), 4);
    }

    #[test]
    fn restore_reverts_heights_and_topology() {
        let mut tree = sample_tree();
        let sub = tree.subscribe();
        let before = tree.to_newick();
        tree.store_state();
        tree.set_height(5, 0.9).unwrap();
        let mut edit = tree.begin_edit();
        edit.remove_child(4, 0).unwrap();
        edit.remove_child(5, 2).unwrap();
        edit.add_child(5, 0).unwrap();
        edit.add_child(4, 2).unwrap();
        edit.commit().unwrap();
        assert_ne!(tree.to_newick(), before);

        tree.restore_state();
        assert_eq!(tree.to_newick(), before);
        assert_eq!(tree.height(5), 0.5);
        assert!(tree.validate().is_ok());
        assert_eq!(tree.drain_events(sub), Vec::new());
    }

    #[test]
    fn restore_keeps_events_published_before_store() {
        let mut tree = sample_tree();
        let sub = tree.subscribe();
        tree.set_height(4, 1.2).unwrap();
        tree.store_state();
        tree.set_height(5, 0.7).unwrap();
        assert_eq!(
            tree.drain_events(sub),
            vec![TreeEvent::Height(4), TreeEvent::Height(5)]
        );
        tree.restore_state();
        assert_eq!(tree.height(4), 1.2);
        assert_eq!(tree.drain_events(sub), vec![TreeEvent::Height(4)]);
    }

    #[test]
    fn clone_is_a_separate_instance() {
        let mut tree = sample_tree();
        let sub = tree.subscribe();
        let mut copy = tree.clone();
        assert_ne!(copy.instance_id(), tree.instance_id());
        assert_eq!(copy.to_newick(), tree.to_newick());
        copy.set_height(4, 1.5).unwrap();
        assert!(copy.drain_events(sub).is_empty());
        assert!(tree.drain_events(sub).is_empty());
        tree.unsubscribe(sub);
        assert_eq!(tree.subscribe(), sub);
    }

    #[test]
    fn accept_keeps_changes() {
        let mut tree = sample_tree();
        tree.store_state();
        tree.set_height(4, 1.7).unwrap();
        tree.accept_state();
        tree.store_state();
        tree.restore_state();
        assert_eq!(tree.height(4), 1.7);
    }

    #[test]
    fn reachable_tip_count_matches() {
        assert_eq!(sample_tree().reachable_tip_count(), 4);
    }

    #[test]
    fn summary_format() {
        assert_eq!(
            sample_tree().summary(),
            "TimeTree: 7 nodes (4 tips), root height 2"
        );
    }
}
