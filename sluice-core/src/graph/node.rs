//! Graph Nodes
//!
//! This module defines the nodes that live in the rank graph.
//!
//! A node carries an integer rank and the set of downstream edges it forwards
//! values along. Ranks exist only to order work inside a transaction: for any
//! live edge `source -> target`, `rank(source) < rank(target)`. Linking an edge
//! that would break this bumps the target (and everything it feeds) first.
//! Ranks never go down, so unlinking leaves them alone.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::transaction::Transaction;

/// Unique identifier for a node in the rank graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one edge installed by [`Node::link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

impl TargetId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback run when a value travels along an edge.
pub type TargetAction<T> = Arc<dyn Fn(&Transaction, &T) + Send + Sync>;

/// Shared handle to anything that has a rank.
pub type RankRef = Arc<dyn Rank>;

/// The rank side of a node, independent of the value type it carries.
pub trait Rank: Send + Sync {
    /// Identity of the node.
    fn id(&self) -> NodeId;

    /// Current rank.
    fn rank(&self) -> u64;

    /// Raise this node above `limit`, cascading to its downstream nodes.
    ///
    /// `path` holds the nodes of the cascade currently being walked; meeting
    /// one of them again means the graph has a cycle there. Returns `true` if
    /// this node's rank changed.
    fn ensure_bigger_than(&self, limit: u64, path: &mut HashSet<NodeId>) -> bool;
}

/// One directed edge: the action to run and the node it feeds.
pub struct NodeTarget<T> {
    id: TargetId,
    action: TargetAction<T>,
    node: RankRef,
}

impl<T> NodeTarget<T> {
    /// The edge identifier.
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// The action run for each value sent along this edge.
    pub fn action(&self) -> &TargetAction<T> {
        &self.action
    }

    /// The downstream node.
    pub fn node(&self) -> &RankRef {
        &self.node
    }
}

impl<T> Clone for NodeTarget<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            action: Arc::clone(&self.action),
            node: Arc::clone(&self.node),
        }
    }
}

/// Edge snapshot taken while iterating, so no lock is held during callbacks.
pub type TargetSnapshot<T> = SmallVec<[NodeTarget<T>; 4]>;

struct NodeInner<T> {
    id: NodeId,
    rank: AtomicU64,
    targets: Mutex<IndexMap<TargetId, NodeTarget<T>>>,
}

impl<T> Rank for NodeInner<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn rank(&self) -> u64 {
        self.rank.load(Ordering::SeqCst)
    }

    fn ensure_bigger_than(&self, limit: u64, path: &mut HashSet<NodeId>) -> bool {
        // a node reached again by a longer route is bumped again
        if self.rank() > limit || !path.insert(self.id) {
            return false;
        }

        let new_rank = limit + 1;
        trace!(node = self.id.raw(), from = self.rank(), to = new_rank, "rank bump");
        self.rank.store(new_rank, Ordering::SeqCst);

        let downstream: SmallVec<[RankRef; 4]> = self
            .targets
            .lock()
            .values()
            .map(|target| Arc::clone(&target.node))
            .collect();
        for node in downstream {
            node.ensure_bigger_than(new_rank, path);
        }
        path.remove(&self.id);
        true
    }
}

/// A propagation target in the rank graph.
///
/// Cloning a `Node` yields another handle to the same node.
pub struct Node<T> {
    inner: Arc<NodeInner<T>>,
}

impl<T: 'static> Node<T> {
    /// Create a node with rank 0 and no edges.
    pub fn new() -> Self {
        Self::with_rank(0)
    }

    /// Create a node with the given starting rank.
    pub fn with_rank(rank: u64) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: NodeId::new(),
                rank: AtomicU64::new(rank),
                targets: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the node's current rank.
    pub fn rank(&self) -> u64 {
        self.inner.rank()
    }

    /// Type-erased handle used by the scheduler and by upstream edges.
    pub fn as_rank(&self) -> RankRef {
        Arc::clone(&self.inner) as RankRef
    }

    /// Install `target` as a downstream consumer of this node.
    ///
    /// Returns whether any rank changed (the caller must then mark the
    /// current transaction's queue stale) and the new edge's id.
    pub fn link(&self, action: TargetAction<T>, target: RankRef) -> (bool, TargetId) {
        let changed = target.ensure_bigger_than(self.rank(), &mut HashSet::new());
        let id = TargetId::new();
        self.inner.targets.lock().insert(
            id,
            NodeTarget {
                id,
                action,
                node: target,
            },
        );
        (changed, id)
    }

    /// Remove an edge. Ranks are left untouched.
    ///
    /// Returns `false` if the edge was already gone.
    pub fn unlink(&self, id: TargetId) -> bool {
        // the removed edge may own handles whose drop unlinks from this node
        let removed = self.inner.targets.lock().shift_remove(&id);
        removed.is_some()
    }

    /// Snapshot of the current edges, in link order.
    pub fn targets(&self) -> TargetSnapshot<T> {
        self.inner.targets.lock().values().cloned().collect()
    }

    /// Number of live edges.
    pub fn target_count(&self) -> usize {
        self.inner.targets.lock().len()
    }
}

impl<T: 'static> Default for Node<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("rank", &self.inner.rank())
            .field("targets", &self.inner.targets.lock().len())
            .finish()
    }
}

/// Sentinel target for terminal listeners.
///
/// Always rank 0, never bumped, never has edges of its own.
struct NullNode {
    id: NodeId,
}

impl Rank for NullNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn rank(&self) -> u64 {
        0
    }

    fn ensure_bigger_than(&self, _limit: u64, _path: &mut HashSet<NodeId>) -> bool {
        false
    }
}

/// The shared null node.
pub fn null_node() -> RankRef {
    static NULL: OnceLock<RankRef> = OnceLock::new();
    Arc::clone(NULL.get_or_init(|| Arc::new(NullNode { id: NodeId::new() })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop<T>() -> TargetAction<T> {
        Arc::new(|_: &Transaction, _: &T| {})
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn link_raises_target_above_source() {
        let source: Node<i32> = Node::with_rank(3);
        let target: Node<i32> = Node::new();

        let (changed, _) = source.link(noop(), target.as_rank());
        assert!(changed);
        assert_eq!(target.rank(), 4);
    }

    #[test]
    fn link_leaves_higher_target_alone() {
        let source: Node<i32> = Node::new();
        let target: Node<i32> = Node::with_rank(10);

        let (changed, _) = source.link(noop(), target.as_rank());
        assert!(!changed);
        assert_eq!(target.rank(), 10);
    }

    #[test]
    fn bump_cascades_downstream() {
        // a -> b -> c, then something ranked 5 starts feeding a
        let a: Node<i32> = Node::new();
        let b: Node<i32> = Node::new();
        let c: Node<i32> = Node::new();
        a.link(noop(), b.as_rank());
        b.link(noop(), c.as_rank());
        assert_eq!((a.rank(), b.rank(), c.rank()), (0, 1, 2));

        let upstream: Node<i32> = Node::with_rank(5);
        upstream.link(noop(), a.as_rank());

        assert_eq!((a.rank(), b.rank(), c.rank()), (6, 7, 8));
    }

    #[test]
    fn bump_reaches_diamond_join_through_longest_route() {
        // a -> c directly and a -> b -> c
        let a: Node<i32> = Node::new();
        let b: Node<i32> = Node::new();
        let c: Node<i32> = Node::new();
        a.link(noop(), c.as_rank());
        a.link(noop(), b.as_rank());
        b.link(noop(), c.as_rank());
        assert_eq!((a.rank(), b.rank(), c.rank()), (0, 1, 2));

        let upstream: Node<i32> = Node::with_rank(5);
        upstream.link(noop(), a.as_rank());

        assert!(a.rank() < b.rank());
        assert!(b.rank() < c.rank());
        assert_eq!((a.rank(), b.rank(), c.rank()), (6, 7, 8));
    }

    #[test]
    fn unlink_removes_edge_and_keeps_rank() {
        let source: Node<i32> = Node::new();
        let target: Node<i32> = Node::new();

        let (_, id) = source.link(noop(), target.as_rank());
        assert_eq!(source.target_count(), 1);

        assert!(source.unlink(id));
        assert!(!source.unlink(id));
        assert_eq!(source.target_count(), 0);
        assert_eq!(target.rank(), 1);
    }

    #[test]
    fn null_node_is_never_bumped() {
        let source: Node<i32> = Node::with_rank(7);
        let (changed, _) = source.link(noop(), null_node());
        assert!(!changed);
        assert_eq!(null_node().rank(), 0);
        assert_eq!(null_node().id(), null_node().id());
    }

    #[test]
    fn cyclic_links_terminate() {
        let a: Node<i32> = Node::new();
        let b: Node<i32> = Node::new();
        a.link(noop(), b.as_rank());
        b.link(noop(), a.as_rank());
        assert!(a.rank() > 0 || b.rank() > 0);
    }

    #[test]
    fn targets_keep_link_order() {
        let source: Node<i32> = Node::new();
        let first: Node<i32> = Node::new();
        let second: Node<i32> = Node::new();
        let (_, id1) = source.link(noop(), first.as_rank());
        let (_, id2) = source.link(noop(), second.as_rank());

        let ids: Vec<_> = source.targets().iter().map(NodeTarget::id).collect();
        assert_eq!(ids, vec![id1, id2]);
    }
}
