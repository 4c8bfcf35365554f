//! Rank Graph
//!
//! This module implements the graph that keeps propagation topologically
//! ordered within a transaction.
//!
//! # Overview
//!
//! - Nodes represent propagation targets (streams, or the private
//!   intermediate nodes some combinators use to fix evaluation order).
//! - Edges run from an upstream node to a downstream one and carry the action
//!   that delivers a value.
//!
//! Every node has a rank, and every live edge goes from a lower rank to a
//! strictly higher one. The transaction scheduler runs work in rank order, so
//! a node never fires before anything upstream of it in the same transaction.
//!
//! # Design Decisions
//!
//! 1. Ranks are over-approximated rather than exact topological levels. A
//!    link only ever raises ranks, and an unlink never lowers them, which
//!    keeps both operations cheap and local.
//!
//! 2. Edges are stored in insertion order so fan-out is deterministic.
//!
//! 3. Terminal listeners point at a shared null node that has rank 0 and
//!    never moves.

mod node;
mod scheduler;

pub use node::{
    null_node, Node, NodeId, NodeTarget, Rank, RankRef, TargetAction, TargetId, TargetSnapshot,
};
pub use scheduler::{EntryKey, PriorityQueue};
