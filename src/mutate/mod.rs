//! Structural rewrites of a [LoopTree].
//!
//! Every operation here is pure: it takes a tree and a reference into it, edits a copy of the
//! tree's [Schedule], and builds a fresh tree. The result carries the reference, in the new
//! tree, of the node the caller's cursor should land on. A failed operation leaves nothing
//! changed.

use std::fmt::Display;
use std::ops::Range;

use crate::common::NodeId;
use crate::schedule::{Annotation, Schedule, ScheduleError};
use crate::tree::{Locator, LoopNode, LoopTree, TreeError, TreeRef};

mod copy;
mod reuse;
mod split;
mod swap;

pub use copy::copy_input;
pub use reuse::{decrease_reuse, increase_reuse};
pub use split::{merge, split};
pub use swap::try_swap;

/// A new tree and the cursor position within it.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub tree: LoopTree,
    pub cursor: TreeRef,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Action does not apply here: {0}")]
    Illegal(#[from] IllegalMutation),
    /// The operation produced (or was given) an inconsistent tree. Always a bug.
    #[error("Tree invariant violated: {0}")]
    Tree(#[from] TreeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IllegalMutation {
    AtStart,
    AtEnd,
    NotALoop(TreeRef),
    ZeroSplit,
    NoSoleChildLoop(TreeRef),
    MergeVarMismatch(TreeRef),
    NotAdjacent(TreeRef, TreeRef),
    LeafUnderOwnLoop(TreeRef),
    ImperfectNest(TreeRef),
    DependencyViolation { consumer: NodeId, producer: NodeId },
    InvalidTiling(ScheduleError),
    NoSuchInput { index: usize, available: usize },
    NoReuseCandidate(TreeRef),
    FusionBlocked(TreeRef),
    TooFewScopes(TreeRef),
    Overflow,
}

impl Display for IllegalMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IllegalMutation::AtStart => write!(f, "Already at the first node"),
            IllegalMutation::AtEnd => write!(f, "Already at the last node"),
            IllegalMutation::NotALoop(r) => write!(f, "Node {r} is a leaf, not a loop"),
            IllegalMutation::ZeroSplit => write!(f, "Cannot split by zero"),
            IllegalMutation::NoSoleChildLoop(r) => {
                write!(f, "Loop {r} does not have exactly one child loop")
            }
            IllegalMutation::MergeVarMismatch(r) => {
                write!(f, "Loop {r} and its child iterate different variables")
            }
            IllegalMutation::NotAdjacent(a, b) => {
                write!(f, "Nodes {a} and {b} are not adjacent")
            }
            IllegalMutation::LeafUnderOwnLoop(r) => {
                write!(f, "Cannot move leaf {r} out of its own loop")
            }
            IllegalMutation::ImperfectNest(r) => {
                write!(f, "Loop {r} has more than one child")
            }
            IllegalMutation::DependencyViolation { consumer, producer } => {
                write!(f, "{consumer} reads {producer} and must follow it")
            }
            IllegalMutation::InvalidTiling(e) => write!(f, "Invalid tiling: {e}"),
            IllegalMutation::NoSuchInput { index, available } => {
                write!(f, "No input {index}; only {available} available")
            }
            IllegalMutation::NoReuseCandidate(r) => {
                write!(f, "Loop {r} has no detached twin after it")
            }
            IllegalMutation::FusionBlocked(r) => {
                write!(f, "A dependency prevents fusing into loop {r}")
            }
            IllegalMutation::TooFewScopes(r) => {
                write!(f, "Loop {r} has fewer than two children")
            }
            IllegalMutation::Overflow => write!(f, "Loop bounds overflow"),
        }
    }
}

impl std::error::Error for IllegalMutation {}

/// Sets or clears the annotation of the loop at `r`.
pub fn annotate(
    tree: &LoopTree,
    r: TreeRef,
    annotation: Annotation,
) -> Result<Mutation, MutationError> {
    expect_loop(tree, r)?;
    let depth = tree.depth(r);
    let mut schedule = tree.schedule().clone();
    for node in tree.leaves_under(r) {
        schedule.order_mut(node)[depth].annotation = annotation;
    }
    fence(&mut schedule, sequence_range(tree, r), depth);
    rebuild(tree, schedule, tree.locate(r))
}

pub(crate) fn expect_loop(tree: &LoopTree, r: TreeRef) -> Result<&LoopNode, MutationError> {
    tree.check(r)?;
    tree.as_loop(r)
        .ok_or(MutationError::Illegal(IllegalMutation::NotALoop(r)))
}

/// Positions in the schedule sequence of the leaves under `r`.
pub(crate) fn sequence_range(tree: &LoopTree, r: TreeRef) -> Range<usize> {
    let leaves = tree.leaves_under(r);
    let start = tree
        .schedule()
        .position(leaves[0])
        .expect("every leaf is sequenced");
    start..start + leaves.len()
}

/// Keeps the leaves in `block` from joining a neighbour's loop at `depth`.
///
/// Rewrites can make the loop at `depth` over `block` identical to the loop over the leaf
/// before or after it. Without a fence, the rebuild would fuse them.
pub(crate) fn fence(schedule: &mut Schedule, block: Range<usize>, depth: usize) {
    let first = schedule.sequence[block.start];
    let last = schedule.sequence[block.end - 1];
    if block.start > 0 {
        let prev = schedule.sequence[block.start - 1];
        if entries_match(schedule, prev, first, depth) {
            schedule.order_mut(first)[depth].detached = true;
        }
    }
    if let Some(&next) = schedule.sequence.get(block.end) {
        if entries_match(schedule, last, next, depth) {
            schedule.order_mut(next)[depth].detached = true;
        }
    }
}

fn entries_match(schedule: &Schedule, a: NodeId, b: NodeId, depth: usize) -> bool {
    match (schedule.order(a).get(depth), schedule.order(b).get(depth)) {
        (Some(x), Some(y)) => x.same_loop(y),
        _ => false,
    }
}

/// Builds the tree for an edited schedule and resolves the cursor in it.
pub(crate) fn rebuild(
    tree: &LoopTree,
    schedule: Schedule,
    locator: Locator,
) -> Result<Mutation, MutationError> {
    let tree = tree.with_schedule(schedule)?;
    let cursor = tree.resolve(locator)?;
    log::trace!("Rebuilt tree with {} nodes; cursor at {cursor}", tree.len());
    Ok(Mutation { tree, cursor })
}
