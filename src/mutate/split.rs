use divrem::DivRem;

use super::{expect_loop, fence, rebuild, sequence_range, IllegalMutation, Mutation, MutationError};
use crate::schedule::LoopSpec;
use crate::tree::{LoopTree, TreeRef};

/// Tiles the loop at `r` into an outer loop over tiles of `k` iterations and an inner loop of
/// `k` iterations.
///
/// When `k` does not divide the loop's extent, the outer loop gets a partial last tile. The
/// outer loop keeps the original annotation and the cursor lands on it.
pub fn split(tree: &LoopTree, r: TreeRef, k: u32) -> Result<Mutation, MutationError> {
    let target = expect_loop(tree, r)?;
    if k == 0 {
        return Err(IllegalMutation::ZeroSplit.into());
    }
    let tile = u64::from(k)
        .checked_mul(target.stride)
        .ok_or(IllegalMutation::Overflow)?;
    let (size, tail) = target.coverage().div_rem(tile);
    let depth = tree.depth(r);
    log::debug!(
        "Splitting loop {r} over {} ({} iterations) by {k}",
        target.var,
        target.extent()
    );

    let mut schedule = tree.schedule().clone();
    for node in tree.leaves_under(r) {
        let order = schedule.order_mut(node);
        let outer = &mut order[depth];
        outer.size = size;
        outer.tail = tail;
        let inner = LoopSpec::full(outer.var, u64::from(k));
        order.insert(depth + 1, inner);
    }
    fence(&mut schedule, sequence_range(tree, r), depth);
    rebuild(tree, schedule, tree.locate(r))
}

/// Collapses the loop at `r` and its sole child loop over the same variable into one loop
/// visiting the same elements in the same order.
pub fn merge(tree: &LoopTree, r: TreeRef) -> Result<Mutation, MutationError> {
    let outer = expect_loop(tree, r)?;
    let inner = match tree.children(r) {
        [only] => tree
            .as_loop(*only)
            .ok_or(IllegalMutation::NoSoleChildLoop(r))?,
        _ => return Err(IllegalMutation::NoSoleChildLoop(r).into()),
    };
    if inner.var != outer.var {
        return Err(IllegalMutation::MergeVarMismatch(r).into());
    }
    let (size, tail) = outer.coverage().div_rem(inner.stride);
    let depth = tree.depth(r);

    let mut schedule = tree.schedule().clone();
    for node in tree.leaves_under(r) {
        let order = schedule.order_mut(node);
        order.remove(depth + 1);
        let merged = &mut order[depth];
        merged.size = size;
        merged.tail = tail;
    }
    fence(&mut schedule, sequence_range(tree, r), depth);
    rebuild(tree, schedule, tree.locate(r))
}
