use super::{fence, rebuild, sequence_range, IllegalMutation, Mutation, MutationError};
use crate::tree::{Locator, LoopTree, TreeError, TreeRef};

/// Exchanges `r` with `other`, which must be adjacent to it in traversal order.
///
/// If one is the parent of the other, the two loops are interchanged. This requires a perfect
/// nest. Otherwise the earlier node is a leaf and the later one is the next sibling of that
/// leaf or one of its ancestors, and those two sibling subtrees trade places. In both cases the
/// cursor follows `r`.
pub fn try_swap(tree: &LoopTree, r: TreeRef, other: TreeRef) -> Result<Mutation, MutationError> {
    tree.check(r)?;
    tree.check(other)?;
    let (first, second) = if r < other { (r, other) } else { (other, r) };
    if second.index() != first.index() + 1 {
        return Err(IllegalMutation::NotAdjacent(r, other).into());
    }

    if tree.parent(second) == Some(first) {
        interchange(tree, first, second, r == first)
    } else {
        let outer = enclosing_sibling(tree, first, second)?;
        exchange_siblings(tree, outer, second, r)
    }
}

/// Swaps the loop at `outer` with its sole child loop `inner`.
fn interchange(
    tree: &LoopTree,
    outer: TreeRef,
    inner: TreeRef,
    follow_outer: bool,
) -> Result<Mutation, MutationError> {
    if tree.as_loop(inner).is_none() {
        return Err(IllegalMutation::LeafUnderOwnLoop(inner).into());
    }
    if tree.children(outer).len() != 1 {
        return Err(IllegalMutation::ImperfectNest(outer).into());
    }
    let depth = tree.depth(outer);

    let mut schedule = tree.schedule().clone();
    for node in tree.leaves_under(outer) {
        let order = schedule.order_mut(node);
        // Detachment belongs to the position, not the loop.
        let (a, b) = (order[depth].detached, order[depth + 1].detached);
        order.swap(depth, depth + 1);
        order[depth].detached = a;
        order[depth + 1].detached = b;
    }
    fence(&mut schedule, sequence_range(tree, outer), depth);

    let locator = Locator {
        anchor: tree.node(outer).anchor(),
        depth: if follow_outer { depth + 1 } else { depth },
    };
    match rebuild(tree, schedule, locator) {
        Err(MutationError::Tree(TreeError::Schedule(e))) => {
            Err(IllegalMutation::InvalidTiling(e).into())
        }
        result => result,
    }
}

/// Finds the ancestor-or-self of the leaf `first` whose next sibling is `second`.
fn enclosing_sibling(
    tree: &LoopTree,
    first: TreeRef,
    second: TreeRef,
) -> Result<TreeRef, MutationError> {
    let mut candidate = first;
    loop {
        if tree.next_sibling(candidate) == Some(second) {
            return Ok(candidate);
        }
        candidate = tree
            .parent(candidate)
            .ok_or(IllegalMutation::NotAdjacent(first, second))?;
    }
}

/// Moves the subtree at `later` in front of its previous sibling `earlier`.
fn exchange_siblings(
    tree: &LoopTree,
    earlier: TreeRef,
    later: TreeRef,
    follow: TreeRef,
) -> Result<Mutation, MutationError> {
    let moved_back = tree.leaves_under(earlier);
    let moved_forward = tree.leaves_under(later);
    for consumer in &moved_forward {
        for producer in &moved_back {
            if tree.graph().reads(*consumer, *producer) {
                return Err(IllegalMutation::DependencyViolation {
                    consumer: *consumer,
                    producer: *producer,
                }
                .into());
            }
        }
    }

    let locator = tree.locate(follow);
    let start = sequence_range(tree, earlier).start;
    let split_at = start + moved_forward.len();
    let end = start + moved_back.len() + moved_forward.len();
    let depth = tree.depth(earlier);

    let mut schedule = tree.schedule().clone();
    schedule.sequence[start..end].rotate_left(moved_back.len());
    fence(&mut schedule, start..split_at, depth);
    fence(&mut schedule, split_at..end, depth);
    rebuild(tree, schedule, locator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{NodeId, VarId};
    use crate::graph::{matmul, vector_add, GraphBuilder, Op};
    use crate::metrics::flops;
    use crate::mutate::split;
    use nonzero::nonzero as nz;

    #[test]
    fn test_interchange_perfect_nest() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        // k { n { mul } } -> n { k { mul } }, following the k loop inward.
        let m = try_swap(&tree, TreeRef(1), TreeRef(2)).unwrap();
        assert_eq!(m.cursor, TreeRef(2));
        assert_eq!(m.tree.as_loop(TreeRef(1)).unwrap().var, VarId(1));
        assert_eq!(m.tree.as_loop(TreeRef(2)).unwrap().var, VarId(2));
        assert_eq!(flops(&m.tree), flops(&tree));
    }

    #[test]
    fn test_swap_is_symmetric_in_structure() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        let down = try_swap(&tree, TreeRef(1), TreeRef(2)).unwrap();
        let up = try_swap(&tree, TreeRef(2), TreeRef(1)).unwrap();
        assert_eq!(down.tree, up.tree);
        assert_eq!(down.cursor, TreeRef(2));
        assert_eq!(up.cursor, TreeRef(1));
    }

    #[test]
    fn test_imperfect_nest_is_illegal() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        assert_eq!(
            try_swap(&tree, TreeRef(0), TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::ImperfectNest(TreeRef(0)))
        );
    }

    #[test]
    fn test_leaf_cannot_leave_its_loop() {
        let tree = LoopTree::new(vector_add(nz!(8u32))).unwrap();
        assert_eq!(
            try_swap(&tree, TreeRef(0), TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::LeafUnderOwnLoop(TreeRef(1)))
        );
    }

    #[test]
    fn test_non_adjacent_is_illegal() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        assert_eq!(
            try_swap(&tree, TreeRef(1), TreeRef(3)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::NotAdjacent(TreeRef(1), TreeRef(3)))
        );
    }

    #[test]
    fn test_dependent_siblings_cannot_swap() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        // The mul leaf is last before the add's n loop, which reads it.
        assert_eq!(
            try_swap(&tree, TreeRef(3), TreeRef(4)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::DependencyViolation {
                consumer: NodeId(3),
                producer: NodeId(2),
            })
        );
    }

    #[test]
    fn test_independent_siblings_swap() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(8u32));
        let x = b.input(&[i]);
        let first = b.op(Op::Neg, &[x], &[i]);
        let second = b.op(Op::Exp, &[x], &[i]);
        b.output(first);
        b.output(second);
        let tree = LoopTree::new(b.build().unwrap()).unwrap();
        // i { neg, exp }
        let m = try_swap(&tree, TreeRef(1), TreeRef(2)).unwrap();
        assert_eq!(m.tree.schedule().sequence(), &[second, first]);
        assert_eq!(m.cursor, TreeRef(2));
        assert_eq!(m.tree.as_leaf(m.cursor).unwrap().node, first);
    }

    #[test]
    fn test_sibling_loops_stay_apart_after_swap() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(8u32));
        let x = b.input(&[i]);
        let first = b.op(Op::Neg, &[x], &[i]);
        let second = b.op(Op::Exp, &[x], &[i]);
        let third = b.op(Op::Neg, &[x], &[i]);
        for n in [first, second, third] {
            b.output(n);
        }
        let g = b.build().unwrap();
        let tree = LoopTree::new(g).unwrap();
        // Split the first leaf's loop only: detach the others so each leaf has its own loop.
        let mut schedule = tree.schedule().clone();
        schedule.order_mut(second)[0].detached = true;
        schedule.order_mut(third)[0].detached = true;
        let tree = tree.with_schedule(schedule).unwrap();
        assert_eq!(tree.roots().len(), 3);
        let tree = split(&tree, TreeRef(0), 2).unwrap().tree;
        // Move the first (split) nest after the second.
        let leaf = tree.leaf_ref(first).unwrap();
        let m = try_swap(&tree, leaf, TreeRef(leaf.0 + 1)).unwrap();
        assert_eq!(m.tree.roots().len(), 3);
        assert_eq!(m.tree.schedule().sequence(), &[second, first, third]);
        assert_eq!(m.tree.as_leaf(m.cursor).unwrap().node, first);
    }

    #[test]
    fn test_same_var_interchange_with_tail_is_illegal() {
        let tree = LoopTree::new(vector_add(nz!(10u32))).unwrap();
        let tree = split(&tree, TreeRef(0), 4).unwrap().tree;
        assert!(matches!(
            try_swap(&tree, TreeRef(0), TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::InvalidTiling(_))
        ));
    }
}
