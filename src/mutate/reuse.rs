use super::{expect_loop, fence, rebuild, sequence_range, IllegalMutation, Mutation, MutationError};
use crate::tree::{LoopTree, TreeRef};

/// Fuses the loop at `r` with the identical loop following it, which was split off from `r`
/// (or never joined it) only because its first leaf is detached.
pub fn increase_reuse(tree: &LoopTree, r: TreeRef) -> Result<Mutation, MutationError> {
    let target = expect_loop(tree, r)?;
    let next = tree
        .next_sibling(r)
        .ok_or(IllegalMutation::NoReuseCandidate(r))?;
    if tree.as_loop(next) != Some(target) {
        return Err(IllegalMutation::NoReuseCandidate(r).into());
    }
    let depth = tree.depth(r);
    let next_anchor = tree.node(next).anchor();
    if !tree.schedule().order(next_anchor)[depth].detached {
        // Identical but separate: something under `next` can't share the loop.
        return Err(IllegalMutation::FusionBlocked(r).into());
    }

    let mut schedule = tree.schedule().clone();
    schedule.order_mut(next_anchor)[depth].detached = false;
    // Fuse one level only.
    fence(&mut schedule, sequence_range(tree, next), depth + 1);
    let fused = rebuild(tree, schedule, tree.locate(r))?;
    if fused.tree.resolve(tree.locate(next))? != fused.cursor {
        return Err(IllegalMutation::FusionBlocked(r).into());
    }
    Ok(fused)
}

/// Splits the last child of the loop at `r` off into its own, identical loop.
pub fn decrease_reuse(tree: &LoopTree, r: TreeRef) -> Result<Mutation, MutationError> {
    expect_loop(tree, r)?;
    let children = tree.children(r);
    if children.len() < 2 {
        return Err(IllegalMutation::TooFewScopes(r).into());
    }
    let depth = tree.depth(r);
    let last_anchor = tree.node(children[children.len() - 1]).anchor();

    let mut schedule = tree.schedule().clone();
    schedule.order_mut(last_anchor)[depth].detached = true;
    fence(&mut schedule, sequence_range(tree, r), depth);
    rebuild(tree, schedule, tree.locate(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DimSize;
    use crate::graph::{matmul, GraphBuilder, Op};
    use crate::metrics::flops;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    #[test]
    fn test_decrease_reuse_splits_off_last_child() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        let m = decrease_reuse(&tree, TreeRef(0)).unwrap();
        assert_eq!(m.cursor, TreeRef(0));
        assert_eq!(m.tree.roots(), &[TreeRef(0), TreeRef(4)]);
        assert_eq!(m.tree.len(), tree.len() + 1);
        assert_eq!(flops(&m.tree), flops(&tree));
    }

    #[test]
    fn test_decrease_reuse_needs_two_children() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        assert_eq!(
            decrease_reuse(&tree, TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::TooFewScopes(TreeRef(1)))
        );
        assert_eq!(
            decrease_reuse(&tree, TreeRef(3)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::NotALoop(TreeRef(3)))
        );
    }

    #[test]
    fn test_increase_reuse_without_twin() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        assert_eq!(
            increase_reuse(&tree, TreeRef(0)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::NoReuseCandidate(TreeRef(0)))
        );
        // The k and n loops under m differ.
        assert_eq!(
            increase_reuse(&tree, TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::NoReuseCandidate(TreeRef(1)))
        );
    }

    #[test]
    fn test_increase_reuse_blocked_by_reduction() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(3u32));
        let j = b.var("j", nz!(5u32));
        let x = b.input(&[i, j]);
        let s = b.op(Op::Add, &[x], &[i]);
        let y = b.op(Op::Add, &[s, x], &[i, j]);
        b.output(y);
        let tree = LoopTree::new(b.build().unwrap()).unwrap();
        // i { j { s }, j { y } }: y would read s mid-reduction.
        assert_eq!(
            increase_reuse(&tree, TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::FusionBlocked(TreeRef(1)))
        );
        // Detaching doesn't make the fusion legal either.
        let mut schedule = tree.schedule().clone();
        schedule.order_mut(y)[1].detached = true;
        let tree = tree.with_schedule(schedule).unwrap();
        assert_eq!(
            increase_reuse(&tree, TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::FusionBlocked(TreeRef(1)))
        );
    }

    proptest! {
        #[test]
        fn test_decrease_then_increase_reuse_restores_shape(
            m in 1u32..=6, n in 1u32..=6, k in 1u32..=6
        ) {
            let g = matmul(
                DimSize::new(m).unwrap(),
                DimSize::new(n).unwrap(),
                DimSize::new(k).unwrap(),
            );
            let tree = LoopTree::new(g).unwrap();
            let apart = decrease_reuse(&tree, TreeRef(0)).unwrap();
            let together = increase_reuse(&apart.tree, apart.cursor).unwrap();
            prop_assert_eq!(together.cursor, TreeRef(0));
            prop_assert_eq!(&together.tree, &tree);
        }
    }
}
