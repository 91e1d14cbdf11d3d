use std::sync::Arc;

use super::{fence, sequence_range, IllegalMutation, Mutation, MutationError};
use crate::graph::{Node, Op};
use crate::schedule::{strides, LoopSpec};
use crate::tree::{Locator, LoopTree, TreeRef};

/// Stages the `index`th input of the subtree at `r` through a new `copy` node.
///
/// The copy is computed inside every loop enclosing `r` (and `r` itself) which iterates one of
/// the input's dimensions, stopping at the first loop that doesn't. Within that scope it
/// copies the whole tile the consumers under `r` read, and those consumers are rewired to read
/// the copy instead.
pub fn copy_input(tree: &LoopTree, r: TreeRef, index: usize) -> Result<Mutation, MutationError> {
    tree.check(r)?;
    let inputs = tree.inputs(r);
    let no_such_input = IllegalMutation::NoSuchInput {
        index,
        available: inputs.len(),
    };
    let source = *inputs.get(index).ok_or(no_such_input.clone())?;
    let graph = tree.graph();
    let copy_vars = graph.node(source).vars.clone();
    let consumers = tree
        .leaves_under(r)
        .into_iter()
        .filter(|n| graph.reads(*n, source))
        .collect::<Vec<_>>();
    let first_consumer = *consumers.first().ok_or(no_such_input)?;

    // Loops enclosing the scope, outermost first, as they appear in the consumer's order.
    let path_len = tree.depth(r) + usize::from(tree.as_loop(r).is_some());
    let consumer_order = tree.schedule().order(first_consumer);
    let consumer_strides = strides(consumer_order).ok_or(IllegalMutation::Overflow)?;
    let prefix = consumer_order[..path_len]
        .iter()
        .take_while(|e| copy_vars.contains(&e.var))
        .count();

    let mut order = consumer_order[..prefix].to_vec();
    for var in &copy_vars {
        match (0..prefix).rev().find(|&j| consumer_order[j].var == *var) {
            Some(j) if consumer_strides[j] > 1 => {
                order.push(LoopSpec::full(*var, consumer_strides[j]));
            }
            Some(_) => {}
            None => order.push(LoopSpec::full(
                *var,
                u64::from(graph.var(*var).size.get()),
            )),
        }
    }

    // The copy goes first in the child of its scope that holds the consumer, but never before
    // the node it copies.
    let host_child = tree.resolve(Locator {
        anchor: first_consumer,
        depth: prefix,
    })?;
    let mut insert_at = sequence_range(tree, host_child).start;
    if let Some(pos) = tree.schedule().position(source) {
        insert_at = insert_at.max(pos + 1);
    }

    let mut schedule = tree.schedule().clone();
    let displaced = schedule.sequence[insert_at];
    for (depth, entry) in order.iter_mut().enumerate().take(prefix) {
        let displaced_entry = &mut schedule.order_mut(displaced)[depth];
        entry.detached = displaced_entry.detached;
        displaced_entry.detached = false;
    }

    let mut graph = Arc::clone(tree.shared_graph());
    let graph_mut = Arc::make_mut(&mut graph);
    let copy = graph_mut.push_node(Node {
        op: Op::Copy,
        inputs: vec![source],
        vars: copy_vars,
    });
    for consumer in &consumers {
        for input in graph_mut.node_mut(*consumer).inputs.iter_mut() {
            if *input == source {
                *input = copy;
            }
        }
    }
    schedule.orders.push(order);
    schedule.sequence.insert(insert_at, copy);
    fence(&mut schedule, insert_at..insert_at + 1, prefix);
    log::debug!(
        "Copying {source} for {} consumer(s) as {copy} at depth {prefix}",
        consumers.len()
    );

    let locator = tree.locate(r);
    let tree = LoopTree::build(graph, schedule)?;
    let cursor = tree.resolve(locator)?;
    Ok(Mutation { tree, cursor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{NodeId, VarId};
    use crate::graph::{matmul, vector_add};
    use crate::metrics::flops;
    use crate::mutate::split;
    use nonzero::nonzero as nz;

    #[test]
    fn test_copy_input_at_root_of_matmul() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        let m = copy_input(&tree, TreeRef(0), 0).unwrap();
        let copy = NodeId(4);
        let graph = m.tree.graph();
        assert_eq!(graph.node(copy).op, Op::Copy);
        assert_eq!(graph.node(copy).inputs, vec![NodeId(0)]);
        assert_eq!(graph.node(NodeId(2)).inputs, vec![copy, NodeId(1)]);
        // m { k { copy }, k { n { mul } }, n { k { add } } }
        assert_eq!(m.cursor, TreeRef(0));
        assert_eq!(m.tree.children(TreeRef(0)).len(), 3);
        assert_eq!(m.tree.schedule().sequence(), &[copy, NodeId(2), NodeId(3)]);
        assert_eq!(flops(&m.tree), flops(&tree));
    }

    #[test]
    fn test_copy_input_scoped_at_inner_loop() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        // The n loop above the mul leaf; the copy of a[m, k] is hoisted out of it.
        let m = copy_input(&tree, TreeRef(2), 0).unwrap();
        let copy = NodeId(4);
        let copy_leaf = m.tree.leaf_ref(copy).unwrap();
        assert_eq!(m.tree.depth(copy_leaf), 2);
        assert_eq!(m.tree.parent(copy_leaf), Some(TreeRef(1)));
        assert_eq!(m.tree.as_loop(m.cursor).unwrap().var, VarId(1));
    }

    #[test]
    fn test_copy_input_outside_every_loop() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        // b[k, n] does not vary with m, so its copy lands before the m loop.
        let m = copy_input(&tree, TreeRef(2), 1).unwrap();
        assert_eq!(m.tree.roots().len(), 2);
        assert_eq!(
            m.tree.as_leaf(TreeRef(2)).map(|l| l.node),
            Some(NodeId(4))
        );
    }

    #[test]
    fn test_copy_input_of_tile_adds_remainder_loop() {
        let tree = LoopTree::new(vector_add(nz!(16u32))).unwrap();
        let tree = split(&tree, TreeRef(0), 4).unwrap().tree;
        let m = copy_input(&tree, TreeRef(0), 0).unwrap();
        let copy_order = m.tree.schedule().order(NodeId(3));
        assert_eq!(copy_order.len(), 2);
        assert_eq!(copy_order[1].size, 4);
        // i { i { copy }, i { add } }
        assert_eq!(m.tree.children(TreeRef(0)).len(), 2);
    }

    #[test]
    fn test_copy_missing_input() {
        let tree = LoopTree::new(vector_add(nz!(16u32))).unwrap();
        assert_eq!(
            copy_input(&tree, TreeRef(0), 2).unwrap_err(),
            MutationError::Illegal(IllegalMutation::NoSuchInput {
                index: 2,
                available: 2
            })
        );
    }

    #[test]
    fn test_copy_does_not_touch_original_graph() {
        let tree = LoopTree::new(vector_add(nz!(16u32))).unwrap();
        let before = tree.graph().clone();
        copy_input(&tree, TreeRef(1), 1).unwrap();
        assert_eq!(tree.graph(), &before);
    }
}
