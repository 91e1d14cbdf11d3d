use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Range;
use std::sync::Arc;

use crate::common::{NodeId, VarId};
use crate::graph::{Graph, GraphError};
use crate::schedule::{strides, Annotation, LoopSpec, Schedule, ScheduleError};

/// Identifies a node of one [LoopTree] value by its preorder position.
///
/// A [TreeRef] is meaningless once the tree it came from has been replaced. Use a [Locator] to
/// carry a node's identity across a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TreeRef(pub u32);

/// A loop node's identity in terms of the schedule: the leaf whose loop order introduced it and
/// its depth in that order. Leaves are located at the depth one past their innermost loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub anchor: NodeId,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNode {
    pub var: VarId,
    pub size: u64,
    pub tail: u64,
    pub stride: u64,
    pub annotation: Annotation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub node: NodeId,
    /// Every loop variable the leaf's computation ranges over.
    pub vars: Vec<VarId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Loop(LoopNode),
    Leaf(LeafNode),
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    parent: Option<TreeRef>,
    children: Vec<TreeRef>,
    depth: usize,
    anchor: NodeId,
    /// One past the last preorder position in this node's subtree.
    end: u32,
    kind: NodeKind,
}

/// A loop nest derived from a [Graph] and a [Schedule].
///
/// Trees are immutable. Every mutation edits a copy of the schedule and builds a fresh tree.
#[derive(Debug, Clone)]
pub struct LoopTree {
    graph: Arc<Graph>,
    schedule: Schedule,
    nodes: Vec<TreeNode>,
    roots: Vec<TreeRef>,
    leaf_refs: Vec<Option<TreeRef>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),
    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("No node {0} in tree")]
    UnknownRef(TreeRef),
    #[error("No node at depth {depth} above the leaf of {anchor}")]
    UnknownLocator { anchor: NodeId, depth: usize },
}

impl TreeRef {
    pub fn index(self) -> usize {
        self.0.try_into().unwrap()
    }
}

impl From<usize> for TreeRef {
    fn from(value: usize) -> Self {
        TreeRef(value.try_into().unwrap())
    }
}

impl Display for TreeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl LoopNode {
    pub fn extent(&self) -> u64 {
        self.size + u64::from(self.tail > 0)
    }

    pub fn coverage(&self) -> u64 {
        self.size * self.stride + self.tail
    }

    fn admits(&self, entry: &LoopSpec, stride: u64) -> bool {
        self.var == entry.var
            && self.size == entry.size
            && self.tail == entry.tail
            && self.annotation == entry.annotation
            && self.stride == stride
    }
}

impl TreeNode {
    pub fn parent(&self) -> Option<TreeRef> {
        self.parent
    }

    pub fn children(&self) -> &[TreeRef] {
        &self.children
    }

    /// Number of loops enclosing this node.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The first leaf scheduled in this node's subtree.
    pub fn anchor(&self) -> NodeId {
        self.anchor
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, NodeKind::Loop(_))
    }
}

impl LoopTree {
    /// Builds the tree for `graph` under its default schedule.
    pub fn new(graph: Graph) -> Result<Self, TreeError> {
        let schedule = Schedule::default_for(&graph);
        Self::build(Arc::new(graph), schedule)
    }

    pub fn build(graph: Arc<Graph>, schedule: Schedule) -> Result<Self, TreeError> {
        graph.validate()?;
        schedule.validate(&graph)?;

        let mut tree = LoopTree {
            leaf_refs: vec![None; graph.node_count()],
            graph,
            schedule,
            nodes: vec![],
            roots: vec![],
        };

        // The loops enclosing the most recently placed leaf, outermost first.
        let mut open: Vec<TreeRef> = vec![];
        for pos in 0..tree.schedule.sequence.len() {
            let node = tree.schedule.sequence[pos];
            let order = tree.schedule.order(node).to_vec();
            let strides = strides(&order).ok_or(ScheduleError::Overflow(node))?;
            let shared = tree.shared_depth(node, &order, &strides, &open);
            open.truncate(shared);
            for depth in shared..order.len() {
                let entry = &order[depth];
                let kind = NodeKind::Loop(LoopNode {
                    var: entry.var,
                    size: entry.size,
                    tail: entry.tail,
                    stride: strides[depth],
                    annotation: entry.annotation,
                });
                let r = tree.push(open.last().copied(), depth, node, kind);
                open.push(r);
            }
            let vars = tree.graph.loop_vars(node);
            let leaf = tree.push(
                open.last().copied(),
                order.len(),
                node,
                NodeKind::Leaf(LeafNode { node, vars }),
            );
            tree.leaf_refs[node.index()] = Some(leaf);
        }

        for i in (0..tree.nodes.len()).rev() {
            tree.nodes[i].end = match tree.nodes[i].children.last() {
                Some(last) => tree.nodes[last.index()].end,
                None => u32::try_from(i + 1).unwrap(),
            };
        }
        Ok(tree)
    }

    /// How many of the open loops the leaf for `node` can join.
    fn shared_depth(
        &self,
        node: NodeId,
        order: &[LoopSpec],
        strides: &[u64],
        open: &[TreeRef],
    ) -> usize {
        let producers = &self.graph.node(node).inputs;
        let mut shared = 0;
        while shared < open.len().min(order.len()) {
            let entry = &order[shared];
            let NodeKind::Loop(existing) = &self.nodes[open[shared].index()].kind else {
                break;
            };
            if entry.detached || !existing.admits(entry, strides[shared]) {
                break;
            }
            // Joining a loop over a variable a producer reduces would read partial sums.
            let reads_partial = producers.iter().any(|p| {
                self.leaf_refs[p.index()]
                    .map_or(false, |leaf| self.encloses_during_build(open[shared], leaf))
                    && !self.graph.node(*p).vars.contains(&entry.var)
            });
            if reads_partial {
                break;
            }
            shared += 1;
        }
        shared
    }

    fn encloses_during_build(&self, ancestor: TreeRef, mut r: TreeRef) -> bool {
        while let Some(p) = self.nodes[r.index()].parent {
            if p == ancestor {
                return true;
            }
            r = p;
        }
        false
    }

    fn push(
        &mut self,
        parent: Option<TreeRef>,
        depth: usize,
        anchor: NodeId,
        kind: NodeKind,
    ) -> TreeRef {
        let r = TreeRef::from(self.nodes.len());
        self.nodes.push(TreeNode {
            parent,
            children: vec![],
            depth,
            anchor,
            end: 0,
            kind,
        });
        match parent {
            Some(p) => self.nodes[p.index()].children.push(r),
            None => self.roots.push(r),
        }
        r
    }

    /// Builds a new tree over the same graph with a different schedule.
    pub fn with_schedule(&self, schedule: Schedule) -> Result<Self, TreeError> {
        Self::build(Arc::clone(&self.graph), schedule)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn shared_graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, r: TreeRef) -> bool {
        r.index() < self.nodes.len()
    }

    pub fn check(&self, r: TreeRef) -> Result<(), TreeError> {
        if self.contains(r) {
            Ok(())
        } else {
            Err(TreeError::UnknownRef(r))
        }
    }

    /// All nodes in traversal (preorder) order.
    pub fn refs(&self) -> impl Iterator<Item = TreeRef> {
        (0..self.nodes.len()).map(TreeRef::from)
    }

    pub fn roots(&self) -> &[TreeRef] {
        &self.roots
    }

    pub fn node(&self, r: TreeRef) -> &TreeNode {
        &self.nodes[r.index()]
    }

    pub fn parent(&self, r: TreeRef) -> Option<TreeRef> {
        self.node(r).parent
    }

    pub fn children(&self, r: TreeRef) -> &[TreeRef] {
        &self.node(r).children
    }

    pub fn depth(&self, r: TreeRef) -> usize {
        self.node(r).depth
    }

    /// The children of `r`'s parent, or the roots.
    pub fn siblings(&self, r: TreeRef) -> &[TreeRef] {
        match self.parent(r) {
            Some(p) => self.children(p),
            None => &self.roots,
        }
    }

    pub fn next_sibling(&self, r: TreeRef) -> Option<TreeRef> {
        let siblings = self.siblings(r);
        let idx = siblings.iter().position(|s| *s == r)?;
        siblings.get(idx + 1).copied()
    }

    pub fn as_loop(&self, r: TreeRef) -> Option<&LoopNode> {
        match &self.node(r).kind {
            NodeKind::Loop(l) => Some(l),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self, r: TreeRef) -> Option<&LeafNode> {
        match &self.node(r).kind {
            NodeKind::Leaf(l) => Some(l),
            NodeKind::Loop(_) => None,
        }
    }

    /// The annotation of a loop, or `None` for a leaf.
    pub fn annotation(&self, r: TreeRef) -> Option<Annotation> {
        self.as_loop(r).map(|l| l.annotation)
    }

    /// Preorder positions of `r` and all its descendants.
    pub fn subtree(&self, r: TreeRef) -> Range<usize> {
        r.index()..usize::try_from(self.node(r).end).unwrap()
    }

    /// Returns `true` if `ancestor` is a strict ancestor of `r`.
    pub fn encloses(&self, ancestor: TreeRef, r: TreeRef) -> bool {
        ancestor != r && self.subtree(ancestor).contains(&r.index())
    }

    pub fn leaf_ref(&self, node: NodeId) -> Option<TreeRef> {
        self.leaf_refs.get(node.index()).copied().flatten()
    }

    /// The compute nodes of every leaf in `r`'s subtree, in sequence order.
    pub fn leaves_under(&self, r: TreeRef) -> Vec<NodeId> {
        self.subtree(r)
            .filter_map(|i| match &self.nodes[i].kind {
                NodeKind::Leaf(l) => Some(l.node),
                NodeKind::Loop(_) => None,
            })
            .collect()
    }

    /// Tensors read by leaves under `r` but produced outside it, in first-use order.
    pub fn inputs(&self, r: TreeRef) -> Vec<NodeId> {
        let produced = self.leaves_under(r);
        let mut result = vec![];
        for consumer in &produced {
            for input in &self.graph.node(*consumer).inputs {
                if !produced.contains(input) && !result.contains(input) {
                    result.push(*input);
                }
            }
        }
        result
    }

    pub fn locate(&self, r: TreeRef) -> Locator {
        let node = self.node(r);
        Locator {
            anchor: node.anchor,
            depth: node.depth,
        }
    }

    pub fn resolve(&self, locator: Locator) -> Result<TreeRef, TreeError> {
        let missing = TreeError::UnknownLocator {
            anchor: locator.anchor,
            depth: locator.depth,
        };
        let mut r = self.leaf_ref(locator.anchor).ok_or(missing.clone())?;
        loop {
            if self.depth(r) == locator.depth {
                return Ok(r);
            }
            r = self.parent(r).ok_or(missing.clone())?;
        }
    }
}

impl PartialEq for LoopTree {
    fn eq(&self, other: &Self) -> bool {
        self.graph == other.graph && self.schedule == other.schedule
    }
}

impl Eq for LoopTree {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{matmul, vector_add, GraphBuilder, Op};
    use nonzero::nonzero as nz;

    fn loop_var(tree: &LoopTree, r: usize) -> VarId {
        tree.as_loop(TreeRef::from(r)).unwrap().var
    }

    #[test]
    fn test_matmul_shares_outer_loop() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.roots(), &[TreeRef(0)]);
        assert_eq!(tree.children(TreeRef(0)), &[TreeRef(1), TreeRef(4)]);
        assert_eq!(loop_var(&tree, 1), VarId(2));
        assert_eq!(loop_var(&tree, 4), VarId(1));
        assert_eq!(tree.as_leaf(TreeRef(3)).unwrap().node, NodeId(2));
        assert_eq!(tree.as_leaf(TreeRef(6)).unwrap().node, NodeId(3));
        assert_eq!(tree.leaf_ref(NodeId(3)), Some(TreeRef(6)));
        assert_eq!(tree.subtree(TreeRef(1)), 1..4);
    }

    #[test]
    fn test_reduction_loop_is_not_shared_with_consumer() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(3u32));
        let j = b.var("j", nz!(5u32));
        let x = b.input(&[i, j]);
        let s = b.op(Op::Add, &[x], &[i]);
        let y = b.op(Op::Add, &[s, x], &[i, j]);
        b.output(y);
        let tree = LoopTree::new(b.build().unwrap()).unwrap();
        // i { j { s }, j { y } }
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.children(TreeRef(0)).len(), 2);
    }

    #[test]
    fn test_inputs_are_in_first_use_order() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        assert_eq!(tree.inputs(TreeRef(0)), vec![NodeId(0), NodeId(1)]);
        assert_eq!(tree.inputs(TreeRef(4)), vec![NodeId(2)]);
        assert_eq!(tree.leaves_under(TreeRef(0)), vec![NodeId(2), NodeId(3)]);
    }

    #[test]
    fn test_locators_resolve_to_their_node() {
        let tree = LoopTree::new(matmul(nz!(4u32), nz!(5u32), nz!(6u32))).unwrap();
        for r in tree.refs() {
            assert_eq!(tree.resolve(tree.locate(r)), Ok(r));
        }
    }

    #[test]
    fn test_unknown_locator() {
        let tree = LoopTree::new(vector_add(nz!(4u32))).unwrap();
        let locator = Locator {
            anchor: NodeId(2),
            depth: 5,
        };
        assert!(matches!(
            tree.resolve(locator),
            Err(TreeError::UnknownLocator { .. })
        ));
    }

    #[test]
    fn test_detached_entry_opens_new_loop() {
        let g = matmul(nz!(4u32), nz!(5u32), nz!(6u32));
        let mut schedule = Schedule::default_for(&g);
        schedule.order_mut(NodeId(3))[0].detached = true;
        let tree = LoopTree::build(Arc::new(g), schedule).unwrap();
        assert_eq!(tree.roots().len(), 2);
    }
}
