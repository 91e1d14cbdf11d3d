use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

use super::{check_lowering, Backend, BackendConfig, BackendError};
use crate::common::NodeId;
use crate::graph::Graph;
use crate::tree::{LoopTree, NodeKind, TreeRef};

/// Runs loop trees directly, element by element.
///
/// Slow, but needs no toolchain and computes real values, so it doubles as a reference for
/// checking that rewrites preserve what a tree computes.
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    config: BackendConfig,
}

/// Every tensor of a graph, indexed by [NodeId].
#[derive(Debug, Clone, PartialEq)]
pub struct Buffers(Vec<ArrayD<f32>>);

impl Buffers {
    /// Fills inputs with small integers from a seeded generator and initializes reduction
    /// outputs to their identity.
    pub fn allocate(graph: &Graph, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let tensors = graph
            .nodes()
            .map(|(id, node)| {
                let shape = node
                    .vars
                    .iter()
                    .map(|v| usize::try_from(graph.var(*v).size.get()).unwrap())
                    .collect::<Vec<_>>();
                if node.op.is_input() {
                    return ArrayD::from_shape_fn(IxDyn(&shape), |_| {
                        f32::from(rng.gen_range(0u8..4))
                    });
                }
                let init = if graph.reduces(id) {
                    node.op.reduction_identity().unwrap_or(0.0)
                } else {
                    0.0
                };
                ArrayD::from_elem(IxDyn(&shape), init)
            })
            .collect();
        Buffers(tensors)
    }

    pub fn get(&self, node: NodeId) -> &ArrayD<f32> {
        &self.0[node.index()]
    }

    /// The graph's output tensors, in output order.
    pub fn outputs<'a>(&'a self, graph: &'a Graph) -> impl Iterator<Item = &'a ArrayD<f32>> + 'a {
        graph.outputs().iter().map(|o| self.get(*o))
    }
}

impl Interpreter {
    pub fn new(config: BackendConfig) -> Self {
        Interpreter { config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Executes `tree` once and returns every tensor it computed.
    pub fn execute(&self, tree: &LoopTree) -> Result<Buffers, BackendError> {
        check_lowering(tree)?;
        let mut buffers = Buffers::allocate(tree.graph(), self.config.seed);
        run(tree, &mut buffers);
        Ok(buffers)
    }
}

impl Backend for Interpreter {
    fn lower_and_run(&self, tree: &LoopTree) -> Result<f64, BackendError> {
        check_lowering(tree)?;
        let mut best = f64::INFINITY;
        for _ in 0..self.config.samples.max(1) {
            let mut buffers = Buffers::allocate(tree.graph(), self.config.seed);
            let start = Instant::now();
            run(tree, &mut buffers);
            let secs = start.elapsed().as_secs_f64();
            debug!("Sample runtime result {secs}s");
            best = best.min(secs);
        }
        info!("Best interpreted runtime: {best}s");
        Ok(best)
    }
}

fn run(tree: &LoopTree, buffers: &mut Buffers) {
    let graph = tree.graph();
    let reducing = graph
        .nodes()
        .map(|(id, _)| graph.reduces(id))
        .collect::<Vec<_>>();
    // Per variable, the half-open range the enclosing loops currently select.
    let mut ranges = graph
        .vars()
        .iter()
        .map(|v| (0, u64::from(v.size.get())))
        .collect::<Vec<_>>();
    for root in tree.roots() {
        exec(tree, *root, &reducing, &mut ranges, buffers);
    }
}

fn exec(
    tree: &LoopTree,
    r: TreeRef,
    reducing: &[bool],
    ranges: &mut [(u64, u64)],
    buffers: &mut Buffers,
) {
    match tree.node(r).kind() {
        NodeKind::Loop(l) => {
            let v = l.var.index();
            let (base, limit) = ranges[v];
            for i in 0..l.extent() {
                let lo = base + i * l.stride;
                if lo >= limit {
                    break;
                }
                ranges[v] = (lo, limit.min(lo + l.stride));
                for child in tree.children(r) {
                    exec(tree, *child, reducing, ranges, buffers);
                }
            }
            ranges[v] = (base, limit);
        }
        NodeKind::Leaf(leaf) => {
            // Innermost loops have unit stride, so every range here is a single element.
            let graph = tree.graph();
            let node = graph.node(leaf.node);
            let index_of = |tensor: NodeId| {
                graph
                    .node(tensor)
                    .vars
                    .iter()
                    .map(|v| usize::try_from(ranges[v.index()].0).unwrap())
                    .collect::<Vec<_>>()
            };
            let args = node
                .inputs
                .iter()
                .map(|i| buffers.0[i.index()][IxDyn(&index_of(*i))])
                .collect::<Vec<_>>();
            let value = node.op.combine(&args);
            let out_idx = index_of(leaf.node);
            let out = &mut buffers.0[leaf.node.index()][IxDyn(&out_idx)];
            *out = if reducing[leaf.node.index()] {
                node.op.accumulate(*out, value)
            } else {
                value
            };
        }
    }
}
