use std::collections::HashMap;

use strum::IntoEnumIterator;

use crate::backend::{Backend, BackendError};
use crate::common::VarId;
use crate::tree::{LoopTree, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter, strum::IntoStaticStr)]
pub enum Metric {
    #[strum(serialize = "FLOPs")]
    Flops,
    #[strum(serialize = "FLOPS")]
    FlopsPerSecond,
    #[strum(serialize = "seconds")]
    Seconds,
}

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Measured runtime of {0}s is too small to divide by")]
    DegenerateRuntime(f64),
}

impl Metric {
    pub fn help() -> String {
        let mut help = String::from("Available metrics are:\n");
        for metric in Metric::iter() {
            let name: &'static str = metric.into();
            help.push_str(name);
            help.push('\n');
        }
        help
    }

    pub fn evaluate(self, tree: &LoopTree, backend: &dyn Backend) -> Result<f64, MetricError> {
        match self {
            Metric::Flops => Ok(flops(tree)),
            Metric::FlopsPerSecond => flops_per_second(tree, backend),
            Metric::Seconds => seconds(tree, backend),
        }
    }
}

/// Counts the arithmetic operations the tree performs.
///
/// Each leaf contributes the number of iterations it actually runs, tails included, times the
/// operations its node performs per iteration. Counted in `f64`, since large trees exceed `u64`.
pub fn flops(tree: &LoopTree) -> f64 {
    let graph = tree.graph();
    tree.refs()
        .filter_map(|r| match tree.node(r).kind() {
            NodeKind::Leaf(leaf) => Some((r, leaf)),
            NodeKind::Loop(_) => None,
        })
        .map(|(r, leaf)| {
            // Walk outward so the last loop seen per variable is its outermost.
            let mut covered: HashMap<VarId, u64> = HashMap::new();
            let mut ancestor = tree.parent(r);
            while let Some(a) = ancestor {
                if let Some(l) = tree.as_loop(a) {
                    covered.insert(l.var, l.coverage());
                }
                ancestor = tree.parent(a);
            }
            let iterations: f64 = leaf
                .vars
                .iter()
                .map(|v| covered.get(v).copied().unwrap_or(1) as f64)
                .product();
            let node = graph.node(leaf.node);
            let per_iteration = node
                .op
                .flops_per_iteration(node.inputs.len(), graph.reduces(leaf.node));
            iterations * per_iteration as f64
        })
        .sum()
}

/// Wall-clock seconds for one execution of the tree, as measured by `backend`.
pub fn seconds(tree: &LoopTree, backend: &dyn Backend) -> Result<f64, MetricError> {
    Ok(backend.lower_and_run(tree)?)
}

pub fn flops_per_second(tree: &LoopTree, backend: &dyn Backend) -> Result<f64, MetricError> {
    let secs = seconds(tree, backend)?;
    if secs <= f64::EPSILON {
        return Err(MetricError::DegenerateRuntime(secs));
    }
    Ok(flops(tree) / secs)
}
