use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::common::{NodeId, VarId};
use crate::graph::Graph;

/// Lowering hint attached to a loop. Never changes the values a loop nest computes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[derive(strum::Display, strum::EnumString, strum::IntoStaticStr, strum::EnumIter)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Annotation {
    #[default]
    #[strum(serialize = "")]
    #[serde(rename = "")]
    None,
    #[strum(serialize = "vectorize")]
    #[serde(rename = "vectorize")]
    Vectorize,
    #[strum(serialize = "unroll")]
    #[serde(rename = "unroll")]
    Unroll,
}

/// One loop in a node's loop order.
///
/// The loop runs `size` full iterations of `stride` elements each, plus one partial iteration
/// of `tail` elements when `tail` is non-zero. The stride isn't stored: it is the coverage of
/// the next deeper entry over the same variable, or 1 if there is none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct LoopSpec {
    pub var: VarId,
    pub size: u64,
    #[serde(default)]
    pub tail: u64,
    #[serde(default)]
    pub annotation: Annotation,
    /// Set when this loop must not be shared with the previous leaf's loop at the same depth.
    #[serde(default)]
    pub detached: bool,
}

/// Per-node loop orders plus the order in which nodes' leaves appear.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Schedule {
    pub(crate) sequence: Vec<NodeId>,
    /// Indexed by [NodeId]. Graph inputs have empty orders.
    pub(crate) orders: Vec<Vec<LoopSpec>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("expected {expected} loop orders but found {found}")]
    OrderCount { expected: usize, found: usize },
    #[error("{0} is not a compute node")]
    NotCompute(NodeId),
    #[error("{0} appears more than once in the sequence")]
    Duplicate(NodeId),
    #[error("{0} is never scheduled")]
    Unscheduled(NodeId),
    #[error("{node} is scheduled before its input {input}")]
    OutOfOrder { node: NodeId, input: NodeId },
    #[error("graph input {0} has a loop order")]
    InputScheduled(NodeId),
    #[error("loop order of {node} iterates {var}, which it does not use")]
    ExtraVar { node: NodeId, var: VarId },
    #[error("loop order of {node} never iterates {var}")]
    MissingVar { node: NodeId, var: VarId },
    #[error("loop order of {node} covers {found} elements of {var}, expected {expected}")]
    Coverage {
        node: NodeId,
        var: VarId,
        expected: u64,
        found: u64,
    },
    #[error("loop {depth} of {node} has zero iterations")]
    EmptyLoop { node: NodeId, depth: usize },
    #[error("loop {depth} of {node} has a tail of {tail} but a stride of {stride}")]
    BadTail {
        node: NodeId,
        depth: usize,
        tail: u64,
        stride: u64,
    },
    #[error("loop order of {0} overflows")]
    Overflow(NodeId),
}

impl LoopSpec {
    pub fn full(var: VarId, size: u64) -> Self {
        LoopSpec {
            var,
            size,
            tail: 0,
            annotation: Annotation::None,
            detached: false,
        }
    }

    /// Number of iterations, counting a partial tail iteration.
    pub fn extent(&self) -> u64 {
        self.size + u64::from(self.tail > 0)
    }

    /// Elements of `var` covered by this loop given the stride of its iterations.
    pub fn coverage(&self, stride: u64) -> Option<u64> {
        self.size.checked_mul(stride)?.checked_add(self.tail)
    }

    /// Returns `true` if a leaf with this entry may share a loop built from `other`.
    pub fn same_loop(&self, other: &LoopSpec) -> bool {
        self.var == other.var
            && self.size == other.size
            && self.tail == other.tail
            && self.annotation == other.annotation
    }
}

/// Computes the stride of every entry in a loop order, outermost first.
///
/// Returns `None` on arithmetic overflow.
pub fn strides(order: &[LoopSpec]) -> Option<Vec<u64>> {
    let mut covered: HashMap<VarId, u64> = HashMap::new();
    let mut result = vec![0; order.len()];
    for (depth, entry) in order.iter().enumerate().rev() {
        let stride = covered.get(&entry.var).copied().unwrap_or(1);
        result[depth] = stride;
        covered.insert(entry.var, entry.coverage(stride)?);
    }
    Some(result)
}

impl Schedule {
    /// Each compute node in id order, iterating its loop variables with one untiled loop apiece.
    pub fn default_for(graph: &Graph) -> Self {
        let orders = graph
            .nodes()
            .map(|(id, node)| {
                if node.op.is_input() {
                    return vec![];
                }
                graph
                    .loop_vars(id)
                    .into_iter()
                    .map(|v| LoopSpec::full(v, u64::from(graph.var(v).size.get())))
                    .collect()
            })
            .collect();
        Schedule {
            sequence: graph.compute_nodes().collect(),
            orders,
        }
    }

    pub fn sequence(&self) -> &[NodeId] {
        &self.sequence
    }

    pub fn order(&self, node: NodeId) -> &[LoopSpec] {
        &self.orders[node.index()]
    }

    pub(crate) fn order_mut(&mut self, node: NodeId) -> &mut Vec<LoopSpec> {
        &mut self.orders[node.index()]
    }

    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.sequence.iter().position(|n| *n == node)
    }

    pub fn validate(&self, graph: &Graph) -> Result<(), ScheduleError> {
        if self.orders.len() != graph.node_count() {
            return Err(ScheduleError::OrderCount {
                expected: graph.node_count(),
                found: self.orders.len(),
            });
        }

        let mut positions = vec![None; graph.node_count()];
        for (pos, node) in self.sequence.iter().enumerate() {
            if node.index() >= graph.node_count() || graph.node(*node).op.is_input() {
                return Err(ScheduleError::NotCompute(*node));
            }
            if positions[node.index()].replace(pos).is_some() {
                return Err(ScheduleError::Duplicate(*node));
            }
        }

        for (id, node) in graph.nodes() {
            if node.op.is_input() {
                if !self.order(id).is_empty() {
                    return Err(ScheduleError::InputScheduled(id));
                }
                continue;
            }
            let Some(pos) = positions[id.index()] else {
                return Err(ScheduleError::Unscheduled(id));
            };
            for input in &node.inputs {
                if let Some(input_pos) = positions[input.index()] {
                    if input_pos > pos {
                        return Err(ScheduleError::OutOfOrder {
                            node: id,
                            input: *input,
                        });
                    }
                }
            }
            self.validate_order(graph, id)?;
        }
        Ok(())
    }

    fn validate_order(&self, graph: &Graph, node: NodeId) -> Result<(), ScheduleError> {
        let order = self.order(node);
        let loop_vars = graph.loop_vars(node);
        for entry in order {
            if !loop_vars.contains(&entry.var) {
                return Err(ScheduleError::ExtraVar {
                    node,
                    var: entry.var,
                });
            }
        }
        let strides = strides(order).ok_or(ScheduleError::Overflow(node))?;
        for (depth, (entry, stride)) in order.iter().zip(&strides).enumerate() {
            if entry.extent() == 0 {
                return Err(ScheduleError::EmptyLoop { node, depth });
            }
            if entry.tail >= *stride {
                return Err(ScheduleError::BadTail {
                    node,
                    depth,
                    tail: entry.tail,
                    stride: *stride,
                });
            }
        }
        for var in loop_vars {
            let Some(outermost) = order.iter().position(|e| e.var == var) else {
                return Err(ScheduleError::MissingVar { node, var });
            };
            let found = order[outermost]
                .coverage(strides[outermost])
                .ok_or(ScheduleError::Overflow(node))?;
            let expected = u64::from(graph.var(var).size.get());
            if found != expected {
                return Err(ScheduleError::Coverage {
                    node,
                    var,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}
