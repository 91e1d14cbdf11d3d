use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::common::{DimSize, NodeId, VarId};

/// A tensor operation.
///
/// Compute operations combine their inputs elementwise. When an input carries a variable which
/// is not among the node's own variables, the node reduces over that variable, folding each
/// iteration into its output with [Op::accumulate].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Input,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Neg,
    Exp,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Var {
    pub name: String,
    pub size: DimSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<NodeId>,
    /// Dimensions of the tensor this node produces, outermost first (row-major).
    pub vars: Vec<VarId>,
}

/// A dataflow graph of tensor operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Graph {
    vars: Vec<Var>,
    nodes: Vec<Node>,
    outputs: Vec<NodeId>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{node} refers to unknown variable {var}")]
    UnknownVar { node: NodeId, var: VarId },
    #[error("{node} reads unknown node {input}")]
    UnknownInput { node: NodeId, input: NodeId },
    #[error("{node} lists variable {var} more than once")]
    DuplicateVar { node: NodeId, var: VarId },
    #[error("{op} node {node} takes {expected} input(s) but has {found}")]
    Arity {
        node: NodeId,
        op: Op,
        expected: &'static str,
        found: usize,
    },
    #[error("{op} node {node} cannot reduce over its inputs' variables")]
    BadReduction { node: NodeId, op: Op },
    #[error("dataflow graph has a cycle through {0}")]
    Cycle(NodeId),
    #[error("unknown output {0}")]
    UnknownOutput(NodeId),
    #[error("output {0} is a graph input")]
    OutputIsInput(NodeId),
    #[error("dataflow graph has no outputs")]
    NoOutputs,
}

#[derive(Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl Op {
    pub fn is_input(self) -> bool {
        self == Op::Input
    }

    /// The value a reducing node's output starts from, if this operation can reduce.
    pub fn reduction_identity(self) -> Option<f32> {
        match self {
            Op::Add => Some(0.0),
            Op::Mul => Some(1.0),
            Op::Max => Some(f32::NEG_INFINITY),
            Op::Min => Some(f32::INFINITY),
            Op::Input | Op::Sub | Op::Div | Op::Neg | Op::Exp | Op::Copy => None,
        }
    }

    /// Arithmetic operations performed per iteration of a leaf computing this operation.
    pub fn flops_per_iteration(self, arity: usize, reduces: bool) -> u64 {
        match self {
            Op::Input | Op::Copy => 0,
            Op::Neg | Op::Exp => 1,
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Max | Op::Min => {
                let combine = u64::try_from(arity.saturating_sub(1)).unwrap();
                combine + u64::from(reduces)
            }
        }
    }

    /// Combine one element from each input.
    pub fn combine(self, args: &[f32]) -> f32 {
        match self {
            Op::Input => unreachable!("input nodes are never computed"),
            Op::Add => args.iter().sum(),
            Op::Mul => args.iter().product(),
            Op::Sub => args[0] - args[1],
            Op::Div => args[0] / args[1],
            Op::Max => args.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            Op::Min => args.iter().copied().fold(f32::INFINITY, f32::min),
            Op::Neg => -args[0],
            Op::Exp => args[0].exp(),
            Op::Copy => args[0],
        }
    }

    /// Fold a combined value into a reduction accumulator.
    pub fn accumulate(self, acc: f32, value: f32) -> f32 {
        match self {
            Op::Add => acc + value,
            Op::Mul => acc * value,
            Op::Max => acc.max(value),
            Op::Min => acc.min(value),
            _ => unreachable!("{self} does not reduce"),
        }
    }

    fn check_arity(self, node: NodeId, found: usize, reduces: bool) -> Result<(), GraphError> {
        let (ok, expected) = match self {
            Op::Input => (found == 0, "0"),
            Op::Neg | Op::Exp | Op::Copy => (found == 1, "1"),
            Op::Sub | Op::Div => (found == 2, "2"),
            Op::Add | Op::Mul | Op::Max | Op::Min => (found >= 1, "at least 1"),
        };
        if !ok {
            return Err(GraphError::Arity {
                node,
                op: self,
                expected,
                found,
            });
        }
        if reduces && self.reduction_identity().is_none() {
            return Err(GraphError::BadReduction { node, op: self });
        }
        Ok(())
    }
}

impl Graph {
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.index()]
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId::from(i), n))
    }

    /// Nodes which must be scheduled (everything except graph inputs), in id order.
    pub fn compute_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes()
            .filter(|(_, n)| !n.op.is_input())
            .map(|(id, _)| id)
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// The variables a node iterates over: its own dimensions followed by any variable of its
    /// inputs which it reduces away.
    pub fn loop_vars(&self, id: NodeId) -> Vec<VarId> {
        let node = self.node(id);
        let mut vars = node.vars.clone();
        for input in &node.inputs {
            for v in &self.node(*input).vars {
                if !vars.contains(v) {
                    vars.push(*v);
                }
            }
        }
        vars
    }

    pub fn reduces(&self, id: NodeId) -> bool {
        self.loop_vars(id).len() > self.node(id).vars.len()
    }

    /// Returns `true` if `consumer` reads `producer` directly.
    pub fn reads(&self, consumer: NodeId, producer: NodeId) -> bool {
        self.node(consumer).inputs.contains(&producer)
    }

    /// The number of elements in the tensor produced by a node.
    pub fn volume(&self, id: NodeId) -> u64 {
        self.node(id)
            .vars
            .iter()
            .map(|v| u64::from(self.var(*v).size.get()))
            .product()
    }

    pub(crate) fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId::from(self.nodes.len() - 1)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        for (id, node) in self.nodes() {
            for (i, var) in node.vars.iter().enumerate() {
                if var.index() >= self.vars.len() {
                    return Err(GraphError::UnknownVar { node: id, var: *var });
                }
                if node.vars[..i].contains(var) {
                    return Err(GraphError::DuplicateVar { node: id, var: *var });
                }
            }
            for input in &node.inputs {
                if input.index() >= self.nodes.len() {
                    return Err(GraphError::UnknownInput {
                        node: id,
                        input: *input,
                    });
                }
            }
        }
        for (id, node) in self.nodes() {
            node.op
                .check_arity(id, node.inputs.len(), self.reduces(id))?;
        }
        self.check_acyclic()?;

        if self.outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        for output in &self.outputs {
            if output.index() >= self.nodes.len() {
                return Err(GraphError::UnknownOutput(*output));
            }
            if self.node(*output).op.is_input() {
                return Err(GraphError::OutputIsInput(*output));
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS; the second tuple field is the next input to visit.
            let mut stack = vec![(root, 0usize)];
            marks[root] = Mark::Active;
            while let Some((idx, next)) = stack.last_mut() {
                let inputs = &self.nodes[*idx].inputs;
                if *next == inputs.len() {
                    marks[*idx] = Mark::Done;
                    stack.pop();
                    continue;
                }
                let input = inputs[*next].index();
                *next += 1;
                match marks[input] {
                    Mark::Active => return Err(GraphError::Cycle(NodeId::from(input))),
                    Mark::Unvisited => {
                        marks[input] = Mark::Active;
                        stack.push((input, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }

    pub fn describe_node(&self, id: NodeId) -> String {
        let node = self.node(id);
        let lhs = self.describe_tensor(id);
        if node.op.is_input() {
            return format!("{lhs} <- input");
        }
        let args = node
            .inputs
            .iter()
            .map(|i| self.describe_tensor(*i))
            .join(", ");
        format!("{lhs} <- {}({args})", node.op)
    }

    fn describe_tensor(&self, id: NodeId) -> String {
        let vars = self
            .node(id)
            .vars
            .iter()
            .map(|v| self.var(*v).name.as_str())
            .join(", ");
        format!("{id}[{vars}]")
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (id, _) in self.nodes() {
            writeln!(f, "{}", self.describe_node(id))?;
        }
        Ok(())
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder::default()
    }

    pub fn var(&mut self, name: &str, size: DimSize) -> VarId {
        self.graph.vars.push(Var {
            name: name.to_owned(),
            size,
        });
        VarId::from(self.graph.vars.len() - 1)
    }

    pub fn input(&mut self, vars: &[VarId]) -> NodeId {
        self.op(Op::Input, &[], vars)
    }

    pub fn op(&mut self, op: Op, inputs: &[NodeId], vars: &[VarId]) -> NodeId {
        self.graph.push_node(Node {
            op,
            inputs: inputs.to_vec(),
            vars: vars.to_vec(),
        })
    }

    pub fn output(&mut self, node: NodeId) {
        self.graph.outputs.push(node);
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        self.graph.validate()?;
        Ok(self.graph)
    }
}

/// `c[i] = a[i] + b[i]`.
pub fn vector_add(n: DimSize) -> Graph {
    let mut b = GraphBuilder::new();
    let i = b.var("i", n);
    let lhs = b.input(&[i]);
    let rhs = b.input(&[i]);
    let sum = b.op(Op::Add, &[lhs, rhs], &[i]);
    b.output(sum);
    b.build().expect("vector_add graph is well-formed")
}

/// `c[m, n] = sum_k a[m, k] * b[k, n]`, expressed as a pointwise product over `(m, k, n)`
/// followed by a reducing add.
pub fn matmul(m: DimSize, n: DimSize, k: DimSize) -> Graph {
    let mut b = GraphBuilder::new();
    let vm = b.var("m", m);
    let vn = b.var("n", n);
    let vk = b.var("k", k);
    let lhs = b.input(&[vm, vk]);
    let rhs = b.input(&[vk, vn]);
    let product = b.op(Op::Mul, &[lhs, rhs], &[vm, vk, vn]);
    let out = b.op(Op::Add, &[product], &[vm, vn]);
    b.output(out);
    b.build().expect("matmul graph is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero::nonzero as nz;

    #[test]
    fn test_matmul_loop_vars_put_reduction_last() {
        let g = matmul(nz!(2u32), nz!(3u32), nz!(4u32));
        assert_eq!(g.loop_vars(NodeId(3)), vec![VarId(0), VarId(1), VarId(2)]);
        assert!(g.reduces(NodeId(3)));
        assert!(!g.reduces(NodeId(2)));
        assert_eq!(g.compute_nodes().collect::<Vec<_>>(), [NodeId(2), NodeId(3)]);
    }

    #[test]
    fn test_flops_per_iteration() {
        assert_eq!(Op::Mul.flops_per_iteration(2, false), 1);
        assert_eq!(Op::Add.flops_per_iteration(1, true), 1);
        assert_eq!(Op::Add.flops_per_iteration(3, true), 3);
        assert_eq!(Op::Copy.flops_per_iteration(1, false), 0);
        assert_eq!(Op::Exp.flops_per_iteration(1, false), 1);
    }

    #[test]
    fn test_sub_cannot_reduce() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(4u32));
        let j = b.var("j", nz!(4u32));
        let x = b.input(&[i, j]);
        let y = b.input(&[i, j]);
        let d = b.op(Op::Sub, &[x, y], &[i]);
        b.output(d);
        assert_eq!(
            b.build(),
            Err(GraphError::BadReduction {
                node: d,
                op: Op::Sub
            })
        );
    }

    #[test]
    fn test_unary_arity_is_checked() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(4u32));
        let x = b.input(&[i]);
        let y = b.input(&[i]);
        let e = b.op(Op::Exp, &[x, y], &[i]);
        b.output(e);
        assert!(matches!(b.build(), Err(GraphError::Arity { found: 2, .. })));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(4u32));
        let x = b.input(&[i]);
        let first = b.op(Op::Add, &[x, NodeId(2)], &[i]);
        let second = b.op(Op::Neg, &[first], &[i]);
        assert_eq!(second, NodeId(2));
        b.output(second);
        assert!(matches!(b.build(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_graph_without_outputs_is_rejected() {
        let mut b = GraphBuilder::new();
        let i = b.var("i", nz!(4u32));
        let x = b.input(&[i]);
        b.op(Op::Neg, &[x], &[i]);
        assert_eq!(b.build(), Err(GraphError::NoOutputs));
    }

    #[test]
    fn test_describe_node() {
        let g = matmul(nz!(2u32), nz!(3u32), nz!(4u32));
        assert_eq!(g.describe_node(NodeId(2)), "%2[m, k, n] <- mul(%0[m, k], %1[k, n])");
        assert_eq!(g.describe_node(NodeId(0)), "%0[m, k] <- input");
    }
}
