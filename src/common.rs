use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;

/// Identifies an iteration variable of a [Graph](crate::graph::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct VarId(pub u32);

/// Identifies a node (and the tensor it produces) of a [Graph](crate::graph::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0.try_into().unwrap()
    }
}

impl NodeId {
    pub fn index(self) -> usize {
        self.0.try_into().unwrap()
    }
}

impl From<usize> for VarId {
    fn from(value: usize) -> Self {
        VarId(value.try_into().unwrap())
    }
}

impl From<usize> for NodeId {
    fn from(value: usize) -> Self {
        NodeId(value.try_into().unwrap())
    }
}

impl Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}
