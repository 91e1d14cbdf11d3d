use log::debug;
use std::str::FromStr;
use std::sync::Arc;
use strum::IntoEnumIterator;

use crate::action::Action;
use crate::backend::{Backend, Interpreter};
use crate::graph::Graph;
use crate::metrics::{Metric, MetricError};
use crate::mutate::{IllegalMutation, MutationError};
use crate::pprint::pprint_string;
use crate::serialization::{self, SerializationError};
use crate::tree::{LoopTree, TreeError, TreeRef};

/// A loop tree with a cursor, driven one named action at a time.
///
/// Every action either replaces the whole (tree, cursor) state or leaves it untouched.
#[derive(Debug, Clone)]
pub struct LoopTreeAgent {
    tree: LoopTree,
    cursor: TreeRef,
    backend: Arc<dyn Backend>,
}

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("Unknown action {name:?}\n{help}")]
    UnknownAction { name: String, help: String },
    #[error("Unknown metric {name:?}\n{help}")]
    UnknownMetric { name: String, help: String },
    #[error("Illegal mutation: {0}")]
    IllegalMutation(IllegalMutation),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Metric(#[from] MetricError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl From<MutationError> for AgentError {
    fn from(value: MutationError) -> Self {
        match value {
            MutationError::Illegal(reason) => AgentError::IllegalMutation(reason),
            MutationError::Tree(e) => AgentError::Tree(e),
        }
    }
}

impl LoopTreeAgent {
    /// Starts at the first line of the default schedule of `graph`, timing with the
    /// [Interpreter].
    pub fn new(graph: Graph) -> Result<Self, AgentError> {
        Self::with_backend(graph, Arc::new(Interpreter::default()))
    }

    pub fn with_backend(graph: Graph, backend: Arc<dyn Backend>) -> Result<Self, AgentError> {
        Ok(Self::at(LoopTree::new(graph)?, TreeRef(0), backend)?)
    }

    pub fn at(
        tree: LoopTree,
        cursor: TreeRef,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, TreeError> {
        tree.check(cursor)?;
        Ok(LoopTreeAgent {
            tree,
            cursor,
            backend,
        })
    }

    pub fn tree(&self) -> &LoopTree {
        &self.tree
    }

    pub fn cursor(&self) -> TreeRef {
        self.cursor
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn apply_action(&mut self, name: &str) -> Result<(), AgentError> {
        let action = Action::from_str(name).map_err(|_| AgentError::UnknownAction {
            name: name.to_string(),
            help: Action::help(),
        })?;
        self.apply(action)
    }

    pub fn apply(&mut self, action: Action) -> Result<(), AgentError> {
        let mutation = action.apply(&self.tree, self.cursor)?;
        debug!(
            "Applied {action} at line {}; cursor now at line {}",
            self.cursor, mutation.cursor
        );
        self.tree = mutation.tree;
        self.cursor = mutation.cursor;
        Ok(())
    }

    pub fn eval(&self, name: &str) -> Result<f64, AgentError> {
        let metric = Metric::from_str(name).map_err(|_| AgentError::UnknownMetric {
            name: name.to_string(),
            help: Metric::help(),
        })?;
        self.evaluate(metric)
    }

    pub fn evaluate(&self, metric: Metric) -> Result<f64, AgentError> {
        Ok(metric.evaluate(&self.tree, self.backend.as_ref())?)
    }

    /// Every action that would succeed from the current state, in table order.
    ///
    /// Illegal actions are skipped. Any other failure is returned, since it means the tree or
    /// the engine is broken.
    pub fn available_actions(&self) -> Result<Vec<Action>, AgentError> {
        let mut available = vec![];
        for action in Action::iter() {
            match self.clone().apply(action) {
                Ok(()) => available.push(action),
                Err(AgentError::IllegalMutation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(available)
    }

    pub fn dump(&self) -> String {
        pprint_string(&self.tree, Some(self.cursor))
    }

    pub fn serialize(&self) -> Result<String, AgentError> {
        Ok(serialization::serialize(&self.tree, self.cursor)?)
    }

    /// Restores an agent from [LoopTreeAgent::serialize] output. The backend is not part of
    /// the text and is supplied by the caller.
    pub fn deserialize(text: &str, backend: Arc<dyn Backend>) -> Result<Self, AgentError> {
        let (tree, cursor) = serialization::deserialize(text)?;
        Ok(Self::at(tree, cursor, backend)?)
    }
}
