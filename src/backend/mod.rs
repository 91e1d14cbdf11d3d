//! Executing a [LoopTree] to measure how long it takes.

mod c;
mod interp;

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::schedule::Annotation;
use crate::tree::{LoopTree, TreeRef};

pub use c::ClangBackend;
pub use interp::{Buffers, Interpreter};

pub trait Backend: Debug + Send + Sync {
    /// Lowers `tree`, runs it, and returns the seconds one execution takes.
    fn lower_and_run(&self, tree: &LoopTree) -> Result<f64, BackendError>;
}

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("Cannot lower loop {at}: {reason}")]
    Unsupported { at: TreeRef, reason: &'static str },
    #[error("Compiler exited with {status}\n{stderr}")]
    Build { status: String, stderr: String },
    #[error("Failed to run the generated code: {0}")]
    Execution(anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Timed executions; the fastest one is reported.
    pub samples: u32,
    /// Kernel executions per compiled-binary run.
    pub steps: u32,
    /// Seed for the input tensors' contents.
    pub seed: u64,
    /// C compiler to use. Falls back to `$CLANG`, then `clang`.
    pub compiler: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            samples: 3,
            steps: 10,
            seed: 0,
            compiler: None,
        }
    }
}

/// Rejects annotations no backend can honour.
///
/// A vectorized loop must be innermost (only leaves below it) and must not have a tail.
pub fn check_lowering(tree: &LoopTree) -> Result<(), BackendError> {
    for r in tree.refs() {
        let Some(l) = tree.as_loop(r) else {
            continue;
        };
        if l.annotation != Annotation::Vectorize {
            continue;
        }
        if tree.children(r).iter().any(|c| tree.as_loop(*c).is_some()) {
            return Err(BackendError::Unsupported {
                at: r,
                reason: "vectorized loop is not innermost",
            });
        }
        if l.tail > 0 {
            return Err(BackendError::Unsupported {
                at: r,
                reason: "vectorized loop has a tail",
            });
        }
    }
    Ok(())
}
