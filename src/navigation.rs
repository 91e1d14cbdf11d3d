use crate::mutate::{IllegalMutation, MutationError};
use crate::tree::{LoopTree, TreeRef};

/// The node before `r` in traversal order.
pub fn previous_ref(tree: &LoopTree, r: TreeRef) -> Result<TreeRef, MutationError> {
    tree.check(r)?;
    match r.index() {
        0 => Err(IllegalMutation::AtStart.into()),
        i => Ok(TreeRef::from(i - 1)),
    }
}

/// The node after `r` in traversal order.
pub fn next_ref(tree: &LoopTree, r: TreeRef) -> Result<TreeRef, MutationError> {
    tree.check(r)?;
    let next = r.index() + 1;
    if next == tree.len() {
        return Err(IllegalMutation::AtEnd.into());
    }
    Ok(TreeRef::from(next))
}
