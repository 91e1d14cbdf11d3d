use strum::IntoEnumIterator;

use crate::mutate::{
    annotate, copy_input, decrease_reuse, expect_loop, increase_reuse, merge, split, try_swap,
    Mutation, MutationError,
};
use crate::navigation::{next_ref, previous_ref};
use crate::schedule::Annotation;
use crate::tree::{LoopTree, TreeRef};

/// Every action an agent can take at its cursor, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter, strum::IntoStaticStr)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Action {
    #[strum(serialize = "up")]
    Up,
    #[strum(serialize = "down")]
    Down,
    #[strum(serialize = "swap_down")]
    SwapDown,
    #[strum(serialize = "swap_up")]
    SwapUp,
    #[strum(serialize = "split_2")]
    Split2,
    #[strum(serialize = "split_4")]
    Split4,
    #[strum(serialize = "split_8")]
    Split8,
    #[strum(serialize = "split_16")]
    Split16,
    #[strum(serialize = "split_32")]
    Split32,
    #[strum(serialize = "split_64")]
    Split64,
    #[strum(serialize = "split_128")]
    Split128,
    #[strum(serialize = "split_256")]
    Split256,
    #[strum(serialize = "merge")]
    Merge,
    #[strum(serialize = "vectorize")]
    Vectorize,
    #[strum(serialize = "unroll")]
    Unroll,
    #[strum(serialize = "copy_input_0")]
    CopyInput0,
    #[strum(serialize = "copy_input_1")]
    CopyInput1,
    #[strum(serialize = "increase_reuse")]
    IncreaseReuse,
    #[strum(serialize = "decrease_reuse")]
    DecreaseReuse,
}

impl Action {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Lists every action name, one per line, in table order.
    pub fn help() -> String {
        let mut help = String::from("Available actions are:\n");
        for action in Action::iter() {
            help.push_str(action.name());
            help.push('\n');
        }
        help
    }

    /// Applies this action to `tree` at `cursor`.
    pub fn apply(self, tree: &LoopTree, cursor: TreeRef) -> Result<Mutation, MutationError> {
        match self {
            Action::Up => Ok(Mutation {
                cursor: previous_ref(tree, cursor)?,
                tree: tree.clone(),
            }),
            Action::Down => Ok(Mutation {
                cursor: next_ref(tree, cursor)?,
                tree: tree.clone(),
            }),
            Action::SwapDown => try_swap(tree, cursor, next_ref(tree, cursor)?),
            Action::SwapUp => try_swap(tree, cursor, previous_ref(tree, cursor)?),
            Action::Split2 => split(tree, cursor, 2),
            Action::Split4 => split(tree, cursor, 4),
            Action::Split8 => split(tree, cursor, 8),
            Action::Split16 => split(tree, cursor, 16),
            Action::Split32 => split(tree, cursor, 32),
            Action::Split64 => split(tree, cursor, 64),
            Action::Split128 => split(tree, cursor, 128),
            Action::Split256 => split(tree, cursor, 256),
            Action::Merge => merge(tree, cursor),
            Action::Vectorize => toggle(tree, cursor, Annotation::Vectorize),
            Action::Unroll => toggle(tree, cursor, Annotation::Unroll),
            Action::CopyInput0 => copy_input(tree, cursor, 0),
            Action::CopyInput1 => copy_input(tree, cursor, 1),
            Action::IncreaseReuse => increase_reuse(tree, cursor),
            Action::DecreaseReuse => decrease_reuse(tree, cursor),
        }
    }
}

/// Sets `annotation` on the loop at `cursor`, or clears it if already set.
fn toggle(
    tree: &LoopTree,
    cursor: TreeRef,
    annotation: Annotation,
) -> Result<Mutation, MutationError> {
    let current = expect_loop(tree, cursor)?.annotation;
    let next = if current == annotation {
        Annotation::None
    } else {
        annotation
    };
    annotate(tree, cursor, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DimSize;
    use crate::graph::vector_add;
    use crate::mutate::IllegalMutation;
    use std::str::FromStr;

    #[test]
    fn test_names_round_trip() {
        for action in Action::iter() {
            assert_eq!(Action::from_str(action.name()), Ok(action));
            assert_eq!(action.to_string(), action.name());
        }
        assert_eq!(Action::from_str("split_16"), Ok(Action::Split16));
        assert_eq!(Action::from_str("copy_input_1"), Ok(Action::CopyInput1));
        assert!(Action::from_str("Split_16").is_err());
        assert!(Action::from_str("split_3").is_err());
    }

    #[test]
    fn test_help_lists_actions_in_order() {
        let help = Action::help();
        let mut lines = help.lines();
        assert_eq!(lines.next(), Some("Available actions are:"));
        assert_eq!(lines.next(), Some("up"));
        assert_eq!(lines.last(), Some("decrease_reuse"));
        assert_eq!(help.lines().count(), 1 + Action::iter().count());
    }

    #[test]
    fn test_vectorize_toggles() {
        let tree = LoopTree::new(vector_add(DimSize::new(8).unwrap())).unwrap();
        let once = Action::Vectorize.apply(&tree, TreeRef(0)).unwrap();
        assert_eq!(once.tree.annotation(TreeRef(0)), Some(Annotation::Vectorize));
        let unrolled = Action::Unroll.apply(&once.tree, TreeRef(0)).unwrap();
        assert_eq!(unrolled.tree.annotation(TreeRef(0)), Some(Annotation::Unroll));
        let twice = Action::Vectorize.apply(&once.tree, once.cursor).unwrap();
        assert_eq!(twice.tree.annotation(TreeRef(0)), Some(Annotation::None));
        assert_eq!(twice.tree, tree);
    }

    #[test]
    fn test_moves_keep_tree() {
        let tree = LoopTree::new(vector_add(DimSize::new(8).unwrap())).unwrap();
        let down = Action::Down.apply(&tree, TreeRef(0)).unwrap();
        assert_eq!(down.cursor, TreeRef(1));
        assert_eq!(down.tree, tree);
        assert_eq!(
            Action::Down.apply(&tree, TreeRef(1)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::AtEnd)
        );
        assert_eq!(
            Action::SwapUp.apply(&tree, TreeRef(0)).unwrap_err(),
            MutationError::Illegal(IllegalMutation::AtStart)
        );
    }
}
