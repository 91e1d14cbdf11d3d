//! Text form of a (tree, cursor) pair: the cursor's line number, a newline, and a JSON body
//! holding the graph and schedule the tree is built from.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::graph::Graph;
use crate::schedule::Schedule;
use crate::tree::{LoopTree, TreeError, TreeRef};

#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("Expected a cursor line followed by a newline")]
    MissingDelimiter,
    #[error("Cursor {0:?} is not a line number")]
    BadCursor(String),
    #[error("Malformed body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("Body does not describe a valid loop tree: {0}")]
    Tree(#[from] TreeError),
    #[error("Cursor {cursor} is out of range for a tree of {len} lines")]
    CursorOutOfRange { cursor: TreeRef, len: usize },
}

#[derive(Serialize)]
struct BodyRef<'a> {
    graph: &'a Graph,
    schedule: &'a Schedule,
}

#[derive(Deserialize)]
struct Body {
    graph: Graph,
    schedule: Schedule,
}

pub fn serialize(tree: &LoopTree, cursor: TreeRef) -> Result<String, SerializationError> {
    let body = serde_json::to_string(&BodyRef {
        graph: tree.graph(),
        schedule: tree.schedule(),
    })?;
    Ok(format!("{cursor}\n{body}"))
}

pub fn deserialize(text: &str) -> Result<(LoopTree, TreeRef), SerializationError> {
    let (head, body) = text
        .split_once('\n')
        .ok_or(SerializationError::MissingDelimiter)?;
    let cursor = head
        .trim()
        .parse::<u32>()
        .map(TreeRef)
        .map_err(|_| SerializationError::BadCursor(head.to_string()))?;
    let Body { graph, schedule } = serde_json::from_str(body)?;
    let tree = LoopTree::build(Arc::new(graph), schedule)?;
    if !tree.contains(cursor) {
        return Err(SerializationError::CursorOutOfRange {
            cursor,
            len: tree.len(),
        });
    }
    Ok((tree, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::common::DimSize;
    use crate::graph::matmul;
    use crate::pprint::pprint_string;
    use proptest::prelude::*;

    fn matmul_tree() -> LoopTree {
        let size = DimSize::new(8).unwrap();
        LoopTree::new(matmul(size, size, size)).unwrap()
    }

    #[test]
    fn test_cursor_leads_the_text() {
        let text = serialize(&matmul_tree(), TreeRef(3)).unwrap();
        let (head, body) = text.split_once('\n').unwrap();
        assert_eq!(head, "3");
        assert!(body.starts_with('{'));
        assert!(!body.contains('\n'));
    }

    #[test]
    fn test_missing_delimiter() {
        assert!(matches!(
            deserialize("3"),
            Err(SerializationError::MissingDelimiter)
        ));
    }

    #[test]
    fn test_bad_cursor() {
        let text = serialize(&matmul_tree(), TreeRef(0)).unwrap();
        let body = text.split_once('\n').unwrap().1;
        assert!(matches!(
            deserialize(&format!("-1\n{body}")),
            Err(SerializationError::BadCursor(_))
        ));
        assert!(matches!(
            deserialize(&format!("top\n{body}")),
            Err(SerializationError::BadCursor(_))
        ));
    }

    #[test]
    fn test_bad_body() {
        assert!(matches!(
            deserialize("0\n{\"graph\": 1}"),
            Err(SerializationError::Body(_))
        ));
    }

    #[test]
    fn test_cursor_out_of_range() {
        let tree = matmul_tree();
        let text = serialize(&tree, TreeRef(0)).unwrap();
        let body = text.split_once('\n').unwrap().1;
        let err = deserialize(&format!("{}\n{body}", tree.len())).unwrap_err();
        assert!(matches!(err, SerializationError::CursorOutOfRange { .. }));
    }

    #[test]
    fn test_invalid_schedule_is_rejected() {
        let text = serialize(&matmul_tree(), TreeRef(0)).unwrap();
        // Shrink a variable so its loops overrun it.
        let broken = text.replacen("\"size\":8", "\"size\":7", 1);
        assert_ne!(broken, text);
        assert!(matches!(
            deserialize(&broken),
            Err(SerializationError::Tree(TreeError::Schedule(_)))
        ));
    }

    proptest! {
        #[test]
        fn test_round_trip_preserves_dump_and_cursor(
            actions in proptest::collection::vec(any::<Action>(), 0..24)
        ) {
            let (mut tree, mut cursor) = (matmul_tree(), TreeRef(0));
            for action in actions {
                if let Ok(m) = action.apply(&tree, cursor) {
                    tree = m.tree;
                    cursor = m.cursor;
                }
            }
            let text = serialize(&tree, cursor).unwrap();
            let (restored, restored_cursor) = deserialize(&text).unwrap();
            prop_assert_eq!(restored_cursor, cursor);
            prop_assert_eq!(
                pprint_string(&restored, Some(restored_cursor)),
                pprint_string(&tree, Some(cursor))
            );
            prop_assert_eq!(restored, tree);
        }
    }
}
