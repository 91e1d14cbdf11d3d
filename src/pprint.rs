use prettytable::{self, format, row};
use std::fmt;

use crate::schedule::Annotation;
use crate::tree::{LoopTree, NodeKind, TreeRef};
use crate::utils::indent;

/// Pretty-print a [LoopTree] to stdout, marking the line of `cursor`.
pub fn pprint(tree: &LoopTree, cursor: Option<TreeRef>) {
    pprint_table(tree, cursor).printstd()
}

/// Pretty-print a [LoopTree] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(
    out: &mut W,
    tree: &LoopTree,
    cursor: Option<TreeRef>,
) -> fmt::Result {
    write!(out, "{}", pprint_table(tree, cursor))
}

pub fn pprint_string(tree: &LoopTree, cursor: Option<TreeRef>) -> String {
    format!("{}", pprint_table(tree, cursor))
}

fn pprint_table(tree: &LoopTree, cursor: Option<TreeRef>) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["", "Loop Tree", ""]);
    for r in tree.refs() {
        let marker = if Some(r) == cursor {
            format!("<<<<<< cursor (line {r})")
        } else {
            String::new()
        };
        let text = format!("{}{}", indent(tree.depth(r)), line_str(tree, r));
        table.add_row(row![r, text, marker]);
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

/// One line of text describing the node at `r`, without indentation.
pub fn line_str(tree: &LoopTree, r: TreeRef) -> String {
    match tree.node(r).kind() {
        NodeKind::Loop(l) => {
            let mut line = format!("for {} in {}", tree.graph().var(l.var).name, l.extent());
            if l.stride > 1 {
                line.push_str(&format!(" (stride {})", l.stride));
            }
            if l.tail > 0 {
                line.push_str(&format!(" (tail {})", l.tail));
            }
            if l.annotation != Annotation::None {
                line.push_str(&format!(" [{}]", l.annotation));
            }
            line
        }
        NodeKind::Leaf(leaf) => tree.graph().describe_node(leaf.node),
    }
}

impl fmt::Display for LoopTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        pprint_write(f, self, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DimSize;
    use crate::graph::{matmul, vector_add};
    use crate::mutate::{annotate, split};

    #[test]
    fn test_line_str() {
        let tree = LoopTree::new(vector_add(DimSize::new(10).unwrap())).unwrap();
        let tree = split(&tree, TreeRef(0), 4).unwrap().tree;
        let tree = annotate(&tree, TreeRef(1), Annotation::Vectorize).unwrap().tree;
        assert_eq!(line_str(&tree, TreeRef(0)), "for i in 3 (stride 4) (tail 2)");
        assert_eq!(line_str(&tree, TreeRef(1)), "for i in 4 [vectorize]");
        assert_eq!(line_str(&tree, TreeRef(2)), "%2[i] <- add(%0[i], %1[i])");
    }

    #[test]
    fn test_dump_marks_cursor() {
        let size = DimSize::new(4).unwrap();
        let tree = LoopTree::new(matmul(size, size, size)).unwrap();
        let dump = pprint_string(&tree, Some(TreeRef(4)));
        let marked = dump
            .lines()
            .filter(|l| l.contains("<<<<<< cursor"))
            .collect::<Vec<_>>();
        assert_eq!(marked.len(), 1);
        assert!(marked[0].contains("for n in 4"));
        assert!(marked[0].contains("(line 4)"));
        assert!(dump.contains("%3[m, n] <- add(%2[m, k, n])"));
    }

    #[test]
    fn test_display_has_no_cursor() {
        let tree = LoopTree::new(vector_add(DimSize::new(4).unwrap())).unwrap();
        assert!(!tree.to_string().contains("cursor"));
        assert!(tree.to_string().contains("for i in 4"));
    }
}
