//! Structural diff between two documents.
//!
//! [`diff`] returns operations that turn one tree into another. Revert uses
//! it to express "make the live document look like version N" as ordinary
//! forward edits on top of the current history.

use std::collections::BTreeSet;

use super::node::{DocumentNode, Unit, nodes_from_units, units_of};
use super::operation::{AttrChange, Operation, Position};
use crate::error::{CollabError, Result};

/// Operations that transform `live` into `target` when applied in order.
///
/// Both trees should be normalized. Unchanged prefixes and suffixes of each
/// container are kept; same-typed nodes at matching positions are diffed
/// recursively; everything else is deleted and re-inserted.
pub fn diff(live: &DocumentNode, target: &DocumentNode) -> Result<Vec<Operation>> {
    if live.node_type != target.node_type {
        return Err(CollabError::MalformedOperation(format!(
            "cannot diff {:?} against {:?}",
            live.node_type, target.node_type
        )));
    }
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_node(live, target, &mut path, &mut ops);
    Ok(ops)
}

fn diff_node(
    live: &DocumentNode,
    target: &DocumentNode,
    path: &mut Vec<usize>,
    ops: &mut Vec<Operation>,
) {
    let keys: BTreeSet<&String> = live.attrs.keys().chain(target.attrs.keys()).collect();
    let changes: Vec<AttrChange> = keys
        .into_iter()
        .filter_map(|key| {
            let before = live.attrs.get(key);
            let after = target.attrs.get(key);
            (before != after).then(|| AttrChange {
                key: key.clone(),
                before: before.cloned(),
                after: after.cloned(),
            })
        })
        .collect();
    if !changes.is_empty() {
        ops.push(Operation::SetAttrs {
            path: path.clone(),
            changes,
        });
    }

    if live.node_type.is_atom() {
        return;
    }
    diff_content(live, target, path, ops);
}

fn diff_content(
    live: &DocumentNode,
    target: &DocumentNode,
    path: &mut Vec<usize>,
    ops: &mut Vec<Operation>,
) {
    let a = units_of(live);
    let b = units_of(target);

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];
    if a_mid.is_empty() && b_mid.is_empty() {
        return;
    }

    if !live.node_type.is_textblock() && a_mid.len() == b_mid.len() {
        for (i, (x, y)) in a_mid.iter().zip(b_mid).enumerate() {
            let (Unit::Node(x), Unit::Node(y)) = (x, y) else {
                continue;
            };
            let offset = prefix + i;
            if x.node_type == y.node_type {
                path.push(offset);
                diff_node(x, y, path, ops);
                path.pop();
            } else {
                let at = Position::new(path.clone(), offset);
                ops.push(Operation::DeleteRange {
                    at: at.clone(),
                    deleted: vec![x.clone()],
                });
                ops.push(Operation::InsertNodes {
                    at,
                    nodes: vec![y.clone()],
                });
            }
        }
        return;
    }

    let at = Position::new(path.clone(), prefix);
    if !a_mid.is_empty() {
        ops.push(Operation::DeleteRange {
            at: at.clone(),
            deleted: nodes_from_units(a_mid),
        });
    }
    if !b_mid.is_empty() {
        ops.push(Operation::InsertNodes {
            at,
            nodes: nodes_from_units(b_mid),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::Mark;
    use crate::model::operation::apply_all;

    fn assert_diff_reaches(live: DocumentNode, target: DocumentNode) -> Vec<Operation> {
        let live = live.normalized();
        let target = target.normalized();
        let ops = diff(&live, &target).unwrap();
        let result = apply_all(&live, &ops).unwrap();
        assert_eq!(result, target);
        ops
    }

    #[test]
    fn test_identical_documents_need_no_ops() {
        let doc = DocumentNode::doc(vec![DocumentNode::paragraph(vec![DocumentNode::text(
            "same",
        )])]);
        assert!(assert_diff_reaches(doc.clone(), doc).is_empty());
    }

    #[test]
    fn test_text_change_in_middle() {
        let ops = assert_diff_reaches(
            DocumentNode::doc(vec![DocumentNode::paragraph(vec![DocumentNode::text(
                "Hello big world",
            )])]),
            DocumentNode::doc(vec![DocumentNode::paragraph(vec![DocumentNode::text(
                "Hello small world",
            )])]),
        );
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], Operation::DeleteRange { at, .. } if at.offset == 6));
    }

    #[test]
    fn test_block_added_and_removed() {
        assert_diff_reaches(
            DocumentNode::doc(vec![
                DocumentNode::paragraph(vec![DocumentNode::text("one")]),
                DocumentNode::paragraph(vec![DocumentNode::text("two")]),
                DocumentNode::paragraph(vec![DocumentNode::text("three")]),
            ]),
            DocumentNode::doc(vec![
                DocumentNode::paragraph(vec![DocumentNode::text("one")]),
                DocumentNode::image("cat.png"),
                DocumentNode::list(false, vec![DocumentNode::list_item(vec![])]),
                DocumentNode::paragraph(vec![DocumentNode::text("three")]),
            ]),
        );
    }

    #[test]
    fn test_attrs_marks_and_type_swaps() {
        assert_diff_reaches(
            DocumentNode::doc(vec![
                DocumentNode::heading(1, vec![DocumentNode::text("Title")]),
                DocumentNode::paragraph(vec![DocumentNode::text("plain text")]),
                DocumentNode::image("a.png"),
            ]),
            DocumentNode::doc(vec![
                DocumentNode::heading(2, vec![DocumentNode::text("Title")]),
                DocumentNode::paragraph(vec![
                    DocumentNode::text("plain "),
                    DocumentNode::marked_text("text", vec![Mark::bold()]),
                ]),
                DocumentNode::code_block(None, "a.png"),
            ]),
        );
    }

    #[test]
    fn test_nested_table_cell_edit() {
        let table = |text: &str| {
            DocumentNode::table(vec![DocumentNode::table_row(vec![
                DocumentNode::table_cell(vec![DocumentNode::paragraph(vec![DocumentNode::text(
                    "fixed",
                )])]),
                DocumentNode::table_cell(vec![DocumentNode::paragraph(vec![DocumentNode::text(
                    text,
                )])]),
            ])])
        };
        let ops = assert_diff_reaches(
            DocumentNode::doc(vec![table("before")]),
            DocumentNode::doc(vec![table("after")]),
        );
        for op in &ops {
            if let Operation::DeleteRange { at, .. } | Operation::InsertNodes { at, .. } = op {
                assert_eq!(at.path, vec![0, 0, 1, 0]);
            }
        }
    }

    #[test]
    fn test_to_and_from_empty() {
        let full = DocumentNode::doc(vec![
            DocumentNode::paragraph(vec![DocumentNode::text("content")]),
            DocumentNode::paragraph(vec![]),
        ]);
        assert_diff_reaches(DocumentNode::empty_doc(), full.clone());
        assert_diff_reaches(full, DocumentNode::empty_doc());
    }
}
