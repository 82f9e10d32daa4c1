//! Invertible edit operations on the document tree.
//!
//! Positions address a container by a path of content-unit indices from the
//! root, plus an offset in that container's units. In a textblock every
//! character and every inline atom is one unit; in other containers every
//! child node is one unit.
//!
//! [`apply`] is pure: it validates the operation against the document and
//! returns a new tree, or fails with [`CollabError::MalformedOperation`]
//! leaving the input untouched. [`Operation::invert`] is exact for
//! normalized documents: `apply(apply(d, op), op.invert()) == d`.

use serde::{Deserialize, Serialize};

use super::node::{
    AttrValue, DocumentNode, Mark, Unit, nodes_from_units, slice_units, sort_marks, units_of,
};
use super::schema::{validate_attr, validate_mark, validate_marks, validate_node};
use crate::error::{CollabError, Result};

/// A location inside a container node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Content-unit indices from the root to the container
    pub path: Vec<usize>,
    /// Offset in content units within the container
    pub offset: usize,
}

impl Position {
    pub fn new(path: Vec<usize>, offset: usize) -> Self {
        Self { path, offset }
    }

    /// A position directly inside the root node.
    pub fn root(offset: usize) -> Self {
        Self::new(Vec::new(), offset)
    }
}

/// One attribute change, carrying the previous value so it can be inverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrChange {
    pub key: String,
    pub before: Option<AttrValue>,
    pub after: Option<AttrValue>,
}

/// An atomic edit of the document tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Operation {
    /// Insert characters into a textblock.
    InsertText {
        at: Position,
        text: String,
        #[serde(default)]
        marks: Vec<Mark>,
    },
    /// Insert a slice of nodes (blocks, inline atoms or text runs).
    InsertNodes {
        at: Position,
        nodes: Vec<DocumentNode>,
    },
    /// Remove the slice starting at `at`. The removed content is carried so
    /// the operation can be inverted; it must match the document.
    DeleteRange {
        at: Position,
        deleted: Vec<DocumentNode>,
    },
    /// Change attributes of the node at `path`.
    SetAttrs {
        path: Vec<usize>,
        changes: Vec<AttrChange>,
    },
    /// Add a mark to every character of a range. No character in the range
    /// may already carry a mark of the same type.
    AddMark {
        at: Position,
        len: usize,
        mark: Mark,
    },
    /// Remove a mark from every character of a range. Every character must
    /// carry exactly this mark.
    RemoveMark {
        at: Position,
        len: usize,
        mark: Mark,
    },
}

fn malformed(msg: impl Into<String>) -> CollabError {
    CollabError::MalformedOperation(msg.into())
}

impl Operation {
    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::InsertText { .. } => "insert-text",
            Operation::InsertNodes { .. } => "insert-node",
            Operation::DeleteRange { .. } => "delete-range",
            Operation::SetAttrs { .. } => "set-attrs",
            Operation::AddMark { .. } => "add-mark",
            Operation::RemoveMark { .. } => "remove-mark",
        }
    }

    /// The operation that undoes this one.
    pub fn invert(&self) -> Operation {
        match self {
            Operation::InsertText { at, text, marks } => Operation::DeleteRange {
                at: at.clone(),
                deleted: vec![DocumentNode::marked_text(text, marks.clone())],
            },
            Operation::InsertNodes { at, nodes } => Operation::DeleteRange {
                at: at.clone(),
                deleted: nodes.clone(),
            },
            Operation::DeleteRange { at, deleted } => Operation::InsertNodes {
                at: at.clone(),
                nodes: deleted.clone(),
            },
            Operation::SetAttrs { path, changes } => Operation::SetAttrs {
                path: path.clone(),
                changes: changes
                    .iter()
                    .rev()
                    .map(|c| AttrChange {
                        key: c.key.clone(),
                        before: c.after.clone(),
                        after: c.before.clone(),
                    })
                    .collect(),
            },
            Operation::AddMark { at, len, mark } => Operation::RemoveMark {
                at: at.clone(),
                len: *len,
                mark: mark.clone(),
            },
            Operation::RemoveMark { at, len, mark } => Operation::AddMark {
                at: at.clone(),
                len: *len,
                mark: mark.clone(),
            },
        }
    }

    /// Plain text insertion.
    pub fn insert_text(at: Position, text: &str) -> Operation {
        Operation::InsertText {
            at,
            text: text.to_string(),
            marks: Vec::new(),
        }
    }

    pub fn insert_node(at: Position, node: DocumentNode) -> Operation {
        Operation::InsertNodes {
            at,
            nodes: vec![node],
        }
    }

    /// Build a delete of `len` units at `at`, capturing the removed slice
    /// from `doc`.
    pub fn delete(doc: &DocumentNode, at: Position, len: usize) -> Result<Operation> {
        let deleted = slice(doc, &at, len)?;
        Ok(Operation::DeleteRange { at, deleted })
    }

    /// Build a single attribute change, capturing the current value.
    pub fn set_attr(
        doc: &DocumentNode,
        path: Vec<usize>,
        key: &str,
        value: Option<AttrValue>,
    ) -> Result<Operation> {
        let node = node_at(doc, &path)?;
        Ok(Operation::SetAttrs {
            path,
            changes: vec![AttrChange {
                key: key.to_string(),
                before: node.attrs.get(key).cloned(),
                after: value,
            }],
        })
    }
}

/// Free-function form of [`Operation::invert`].
pub fn invert(op: &Operation) -> Operation {
    op.invert()
}

/// The inverse of a group of operations applied in order.
pub fn invert_all(ops: &[Operation]) -> Vec<Operation> {
    ops.iter().rev().map(Operation::invert).collect()
}

/// Apply an operation, returning the new document.
pub fn apply(doc: &DocumentNode, op: &Operation) -> Result<DocumentNode> {
    let mut next = doc.clone();
    apply_in_place(&mut next, op)?;
    Ok(next)
}

/// Apply operations in order. Fails on the first invalid one.
pub fn apply_all(doc: &DocumentNode, ops: &[Operation]) -> Result<DocumentNode> {
    let mut next = doc.clone();
    for op in ops {
        apply_in_place(&mut next, op)?;
    }
    Ok(next)
}

/// Content slice of `len` units at `at`, as canonical nodes.
pub fn slice(doc: &DocumentNode, at: &Position, len: usize) -> Result<Vec<DocumentNode>> {
    let container = container_at(doc, &at.path)?;
    let units = units_of(container);
    let end = at
        .offset
        .checked_add(len)
        .filter(|end| *end <= units.len())
        .ok_or_else(|| malformed(format!("range {}+{} out of bounds", at.offset, len)))?;
    Ok(nodes_from_units(&units[at.offset..end]))
}

/// Index of the child occupying unit `unit` of `container`, if that unit
/// is a node.
fn child_index(container: &DocumentNode, unit: usize) -> Option<usize> {
    if !container.node_type.is_textblock() {
        return (unit < container.children.len()).then_some(unit);
    }
    let mut pos = 0;
    for (i, child) in container.children.iter().enumerate() {
        let width = match &child.text {
            Some(text) => text.chars().count(),
            None => 1,
        };
        if unit < pos + width {
            return child.text.is_none().then_some(i);
        }
        pos += width;
    }
    None
}

/// The node at `path`.
pub fn node_at<'a>(root: &'a DocumentNode, path: &[usize]) -> Result<&'a DocumentNode> {
    let mut node = root;
    for (depth, &unit) in path.iter().enumerate() {
        let index = child_index(node, unit)
            .ok_or_else(|| malformed(format!("path {:?} does not exist at depth {}", path, depth)))?;
        node = &node.children[index];
    }
    Ok(node)
}

fn node_at_mut<'a>(root: &'a mut DocumentNode, path: &[usize]) -> Result<&'a mut DocumentNode> {
    let mut node = root;
    for (depth, &unit) in path.iter().enumerate() {
        let index = child_index(node, unit)
            .ok_or_else(|| malformed(format!("path {:?} does not exist at depth {}", path, depth)))?;
        node = &mut node.children[index];
    }
    Ok(node)
}

fn container_at<'a>(root: &'a DocumentNode, path: &[usize]) -> Result<&'a DocumentNode> {
    let node = node_at(root, path)?;
    if node.is_text() || node.node_type.is_atom() {
        return Err(malformed(format!("{:?} is not a container", node.node_type)));
    }
    Ok(node)
}

fn container_at_mut<'a>(root: &'a mut DocumentNode, path: &[usize]) -> Result<&'a mut DocumentNode> {
    let node = node_at_mut(root, path)?;
    if node.is_text() || node.node_type.is_atom() {
        return Err(malformed(format!("{:?} is not a container", node.node_type)));
    }
    Ok(node)
}

fn check_range(units: &[Unit], offset: usize, len: usize) -> Result<usize> {
    offset
        .checked_add(len)
        .filter(|end| *end <= units.len())
        .ok_or_else(|| malformed(format!("range {}+{} out of bounds ({})", offset, len, units.len())))
}

fn apply_in_place(doc: &mut DocumentNode, op: &Operation) -> Result<()> {
    match op {
        Operation::InsertText { at, text, marks } => {
            if text.is_empty() {
                return Err(malformed("empty text insertion"));
            }
            let container = container_at_mut(doc, &at.path)?;
            if !container.node_type.is_textblock() {
                return Err(malformed(format!(
                    "cannot insert text into {:?}",
                    container.node_type
                )));
            }
            validate_marks(container.node_type, marks)?;
            let mut marks = marks.clone();
            sort_marks(&mut marks);

            let mut units = units_of(container);
            if at.offset > units.len() {
                return Err(malformed(format!("offset {} out of bounds", at.offset)));
            }
            let inserted = text.chars().map(|c| Unit::Char(c, marks.clone()));
            units.splice(at.offset..at.offset, inserted);
            container.children = nodes_from_units(&units);
        }

        Operation::InsertNodes { at, nodes } => {
            if nodes.is_empty() {
                return Err(malformed("empty node insertion"));
            }
            let container = container_at_mut(doc, &at.path)?;
            for node in nodes {
                if !container.node_type.allows_child(node.node_type) {
                    return Err(malformed(format!(
                        "{:?} cannot contain {:?}",
                        container.node_type, node.node_type
                    )));
                }
                if node.is_text() {
                    validate_marks(container.node_type, &node.marks)?;
                }
                validate_node(node)?;
            }
            let mut units = units_of(container);
            if at.offset > units.len() {
                return Err(malformed(format!("offset {} out of bounds", at.offset)));
            }
            let normalized: Vec<DocumentNode> =
                nodes.iter().cloned().map(DocumentNode::normalized).collect();
            let inserted = slice_units(container.node_type, &normalized);
            units.splice(at.offset..at.offset, inserted);
            container.children = nodes_from_units(&units);
        }

        Operation::DeleteRange { at, deleted } => {
            if deleted.is_empty() {
                return Err(malformed("empty deletion"));
            }
            let container = container_at_mut(doc, &at.path)?;
            let normalized: Vec<DocumentNode> =
                deleted.iter().cloned().map(DocumentNode::normalized).collect();
            let expected = slice_units(container.node_type, &normalized);
            let mut units = units_of(container);
            let end = check_range(&units, at.offset, expected.len())?;
            if units[at.offset..end] != expected[..] {
                return Err(malformed("deleted content does not match the document"));
            }
            units.drain(at.offset..end);
            container.children = nodes_from_units(&units);
        }

        Operation::SetAttrs { path, changes } => {
            if changes.is_empty() {
                return Err(malformed("empty attribute change"));
            }
            let node = node_at_mut(doc, path)?;
            if node.is_text() {
                return Err(malformed("text nodes have no attributes"));
            }
            for change in changes {
                if node.attrs.get(&change.key) != change.before.as_ref() {
                    return Err(malformed(format!(
                        "attribute '{}' does not have the expected previous value",
                        change.key
                    )));
                }
                match &change.after {
                    Some(value) => {
                        validate_attr(node.node_type, &change.key, value)?;
                        node.attrs.insert(change.key.clone(), value.clone());
                    }
                    None => {
                        if node.node_type.attr_kind(&change.key).is_none() {
                            return Err(malformed(format!(
                                "{:?} has no attribute '{}'",
                                node.node_type, change.key
                            )));
                        }
                        node.attrs.remove(&change.key);
                    }
                }
            }
        }

        Operation::AddMark { at, len, mark } | Operation::RemoveMark { at, len, mark } => {
            let adding = matches!(op, Operation::AddMark { .. });
            if *len == 0 {
                return Err(malformed("empty mark range"));
            }
            validate_mark(mark)?;
            let container = container_at_mut(doc, &at.path)?;
            if !container.node_type.allows_marks() {
                return Err(malformed(format!(
                    "{:?} does not allow marks",
                    container.node_type
                )));
            }
            let mut units = units_of(container);
            let end = check_range(&units, at.offset, *len)?;
            for unit in &mut units[at.offset..end] {
                let Unit::Char(_, marks) = unit else {
                    continue;
                };
                if adding {
                    if marks.iter().any(|m| m.mark_type == mark.mark_type) {
                        return Err(malformed(format!(
                            "text already carries a {:?} mark",
                            mark.mark_type
                        )));
                    }
                    marks.push(mark.clone());
                    sort_marks(marks);
                } else {
                    let Some(index) = marks.iter().position(|m| m == mark) else {
                        return Err(malformed(format!(
                            "text does not carry the {:?} mark",
                            mark.mark_type
                        )));
                    };
                    marks.remove(index);
                }
            }
            container.children = nodes_from_units(&units);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::{MarkType, NodeType};

    fn sample() -> DocumentNode {
        DocumentNode::doc(vec![
            DocumentNode::heading(1, vec![DocumentNode::text("Title")]),
            DocumentNode::paragraph(vec![
                DocumentNode::text("Hello "),
                DocumentNode::marked_text("bold", vec![Mark::bold()]),
                DocumentNode::custom_inline("wave"),
                DocumentNode::text(" end"),
            ]),
            DocumentNode::table(vec![DocumentNode::table_row(vec![
                DocumentNode::table_cell(vec![DocumentNode::paragraph(vec![])]),
            ])]),
        ])
        .normalized()
    }

    fn assert_invertible(doc: &DocumentNode, op: &Operation) {
        let applied = apply(doc, op).unwrap();
        let restored = apply(&applied, &op.invert()).unwrap();
        assert_eq!(&restored, doc, "inverse of {} did not restore", op.kind_name());
    }

    #[test]
    fn test_insert_text() {
        let doc = sample();
        let op = Operation::insert_text(Position::new(vec![1], 6), "very ");
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children[1].plain_text(), "Hello very bold end");
        assert_invertible(&doc, &op);
    }

    #[test]
    fn test_insert_text_inherits_nothing_and_keeps_runs() {
        let doc = sample();
        let op = Operation::InsertText {
            at: Position::new(vec![1], 10),
            text: "er".into(),
            marks: vec![Mark::bold()],
        };
        let next = apply(&doc, &op).unwrap();
        let p = &next.children[1];
        assert_eq!(p.children[1].text.as_deref(), Some("bolder"));
        assert_eq!(p.children[1].marks, vec![Mark::bold()]);
        assert_invertible(&doc, &op);
    }

    #[test]
    fn test_insert_text_rejects_non_textblock() {
        let doc = sample();
        let op = Operation::insert_text(Position::root(0), "x");
        assert!(matches!(
            apply(&doc, &op),
            Err(CollabError::MalformedOperation(_))
        ));
        let op = Operation::insert_text(Position::new(vec![9], 0), "x");
        assert!(apply(&doc, &op).is_err());
        let op = Operation::insert_text(Position::new(vec![1], 99), "x");
        assert!(apply(&doc, &op).is_err());
    }

    #[test]
    fn test_insert_table_row_keeps_structure() {
        let doc = sample();
        let row = DocumentNode::table_row(vec![DocumentNode::table_cell(vec![
            DocumentNode::paragraph(vec![DocumentNode::text("new")]),
        ])]);
        let op = Operation::insert_node(Position::new(vec![2], 1), row);
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children[2].children.len(), 2);
        assert_invertible(&doc, &op);

        // A cell directly inside a table would orphan it.
        let cell = DocumentNode::table_cell(vec![]);
        let op = Operation::insert_node(Position::new(vec![2], 0), cell);
        assert!(apply(&doc, &op).is_err());
    }

    #[test]
    fn test_insert_inline_atom() {
        let doc = sample();
        let op = Operation::insert_node(
            Position::new(vec![0], 0),
            DocumentNode::custom_inline("team"),
        );
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children[0].content_len(), 6);
        assert_invertible(&doc, &op);
    }

    #[test]
    fn test_delete_range_across_runs_and_atoms() {
        let doc = sample();
        let op = Operation::delete(&doc, Position::new(vec![1], 4), 8).unwrap();
        let Operation::DeleteRange { deleted, .. } = &op else {
            panic!("expected delete");
        };
        assert_eq!(deleted.len(), 4);
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children[1].plain_text(), "Hellend");
        assert_invertible(&doc, &op);
    }

    #[test]
    fn test_delete_requires_matching_content() {
        let doc = sample();
        let op = Operation::DeleteRange {
            at: Position::new(vec![0], 0),
            deleted: vec![DocumentNode::text("Tidal")],
        };
        assert!(matches!(
            apply(&doc, &op),
            Err(CollabError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_delete_blocks() {
        let doc = sample();
        let op = Operation::delete(&doc, Position::root(0), 2).unwrap();
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children.len(), 1);
        assert_eq!(next.children[0].node_type, NodeType::Table);
        assert_invertible(&doc, &op);
    }

    #[test]
    fn test_set_attrs() {
        let doc = sample();
        let op = Operation::set_attr(&doc, vec![0], "level", Some(AttrValue::Int(2))).unwrap();
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children[0].attrs["level"], AttrValue::Int(2));
        assert_invertible(&doc, &op);

        let op = Operation::set_attr(&doc, vec![0], "textAlign", Some("center".into())).unwrap();
        assert_invertible(&doc, &op);

        let bad = Operation::set_attr(&doc, vec![0], "level", Some(AttrValue::Int(9))).unwrap();
        assert!(apply(&doc, &bad).is_err());

        let stale = Operation::SetAttrs {
            path: vec![0],
            changes: vec![AttrChange {
                key: "level".into(),
                before: Some(AttrValue::Int(3)),
                after: Some(AttrValue::Int(2)),
            }],
        };
        assert!(apply(&doc, &stale).is_err());
    }

    #[test]
    fn test_set_attrs_on_inline_atom() {
        let doc = sample();
        // "Hello bold" is 10 units, the atom is unit 10.
        let op = Operation::set_attr(&doc, vec![1, 10], "name", Some("smile".into())).unwrap();
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children[1].children[2].attrs["name"], AttrValue::from("smile"));
        assert_invertible(&doc, &op);

        assert!(Operation::set_attr(&doc, vec![1, 0], "name", None).is_err());
    }

    #[test]
    fn test_marks() {
        let doc = sample();
        let op = Operation::AddMark {
            at: Position::new(vec![1], 0),
            len: 5,
            mark: Mark::italic(),
        };
        let next = apply(&doc, &op).unwrap();
        assert_eq!(next.children[1].children[0].marks, vec![Mark::italic()]);
        assert_invertible(&doc, &op);

        let dup = Operation::AddMark {
            at: Position::new(vec![1], 6),
            len: 2,
            mark: Mark::bold(),
        };
        assert!(apply(&doc, &dup).is_err());

        let remove = Operation::RemoveMark {
            at: Position::new(vec![1], 6),
            len: 4,
            mark: Mark::bold(),
        };
        let next = apply(&doc, &remove).unwrap();
        assert_eq!(next.children[1].children[0].text.as_deref(), Some("Hello bold"));
        assert_invertible(&doc, &remove);

        let missing = Operation::RemoveMark {
            at: Position::new(vec![1], 0),
            len: 3,
            mark: Mark::new(MarkType::Underline),
        };
        assert!(apply(&doc, &missing).is_err());
    }

    #[test]
    fn test_apply_does_not_mutate_input() {
        let doc = sample();
        let before = doc.clone();
        let _ = apply(&doc, &Operation::insert_text(Position::new(vec![0], 0), "x"));
        let _ = apply(&doc, &Operation::insert_text(Position::root(0), "x"));
        assert_eq!(doc, before);
    }

    #[test]
    fn test_invert_all_restores_group() {
        let doc = sample();
        let ops = vec![
            Operation::insert_text(Position::new(vec![0], 5), "!"),
            Operation::insert_node(Position::root(0), DocumentNode::paragraph(vec![])),
            Operation::insert_text(Position::new(vec![0], 0), "intro"),
        ];
        let next = apply_all(&doc, &ops).unwrap();
        assert_eq!(next.children[0].plain_text(), "intro");
        let restored = apply_all(&next, &invert_all(&ops)).unwrap();
        assert_eq!(restored, doc);
    }

    #[test]
    fn test_operation_json_is_tagged() {
        let op = Operation::insert_text(Position::new(vec![1], 2), "x");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "insertText");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
