//! Changes: the replicated form of document edits.
//!
//! A [`Change`] is what travels between replicas. Unlike a model
//! [`Operation`](crate::model::Operation), which addresses content by
//! position, a change addresses content by stable item ids, so it can be
//! applied on any replica regardless of what else happened concurrently.

use crate::model::{AttrValue, Attrs, Mark, MarkType, NodeType};

use super::ids::{OpId, OrderKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Insert characters into textblock `parent`, right after item `after`
    /// (or at the start). Character `i` gets id `change.id + i`.
    InsertText {
        parent: OpId,
        after: Option<OpId>,
        text: String,
        marks: Vec<Mark>,
    },
    /// Insert an element into container `parent`. The node's id is the
    /// change id.
    InsertNode {
        parent: OpId,
        after: Option<OpId>,
        node_type: NodeType,
        attrs: Attrs,
    },
    /// Tombstone characters or nodes.
    Delete { targets: Vec<OpId> },
    /// Last-writer-wins write of one attribute. `None` removes it.
    SetAttr {
        node: OpId,
        key: String,
        value: Option<AttrValue>,
    },
    /// Last-writer-wins write of one mark type on each target character.
    /// `None` removes the mark.
    SetMark {
        targets: Vec<OpId>,
        mark_type: MarkType,
        mark: Option<Mark>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub id: OpId,
    pub lamport: u64,
    pub kind: ChangeKind,
}

impl Change {
    /// Number of sequence numbers this change consumes.
    pub fn span(&self) -> u64 {
        match &self.kind {
            ChangeKind::InsertText { text, .. } => (text.chars().count() as u64).max(1),
            _ => 1,
        }
    }

    /// Id of the last sequence number consumed.
    pub fn last_id(&self) -> OpId {
        self.id.offset(self.span() - 1)
    }

    pub fn order(&self) -> OrderKey {
        OrderKey::new(self.lamport, self.id.replica)
    }

    /// Items and nodes that must exist before this change can be applied.
    /// Delete and mark targets are handled separately: a missing target
    /// that was already collected is simply skipped.
    pub fn anchors(&self) -> Vec<OpId> {
        let mut deps = Vec::new();
        match &self.kind {
            ChangeKind::InsertText { parent, after, .. }
            | ChangeKind::InsertNode { parent, after, .. } => {
                deps.push(*parent);
                deps.extend(after);
            }
            ChangeKind::SetAttr { node, .. } => deps.push(*node),
            ChangeKind::Delete { .. } | ChangeKind::SetMark { .. } => {}
        }
        deps.retain(|id| *id != OpId::ROOT);
        deps
    }

    pub fn targets(&self) -> &[OpId] {
        match &self.kind {
            ChangeKind::Delete { targets } | ChangeKind::SetMark { targets, .. } => targets,
            _ => &[],
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ChangeKind::InsertText { .. } => "insert-text",
            ChangeKind::InsertNode { .. } => "insert-node",
            ChangeKind::Delete { .. } => "delete",
            ChangeKind::SetAttr { .. } => "set-attr",
            ChangeKind::SetMark { .. } => "set-mark",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ReplicaId;

    #[test]
    fn test_text_change_span() {
        let change = Change {
            id: OpId::new(ReplicaId(7), 10),
            lamport: 3,
            kind: ChangeKind::InsertText {
                parent: OpId::new(ReplicaId(7), 1),
                after: Some(OpId::new(ReplicaId(2), 4)),
                text: "héllo".into(),
                marks: vec![],
            },
        };
        assert_eq!(change.span(), 5);
        assert_eq!(change.last_id(), OpId::new(ReplicaId(7), 14));
        assert_eq!(
            change.anchors(),
            vec![OpId::new(ReplicaId(7), 1), OpId::new(ReplicaId(2), 4)]
        );
    }

    #[test]
    fn test_root_is_not_an_anchor() {
        let change = Change {
            id: OpId::new(ReplicaId(1), 1),
            lamport: 1,
            kind: ChangeKind::InsertNode {
                parent: OpId::ROOT,
                after: None,
                node_type: NodeType::Paragraph,
                attrs: Attrs::new(),
            },
        };
        assert!(change.anchors().is_empty());
        assert_eq!(change.span(), 1);
    }
}
