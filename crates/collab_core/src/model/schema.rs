//! Content and attribute rules per node type.

use super::node::{AttrValue, DocumentNode, Mark, MarkType, NodeType};
use crate::error::{CollabError, Result};

/// Value kind an attribute key accepts. `Null` is accepted for every kind
/// except heading levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    String,
    Integer,
    Boolean,
    HeadingLevel,
    Any,
}

impl AttrKind {
    fn accepts(self, value: &AttrValue) -> bool {
        match (self, value) {
            (AttrKind::HeadingLevel, AttrValue::Int(level)) => (1..=6).contains(level),
            (AttrKind::HeadingLevel, _) => false,
            (_, AttrValue::Null) => true,
            (AttrKind::Any, _) => true,
            (AttrKind::String, AttrValue::String(_)) => true,
            (AttrKind::Integer, AttrValue::Int(_)) => true,
            (AttrKind::Boolean, AttrValue::Bool(_)) => true,
            _ => false,
        }
    }
}

fn malformed(msg: impl Into<String>) -> CollabError {
    CollabError::MalformedOperation(msg.into())
}

fn is_block(t: NodeType) -> bool {
    matches!(
        t,
        NodeType::Paragraph
            | NodeType::Heading
            | NodeType::Blockquote
            | NodeType::List
            | NodeType::Table
            | NodeType::Image
            | NodeType::CodeBlock
            | NodeType::HorizontalRule
    )
}

impl NodeType {
    /// Whether `child` may appear directly inside a node of this type.
    pub fn allows_child(self, child: NodeType) -> bool {
        match self {
            NodeType::Doc | NodeType::Blockquote | NodeType::ListItem | NodeType::TableCell => {
                is_block(child)
            }
            NodeType::List => child == NodeType::ListItem,
            NodeType::Table => child == NodeType::TableRow,
            NodeType::TableRow => child == NodeType::TableCell,
            NodeType::Paragraph | NodeType::Heading => child.is_inline(),
            NodeType::CodeBlock => child == NodeType::Text,
            _ => false,
        }
    }

    /// Whether text inside this node may carry marks.
    pub fn allows_marks(self) -> bool {
        matches!(self, NodeType::Paragraph | NodeType::Heading)
    }

    /// The value kind of `key` on this node type, `None` if the key is not
    /// part of the schema.
    pub fn attr_kind(self, key: &str) -> Option<AttrKind> {
        let kind = match (self, key) {
            (NodeType::Paragraph | NodeType::Heading, "textAlign") => AttrKind::String,
            (
                NodeType::Paragraph | NodeType::Heading | NodeType::Blockquote | NodeType::Image,
                "class",
            ) => AttrKind::Any,
            (NodeType::Heading, "level") => AttrKind::HeadingLevel,
            (NodeType::List, "ordered") => AttrKind::Boolean,
            (NodeType::List, "start") => AttrKind::Integer,
            (NodeType::ListItem, "checked") => AttrKind::Boolean,
            (NodeType::TableCell, "colspan" | "rowspan") => AttrKind::Integer,
            (NodeType::TableCell, "colwidth") => AttrKind::Any,
            (NodeType::Image, "src" | "alt" | "title" | "align") => AttrKind::String,
            (NodeType::Image, "width") => AttrKind::Any,
            (NodeType::CodeBlock, "language") => AttrKind::String,
            (NodeType::CustomInline, "name" | "kind") => AttrKind::String,
            _ => return None,
        };
        Some(kind)
    }
}

impl MarkType {
    /// The value kind of `key` on this mark type.
    pub fn attr_kind(self, key: &str) -> Option<AttrKind> {
        let kind = match (self, key) {
            (MarkType::Link, "href" | "target" | "rel") => AttrKind::String,
            (MarkType::Link, "class") => AttrKind::Any,
            (MarkType::TextStyle, "color" | "fontFamily" | "fontSize") => AttrKind::String,
            (MarkType::Highlight, "color") => AttrKind::String,
            _ => return None,
        };
        Some(kind)
    }
}

/// Check a single attribute against the schema of `node_type`.
pub fn validate_attr(node_type: NodeType, key: &str, value: &AttrValue) -> Result<()> {
    let kind = node_type
        .attr_kind(key)
        .ok_or_else(|| malformed(format!("{:?} has no attribute '{}'", node_type, key)))?;
    if !kind.accepts(value) {
        return Err(malformed(format!(
            "invalid value {:?} for {:?}.{}",
            value, node_type, key
        )));
    }
    Ok(())
}

/// Check a mark's attributes.
pub fn validate_mark(mark: &Mark) -> Result<()> {
    for (key, value) in &mark.attrs {
        let kind = mark.mark_type.attr_kind(key).ok_or_else(|| {
            malformed(format!("{:?} mark has no attribute '{}'", mark.mark_type, key))
        })?;
        if !kind.accepts(value) {
            return Err(malformed(format!(
                "invalid value {:?} for {:?} mark attribute {}",
                value, mark.mark_type, key
            )));
        }
    }
    if mark.mark_type == MarkType::Link
        && !matches!(mark.attrs.get("href"), Some(AttrValue::String(_)))
    {
        return Err(malformed("link mark requires an href"));
    }
    Ok(())
}

/// Check a set of marks placed on text inside a container.
pub fn validate_marks(container: NodeType, marks: &[Mark]) -> Result<()> {
    if marks.is_empty() {
        return Ok(());
    }
    if !container.allows_marks() {
        return Err(malformed(format!("{:?} does not allow marks", container)));
    }
    for (i, mark) in marks.iter().enumerate() {
        validate_mark(mark)?;
        if marks[..i].iter().any(|m| m.mark_type == mark.mark_type) {
            return Err(malformed(format!(
                "duplicate {:?} mark on the same text",
                mark.mark_type
            )));
        }
    }
    Ok(())
}

/// Recursively check a node against the schema.
pub fn validate_node(node: &DocumentNode) -> Result<()> {
    if node.node_type == NodeType::Text {
        return match node.text.as_deref() {
            Some("") | None => Err(malformed("text node without text")),
            Some(_) if !node.children.is_empty() => Err(malformed("text node with children")),
            Some(_) if !node.attrs.is_empty() => Err(malformed("text node with attributes")),
            Some(_) => Ok(()),
        };
    }
    if node.text.is_some() {
        return Err(malformed(format!("{:?} node carries text", node.node_type)));
    }
    if !node.marks.is_empty() {
        return Err(malformed(format!("{:?} node carries marks", node.node_type)));
    }
    for (key, value) in &node.attrs {
        validate_attr(node.node_type, key, value)?;
    }
    if node.node_type.is_atom() && !node.children.is_empty() {
        return Err(malformed(format!("{:?} cannot have content", node.node_type)));
    }
    for child in &node.children {
        if !node.node_type.allows_child(child.node_type) {
            return Err(malformed(format!(
                "{:?} cannot contain {:?}",
                node.node_type, child.node_type
            )));
        }
        if child.is_text() {
            validate_marks(node.node_type, &child.marks)?;
        }
        validate_node(child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_rules() {
        assert!(NodeType::Doc.allows_child(NodeType::Paragraph));
        assert!(NodeType::Doc.allows_child(NodeType::Table));
        assert!(!NodeType::Doc.allows_child(NodeType::Text));
        assert!(!NodeType::Doc.allows_child(NodeType::TableRow));
        assert!(NodeType::Table.allows_child(NodeType::TableRow));
        assert!(!NodeType::Table.allows_child(NodeType::TableCell));
        assert!(NodeType::Paragraph.allows_child(NodeType::CustomInline));
        assert!(!NodeType::CodeBlock.allows_child(NodeType::CustomInline));
        assert!(!NodeType::Image.allows_child(NodeType::Paragraph));
    }

    #[test]
    fn test_heading_level_range() {
        assert!(validate_attr(NodeType::Heading, "level", &AttrValue::Int(3)).is_ok());
        assert!(validate_attr(NodeType::Heading, "level", &AttrValue::Int(7)).is_err());
        assert!(validate_attr(NodeType::Heading, "level", &AttrValue::Null).is_err());
        assert!(validate_attr(NodeType::Paragraph, "level", &AttrValue::Int(1)).is_err());
    }

    #[test]
    fn test_validate_node_rejects_bad_trees() {
        let ok = DocumentNode::doc(vec![DocumentNode::table(vec![DocumentNode::table_row(
            vec![DocumentNode::table_cell(vec![DocumentNode::paragraph(vec![
                DocumentNode::text("cell"),
            ])])],
        )])]);
        assert!(validate_node(&ok).is_ok());

        let orphan_cell = DocumentNode::doc(vec![DocumentNode::table(vec![
            DocumentNode::table_cell(vec![]),
        ])]);
        assert!(validate_node(&orphan_cell).is_err());

        let mut text_with_children = DocumentNode::text("x");
        text_with_children.children.push(DocumentNode::text("y"));
        assert!(validate_node(&DocumentNode::paragraph(vec![text_with_children])).is_err());

        let mut block_with_text = DocumentNode::paragraph(vec![]);
        block_with_text.text = Some("oops".into());
        assert!(validate_node(&block_with_text).is_err());
    }

    #[test]
    fn test_marks_rules() {
        let code = DocumentNode::code_block(Some("rust"), "fn main() {}");
        assert!(validate_node(&code).is_ok());

        let mut marked_code = DocumentNode::new(NodeType::CodeBlock);
        marked_code
            .children
            .push(DocumentNode::marked_text("x", vec![Mark::bold()]));
        assert!(validate_node(&marked_code).is_err());

        assert!(validate_marks(NodeType::Paragraph, &[Mark::bold(), Mark::bold()]).is_err());
        assert!(validate_mark(&Mark::new(MarkType::Link)).is_err());
        assert!(validate_mark(&Mark::link("https://example.com")).is_ok());
        assert!(validate_mark(&Mark::bold().with_attr("href", "x")).is_err());
    }
}
