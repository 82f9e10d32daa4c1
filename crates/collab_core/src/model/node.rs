//! Document tree types.
//!
//! The JSON shape follows the ProseMirror convention used by web editors:
//! `{"type", "attrs", "content", "marks", "text"}`, so documents can be
//! exchanged with a browser front end without translation.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, de};
use ts_rs::TS;

/// Kind of a node in the document tree.
///
/// Deserialization also accepts the editor names `bulletList` and
/// `orderedList` for [`NodeType::List`] and `emoji` for
/// [`NodeType::CustomInline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum NodeType {
    Doc,
    Paragraph,
    Heading,
    Blockquote,
    List,
    ListItem,
    Table,
    TableRow,
    TableCell,
    Image,
    CodeBlock,
    HorizontalRule,
    CustomInline,
    Text,
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        NodeType::from_name(&name)
            .ok_or_else(|| de::Error::unknown_variant(&name, &NodeType::NAMES))
    }
}

impl NodeType {
    const ALL: [NodeType; 14] = [
        NodeType::Doc,
        NodeType::Paragraph,
        NodeType::Heading,
        NodeType::Blockquote,
        NodeType::List,
        NodeType::ListItem,
        NodeType::Table,
        NodeType::TableRow,
        NodeType::TableCell,
        NodeType::Image,
        NodeType::CodeBlock,
        NodeType::HorizontalRule,
        NodeType::CustomInline,
        NodeType::Text,
    ];

    const NAMES: [&'static str; 14] = [
        "doc",
        "paragraph",
        "heading",
        "blockquote",
        "list",
        "listItem",
        "table",
        "tableRow",
        "tableCell",
        "image",
        "codeBlock",
        "horizontalRule",
        "customInline",
        "text",
    ];

    /// Parse a JSON type name, including editor aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bulletList" | "orderedList" => Some(NodeType::List),
            "emoji" => Some(NodeType::CustomInline),
            _ => Self::NAMES
                .iter()
                .position(|n| *n == name)
                .and_then(|i| Self::ALL.get(i).copied()),
        }
    }

    /// Stable numeric tag used by the binary codec.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Inverse of [`NodeType::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Nodes whose content is inline (characters and inline atoms).
    pub fn is_textblock(self) -> bool {
        matches!(
            self,
            NodeType::Paragraph | NodeType::Heading | NodeType::CodeBlock
        )
    }

    /// Nodes that never have content.
    pub fn is_atom(self) -> bool {
        matches!(
            self,
            NodeType::Image | NodeType::HorizontalRule | NodeType::CustomInline
        )
    }

    /// Nodes that live inside textblocks.
    pub fn is_inline(self) -> bool {
        matches!(self, NodeType::Text | NodeType::CustomInline)
    }
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(untagged)]
#[ts(export, export_to = "bindings/")]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// Attribute map of a node or mark. Ordered so equal maps compare equal.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Kind of an inline formatting mark.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum MarkType {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
    Link,
    TextStyle,
    Highlight,
    Subscript,
    Superscript,
}

impl MarkType {
    const ALL: [MarkType; 10] = [
        MarkType::Bold,
        MarkType::Italic,
        MarkType::Underline,
        MarkType::Strike,
        MarkType::Code,
        MarkType::Link,
        MarkType::TextStyle,
        MarkType::Highlight,
        MarkType::Subscript,
        MarkType::Superscript,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

/// An inline formatting tag with its own attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Mark {
    #[serde(rename = "type")]
    pub mark_type: MarkType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[ts(type = "Record<string, AttrValue>")]
    pub attrs: Attrs,
}

impl Mark {
    /// A mark without attributes.
    pub fn new(mark_type: MarkType) -> Self {
        Self {
            mark_type,
            attrs: Attrs::new(),
        }
    }

    pub fn bold() -> Self {
        Self::new(MarkType::Bold)
    }

    pub fn italic() -> Self {
        Self::new(MarkType::Italic)
    }

    /// A link mark opening in a new tab.
    pub fn link(href: &str) -> Self {
        Self::new(MarkType::Link)
            .with_attr("href", href)
            .with_attr("target", "_blank")
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }
}

/// Sort marks by type. Callers guarantee at most one mark per type.
pub fn sort_marks(marks: &mut [Mark]) {
    marks.sort_by_key(|m| m.mark_type);
}

/// A node in the structured document tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DocumentNode {
    #[serde(rename = "type")]
    pub node_type: NodeType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[ts(type = "Record<string, AttrValue>")]
    pub attrs: Attrs,

    /// Only present on text nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,

    #[serde(rename = "content", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocumentNode>,

    /// Only present on text nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub text: Option<String>,
}

impl DocumentNode {
    /// An element node with no attributes and no children.
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            attrs: Attrs::new(),
            marks: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn with_children(node_type: NodeType, children: Vec<DocumentNode>) -> Self {
        Self {
            children,
            ..Self::new(node_type)
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    /// Empty document.
    pub fn empty_doc() -> Self {
        Self::new(NodeType::Doc)
    }

    pub fn doc(children: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::Doc, children)
    }

    pub fn paragraph(children: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::Paragraph, children)
    }

    pub fn heading(level: i64, children: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::Heading, children).with_attr("level", level)
    }

    pub fn blockquote(children: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::Blockquote, children)
    }

    pub fn list(ordered: bool, items: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::List, items).with_attr("ordered", ordered)
    }

    pub fn list_item(children: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::ListItem, children)
    }

    pub fn table(rows: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::Table, rows)
    }

    pub fn table_row(cells: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::TableRow, cells)
    }

    pub fn table_cell(children: Vec<DocumentNode>) -> Self {
        Self::with_children(NodeType::TableCell, children)
    }

    pub fn image(src: &str) -> Self {
        Self::new(NodeType::Image).with_attr("src", src)
    }

    pub fn code_block(language: Option<&str>, code: &str) -> Self {
        let mut node = Self::new(NodeType::CodeBlock);
        if let Some(language) = language {
            node = node.with_attr("language", language);
        }
        if !code.is_empty() {
            node.children.push(Self::text(code));
        }
        node
    }

    pub fn custom_inline(name: &str) -> Self {
        Self::new(NodeType::CustomInline).with_attr("name", name)
    }

    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::new(NodeType::Text)
        }
    }

    pub fn marked_text(text: &str, mut marks: Vec<Mark>) -> Self {
        sort_marks(&mut marks);
        Self {
            marks,
            ..Self::text(text)
        }
    }

    pub fn is_text(&self) -> bool {
        self.node_type == NodeType::Text
    }

    /// Number of content units: characters and inline atoms for textblocks,
    /// child nodes for every other container.
    pub fn content_len(&self) -> usize {
        if self.node_type.is_textblock() {
            self.children
                .iter()
                .map(|child| match &child.text {
                    Some(text) => text.chars().count(),
                    None => 1,
                })
                .sum()
        } else {
            self.children.len()
        }
    }

    /// Concatenated text of the subtree, blocks separated by newlines.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
            return;
        }
        if self.node_type.is_textblock() {
            for child in &self.children {
                child.collect_text(out);
            }
            return;
        }
        for child in &self.children {
            let before = out.len();
            child.collect_text(out);
            if out.len() > before && !child.node_type.is_inline() && !out.ends_with('\n') {
                out.push('\n');
            }
        }
    }

    /// A document with no content at all, or a single empty paragraph.
    pub fn is_blank(&self) -> bool {
        match self.children.as_slice() {
            [] => true,
            [only] => only.node_type == NodeType::Paragraph && only.children.is_empty(),
            _ => false,
        }
    }

    /// Canonical form: marks sorted, empty text dropped, adjacent text
    /// nodes with equal marks merged.
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    pub fn normalize(&mut self) {
        sort_marks(&mut self.marks);
        for child in &mut self.children {
            child.normalize();
        }
        if !self.node_type.is_textblock() {
            return;
        }
        let mut merged: Vec<DocumentNode> = Vec::with_capacity(self.children.len());
        for child in self.children.drain(..) {
            if child.is_text() && child.text.as_deref().is_none_or(str::is_empty) {
                continue;
            }
            if let Some(last) = merged.last_mut()
                && last.is_text()
                && child.is_text()
                && last.marks == child.marks
            {
                if let (Some(text), Some(more)) = (last.text.as_mut(), child.text.as_deref()) {
                    text.push_str(more);
                }
                continue;
            }
            merged.push(child);
        }
        self.children = merged;
    }
}

/// One content unit of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Unit {
    Char(char, Vec<Mark>),
    Node(DocumentNode),
}

/// Flatten the content of a container into units.
pub(crate) fn units_of(container: &DocumentNode) -> Vec<Unit> {
    slice_units(container.node_type, &container.children)
}

/// Flatten a slice of nodes into the units they occupy inside a container
/// of the given type.
pub(crate) fn slice_units(container: NodeType, nodes: &[DocumentNode]) -> Vec<Unit> {
    let mut units = Vec::new();
    for node in nodes {
        match (&node.text, container.is_textblock()) {
            (Some(text), true) => {
                let mut marks = node.marks.clone();
                sort_marks(&mut marks);
                units.extend(text.chars().map(|c| Unit::Char(c, marks.clone())));
            }
            _ => units.push(Unit::Node(node.clone())),
        }
    }
    units
}

/// Rebuild canonical child nodes from units.
pub(crate) fn nodes_from_units(units: &[Unit]) -> Vec<DocumentNode> {
    let mut nodes: Vec<DocumentNode> = Vec::new();
    for unit in units {
        match unit {
            Unit::Char(c, marks) => {
                if let Some(last) = nodes.last_mut()
                    && last.is_text()
                    && &last.marks == marks
                    && let Some(text) = last.text.as_mut()
                {
                    text.push(*c);
                    continue;
                }
                nodes.push(DocumentNode::marked_text(&c.to_string(), marks.clone()));
            }
            Unit::Node(node) => nodes.push(node.clone()),
        }
    }
    nodes
}
