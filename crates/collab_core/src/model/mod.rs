//! Structured document model.
//!
//! A document is a tree of typed [`DocumentNode`]s. Edits are expressed as
//! [`Operation`]s that are validated against a per-type [`schema`], applied
//! purely, and inverted exactly.

mod diff;
mod node;
mod operation;
pub mod schema;
mod undo;

pub use diff::diff;
pub(crate) use node::{Unit, nodes_from_units, slice_units, units_of};
pub use node::{AttrValue, Attrs, DocumentNode, Mark, MarkType, NodeType, sort_marks};
pub use operation::{
    AttrChange, Operation, Position, apply, apply_all, invert, invert_all, node_at, slice,
};
pub use schema::{AttrKind, validate_node};
pub use undo::{DEFAULT_UNDO_DEPTH, UndoManager};
