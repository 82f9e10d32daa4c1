//! Undo/redo stacks of local operation groups.
//!
//! A group is the list of operations produced by one user action. Undo
//! applies the inverse group as a new local edit, so undo itself is ordinary
//! forward history for every other replica.

use super::operation::{Operation, invert_all};

/// Default number of groups kept on the undo stack.
pub const DEFAULT_UNDO_DEPTH: usize = 100;

#[derive(Debug, Clone)]
pub struct UndoManager {
    undo: Vec<Vec<Operation>>,
    redo: Vec<Vec<Operation>>,
    depth: usize,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_DEPTH)
    }
}

impl UndoManager {
    pub fn new(depth: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            depth: depth.max(1),
        }
    }

    /// Record a freshly applied local group. Clears the redo stack.
    pub fn record(&mut self, group: Vec<Operation>) {
        if group.is_empty() {
            return;
        }
        self.redo.clear();
        self.push_undo(group);
    }

    fn push_undo(&mut self, group: Vec<Operation>) {
        self.undo.push(group);
        if self.undo.len() > self.depth {
            self.undo.remove(0);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Operations that undo the most recent group, without popping it.
    pub fn peek_undo(&self) -> Option<Vec<Operation>> {
        self.undo.last().map(|group| invert_all(group))
    }

    /// Operations that redo the most recently undone group.
    pub fn peek_redo(&self) -> Option<Vec<Operation>> {
        self.redo.last().cloned()
    }

    /// The inverse of the last group was applied: move it to the redo stack.
    pub fn commit_undo(&mut self) {
        if let Some(group) = self.undo.pop() {
            self.redo.push(group);
        }
    }

    /// The last undone group was re-applied: move it back.
    pub fn commit_redo(&mut self) {
        if let Some(group) = self.redo.pop() {
            self.push_undo(group);
        }
    }

    /// Forget everything, e.g. after an inverse no longer applies because
    /// concurrent edits moved the content it refers to.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
