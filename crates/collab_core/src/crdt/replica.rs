//! The replicated document: an RGA-style sequence CRDT per container.
//!
//! Every container node keeps its content as an ordered list of items. An
//! item is a character (in textblocks) or a child node, identified by the
//! [`OpId`] of the change that inserted it. Insertions reference the item
//! they follow instead of a numeric offset; concurrent insertions after the
//! same item are ordered by descending [`OrderKey`], so the insert with the
//! greater `(lamport, replica)` sits closer to the anchor. Deleted items stay
//! in place as tombstones until [`ReplicaState::collect_garbage`] removes
//! them. Attributes and marks are last-writer-wins registers.
//!
//! Garbage collection is caller-driven: neither the sync session nor the
//! service calls it, since it is only safe with a state vector that every
//! peer, offline ones included, has reached. Without it tombstones stay.
//!
//! Remote changes may arrive duplicated or out of order. Changes whose
//! dependencies are missing wait in a pending queue of at most
//! [`MAX_PENDING`] entries; changes that were already applied are ignored.
//! A change that depends on an item that was already garbage collected
//! cannot be placed: it is consumed, logged and reported as a warning,
//! never applied. A change whose clocks would overflow is discarded without
//! being consumed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};
use crate::model::schema::{validate_attr, validate_mark, validate_marks};
use crate::model::{
    AttrValue, DocumentNode, Mark, MarkType, NodeType, Operation, Position, Unit, apply_all,
    nodes_from_units, slice_units, sort_marks,
};

use super::change::{Change, ChangeKind};
use super::codec::{decode_changes, encode_changes};
use super::ids::{OpId, OrderKey, ReplicaId, StateVector};
use super::types::{ReplicaEvent, UpdateOrigin};

/// Last-writer-wins register.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Register<T> {
    order: OrderKey,
    value: T,
}

impl<T> Register<T> {
    /// Keep `value` if it was written after the current one.
    fn write(&mut self, order: OrderKey, value: T) {
        if order > self.order {
            self.order = order;
            self.value = value;
        }
    }
}

#[derive(Debug, Clone)]
enum ItemContent {
    Char {
        ch: char,
        marks: BTreeMap<MarkType, Register<Option<Mark>>>,
    },
    /// A child node, stored in `ReplicaState::nodes` under the item id.
    Node,
}

#[derive(Debug, Clone)]
struct Item {
    id: OpId,
    order: OrderKey,
    content: ItemContent,
    /// Id of the change that deleted this item.
    deleted: Option<OpId>,
}

impl Item {
    fn is_visible(&self) -> bool {
        self.deleted.is_none()
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node_type: NodeType,
    attrs: BTreeMap<String, Register<Option<AttrValue>>>,
    parent: OpId,
    children: Vec<Item>,
}

impl NodeEntry {
    fn new(node_type: NodeType, parent: OpId) -> Self {
        Self {
            node_type,
            attrs: BTreeMap::new(),
            parent,
            children: Vec::new(),
        }
    }

    fn index_of(&self, id: OpId) -> Option<usize> {
        self.children.iter().position(|item| item.id == id)
    }

    fn visible(&self) -> impl Iterator<Item = &Item> {
        self.children.iter().filter(|item| item.is_visible())
    }
}

/// Outcome of merging a batch of remote changes.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Changes newly added to the log, in integration order. Includes the
    /// changes that were consumed but dropped.
    pub integrated: Vec<Change>,
    /// Number of changes that had already been applied.
    pub duplicates: usize,
    /// Why each dropped change could not be applied.
    pub warnings: Vec<CollabError>,
    /// Changes still waiting for missing dependencies.
    pub pending: usize,
    /// Changes refused without being consumed: their clocks overflow, or
    /// they did not fit in the pending queue. Their ids stay free, so a
    /// later resend can still be applied.
    pub discarded: Vec<CollabError>,
}

impl MergeReport {
    /// Whether the visible document may have changed.
    pub fn changed(&self) -> bool {
        self.integrated.len() > self.warnings.len()
    }
}

/// A position anchored on item ids, stable under concurrent edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativePosition {
    /// The container node
    pub container: OpId,
    /// The item immediately before the position, `None` at the start
    pub left: Option<OpId>,
}

enum Integration {
    Applied,
    Duplicate,
    Deferred(Change),
    Rejected(CollabError),
    Discarded(CollabError),
}

/// Most changes a replica keeps waiting for missing dependencies.
pub const MAX_PENDING: usize = 4096;

/// Replicated state of one document.
#[derive(Clone)]
pub struct ReplicaState {
    replica: ReplicaId,
    lamport: u64,
    version: StateVector,
    nodes: HashMap<OpId, NodeEntry>,
    /// Item id -> id of the container holding it.
    locations: HashMap<OpId, OpId>,
    pending: Vec<Change>,
    log: Vec<Change>,
    event_callback: Option<Arc<dyn Fn(&ReplicaEvent) + Send + Sync>>,
}

impl fmt::Debug for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaState")
            .field("replica", &self.replica)
            .field("lamport", &self.lamport)
            .field("version", &self.version)
            .field("pending", &self.pending.len())
            .field("log", &self.log.len())
            .finish()
    }
}

impl ReplicaState {
    /// An empty document owned by `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(OpId::ROOT, NodeEntry::new(NodeType::Doc, OpId::ROOT));
        Self {
            replica,
            lamport: 0,
            version: StateVector::new(),
            nodes,
            locations: HashMap::new(),
            pending: Vec::new(),
            log: Vec::new(),
            event_callback: None,
        }
    }

    /// Rebuild a replica from an encoded full state.
    pub fn from_state(replica: ReplicaId, state: &[u8]) -> Result<Self> {
        let mut this = Self::new(replica);
        let changes = decode_changes(state)?;
        let report = this.merge(changes);
        if report.pending > 0 {
            log::warn!(
                "[Replica] state for {} left {} changes without their dependencies",
                replica,
                report.pending
            );
        }
        Ok(this)
    }

    /// Set the callback invoked after the document changed.
    pub fn set_event_callback(&mut self, callback: Arc<dyn Fn(&ReplicaEvent) + Send + Sync>) {
        self.event_callback = Some(callback);
    }

    fn emit_event(&self, event: ReplicaEvent) {
        if let Some(ref cb) = self.event_callback {
            cb(&event);
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.version
    }

    /// Number of changes in the log.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no change was ever applied.
    pub fn is_pristine(&self) -> bool {
        self.version.is_empty() && self.pending.is_empty()
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Materialize the visible document tree.
    pub fn document(&self) -> DocumentNode {
        self.build_node(OpId::ROOT)
    }

    fn build_node(&self, id: OpId) -> DocumentNode {
        let Some(entry) = self.nodes.get(&id) else {
            return DocumentNode::empty_doc();
        };
        let mut node = DocumentNode::new(entry.node_type);
        for (key, register) in &entry.attrs {
            if let Some(value) = &register.value {
                node.attrs.insert(key.clone(), value.clone());
            }
        }
        if entry.node_type.is_textblock() {
            let units: Vec<Unit> = entry
                .visible()
                .map(|item| match &item.content {
                    ItemContent::Char { ch, marks } => {
                        let mut marks: Vec<Mark> =
                            marks.values().filter_map(|r| r.value.clone()).collect();
                        sort_marks(&mut marks);
                        Unit::Char(*ch, marks)
                    }
                    ItemContent::Node => Unit::Node(self.build_node(item.id)),
                })
                .collect();
            node.children = nodes_from_units(&units);
        } else {
            node.children = entry
                .visible()
                .filter(|item| matches!(item.content, ItemContent::Node))
                .map(|item| self.build_node(item.id))
                .collect();
        }
        node
    }

    /// Id of the node addressed by `path`.
    fn node_id(&self, path: &[usize]) -> Result<OpId> {
        let mut id = OpId::ROOT;
        for (depth, &unit) in path.iter().enumerate() {
            let entry = self.entry(id)?;
            let item = entry.visible().nth(unit).ok_or_else(|| {
                CollabError::MalformedOperation(format!(
                    "path {:?} does not exist at depth {}",
                    path, depth
                ))
            })?;
            if !matches!(item.content, ItemContent::Node) {
                return Err(CollabError::MalformedOperation(format!(
                    "path {:?} addresses a character",
                    path
                )));
            }
            id = item.id;
        }
        Ok(id)
    }

    fn entry(&self, id: OpId) -> Result<&NodeEntry> {
        self.nodes.get(&id).ok_or(CollabError::UnknownAnchor(id))
    }

    /// Ids of `len` visible items starting at `offset`.
    fn visible_ids(&self, container: OpId, offset: usize, len: usize) -> Result<Vec<OpId>> {
        let ids: Vec<OpId> = self
            .entry(container)?
            .visible()
            .skip(offset)
            .take(len)
            .map(|item| item.id)
            .collect();
        if ids.len() != len {
            return Err(CollabError::MalformedOperation(format!(
                "range {}+{} out of bounds",
                offset, len
            )));
        }
        Ok(ids)
    }

    /// The visible item right before `offset`.
    fn anchor_before(&self, container: OpId, offset: usize) -> Result<Option<OpId>> {
        if offset == 0 {
            return Ok(None);
        }
        Ok(self.visible_ids(container, offset - 1, 1)?.first().copied())
    }

    /// Anchor a position on item ids.
    pub fn relative_position(&self, pos: &Position) -> Result<RelativePosition> {
        let container = self.node_id(&pos.path)?;
        let left = self.anchor_before(container, pos.offset)?;
        Ok(RelativePosition { container, left })
    }

    /// Resolve an anchored position against the current document. Returns
    /// `None` if its container is no longer visible.
    pub fn resolve_relative(&self, rel: &RelativePosition) -> Option<Position> {
        let path = self.path_of(rel.container)?;
        let entry = self.nodes.get(&rel.container)?;
        let offset = match rel.left {
            None => 0,
            Some(left) => match entry.index_of(left) {
                Some(index) => entry.children[..=index]
                    .iter()
                    .filter(|item| item.is_visible())
                    .count(),
                None => 0,
            },
        };
        Some(Position::new(path, offset))
    }

    /// Unit path of a visible node.
    pub fn path_of(&self, id: OpId) -> Option<Vec<usize>> {
        let mut path = Vec::new();
        let mut current = id;
        while current != OpId::ROOT {
            let parent = self.nodes.get(&current)?.parent;
            let siblings = &self.nodes.get(&parent)?.children;
            let index = siblings.iter().position(|item| item.id == current)?;
            if !siblings[index].is_visible() {
                return None;
            }
            path.push(siblings[..index].iter().filter(|i| i.is_visible()).count());
            current = parent;
        }
        path.reverse();
        Some(path)
    }

    // ------------------------------------------------------------------
    // Local edits
    // ------------------------------------------------------------------

    /// Apply a batch of local operations.
    ///
    /// The batch is validated against the current document first; a
    /// malformed operation fails the whole batch and leaves the replica
    /// untouched. Returns the changes to broadcast.
    pub fn apply_local(&mut self, ops: &[Operation]) -> Result<Vec<Change>> {
        apply_all(&self.document(), ops)?;

        let mut out = Vec::new();
        for op in ops {
            self.translate(op, &mut out)?;
        }
        if !out.is_empty() {
            log::debug!(
                "[Replica] {} applied {} local changes from {} operations",
                self.replica,
                out.len(),
                ops.len()
            );
            self.emit_event(ReplicaEvent::Changed {
                origin: UpdateOrigin::Local,
                count: out.len(),
            });
        }
        Ok(out)
    }

    fn local_change(&mut self, kind: ChangeKind, out: &mut Vec<Change>) -> Result<OpId> {
        let replica = self.replica;
        let exhausted =
            || CollabError::MalformedOperation(format!("clock of {} exhausted", replica));
        let seq = self
            .version
            .get(replica)
            .checked_add(1)
            .ok_or_else(exhausted)?;
        let lamport = self.lamport.checked_add(1).ok_or_else(exhausted)?;
        let change = Change {
            id: OpId::new(replica, seq),
            lamport,
            kind,
        };
        let last = change.last_id();
        match self.integrate(change.clone()) {
            Integration::Applied => {
                out.push(change);
                Ok(last)
            }
            Integration::Rejected(err) | Integration::Discarded(err) => Err(err),
            Integration::Duplicate | Integration::Deferred(_) => Err(
                CollabError::MalformedOperation(format!("local change {} not applicable", change.id)),
            ),
        }
    }

    fn translate(&mut self, op: &Operation, out: &mut Vec<Change>) -> Result<()> {
        match op {
            Operation::InsertText { at, text, marks } => {
                let parent = self.node_id(&at.path)?;
                let after = self.anchor_before(parent, at.offset)?;
                let mut marks = marks.clone();
                sort_marks(&mut marks);
                self.local_change(
                    ChangeKind::InsertText {
                        parent,
                        after,
                        text: text.clone(),
                        marks,
                    },
                    out,
                )?;
            }
            Operation::InsertNodes { at, nodes } => {
                let parent = self.node_id(&at.path)?;
                let mut after = self.anchor_before(parent, at.offset)?;
                for node in nodes {
                    let node = node.clone().normalized();
                    if let Some(last) = self.insert_subtree(parent, after, &node, out)? {
                        after = Some(last);
                    }
                }
            }
            Operation::DeleteRange { at, deleted } => {
                let container = self.node_id(&at.path)?;
                let node_type = self.entry(container)?.node_type;
                let normalized: Vec<DocumentNode> =
                    deleted.iter().cloned().map(DocumentNode::normalized).collect();
                let len = slice_units(node_type, &normalized).len();
                let targets = self.visible_ids(container, at.offset, len)?;
                self.local_change(ChangeKind::Delete { targets }, out)?;
            }
            Operation::SetAttrs { path, changes } => {
                let node = self.node_id(path)?;
                for change in changes {
                    self.local_change(
                        ChangeKind::SetAttr {
                            node,
                            key: change.key.clone(),
                            value: change.after.clone(),
                        },
                        out,
                    )?;
                }
            }
            Operation::AddMark { at, len, mark } | Operation::RemoveMark { at, len, mark } => {
                let container = self.node_id(&at.path)?;
                let ids = self.visible_ids(container, at.offset, *len)?;
                let entry = self.entry(container)?;
                let targets: Vec<OpId> = ids
                    .into_iter()
                    .filter(|id| {
                        entry.index_of(*id).is_some_and(|i| {
                            matches!(entry.children[i].content, ItemContent::Char { .. })
                        })
                    })
                    .collect();
                if targets.is_empty() {
                    return Ok(());
                }
                let value = matches!(op, Operation::AddMark { .. }).then(|| mark.clone());
                self.local_change(
                    ChangeKind::SetMark {
                        targets,
                        mark_type: mark.mark_type,
                        mark: value,
                    },
                    out,
                )?;
            }
        }
        Ok(())
    }

    /// Emit the changes that create `node` (and its content) after `after`
    /// in `parent`. Returns the id of the last item placed in `parent`.
    fn insert_subtree(
        &mut self,
        parent: OpId,
        after: Option<OpId>,
        node: &DocumentNode,
        out: &mut Vec<Change>,
    ) -> Result<Option<OpId>> {
        if let Some(text) = &node.text {
            if text.is_empty() {
                return Ok(after);
            }
            let last = self.local_change(
                ChangeKind::InsertText {
                    parent,
                    after,
                    text: text.clone(),
                    marks: node.marks.clone(),
                },
                out,
            )?;
            return Ok(Some(last));
        }
        let id = self.local_change(
            ChangeKind::InsertNode {
                parent,
                after,
                node_type: node.node_type,
                attrs: node.attrs.clone(),
            },
            out,
        )?;
        let mut child_after = None;
        for child in &node.children {
            if let Some(last) = self.insert_subtree(id, child_after, child, out)? {
                child_after = Some(last);
            }
        }
        Ok(Some(id))
    }

    // ------------------------------------------------------------------
    // Remote changes
    // ------------------------------------------------------------------

    /// Merge remote changes in any order. Never fails: problems are
    /// reported in the returned [`MergeReport`].
    pub fn apply_remote(&mut self, changes: Vec<Change>) -> MergeReport {
        let report = self.merge(changes);
        if report.changed() {
            self.emit_event(ReplicaEvent::Changed {
                origin: UpdateOrigin::Remote,
                count: report.integrated.len() - report.warnings.len(),
            });
        }
        report
    }

    /// Decode and merge an encoded change batch.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<MergeReport> {
        let changes = decode_changes(update)?;
        Ok(self.apply_remote(changes))
    }

    fn merge(&mut self, changes: Vec<Change>) -> MergeReport {
        let mut report = MergeReport::default();
        self.pending.extend(changes);
        loop {
            let mut progressed = false;
            for change in std::mem::take(&mut self.pending) {
                let logged = change.clone();
                match self.integrate(change) {
                    Integration::Applied => {
                        report.integrated.push(logged);
                        progressed = true;
                    }
                    Integration::Duplicate => report.duplicates += 1,
                    Integration::Deferred(change) => self.pending.push(change),
                    Integration::Rejected(err) => {
                        log::warn!("[Replica] dropped change {}: {}", logged.id, err);
                        self.emit_event(ReplicaEvent::Dropped {
                            id: logged.id,
                            reason: err.to_string(),
                        });
                        report.integrated.push(logged);
                        report.warnings.push(err);
                        progressed = true;
                    }
                    Integration::Discarded(err) => {
                        log::warn!("[Replica] discarded change {}: {}", logged.id, err);
                        report.discarded.push(err);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        self.trim_pending(&mut report);
        report.pending = self.pending.len();
        if report.pending > 0 {
            log::debug!(
                "[Replica] {} changes waiting for dependencies",
                report.pending
            );
        }
        report
    }

    /// Keep at most [`MAX_PENDING`] waiting changes, preferring those
    /// closest to being applicable.
    fn trim_pending(&mut self, report: &mut MergeReport) {
        if self.pending.len() <= MAX_PENDING {
            return;
        }
        let version = &self.version;
        self.pending
            .sort_by_key(|c| c.id.seq.saturating_sub(version.get(c.id.replica)));
        let overflow = self.pending.len() - MAX_PENDING;
        for change in self.pending.drain(MAX_PENDING..) {
            report.discarded.push(CollabError::MalformedOperation(format!(
                "change {} waited too long for its dependencies",
                change.id
            )));
        }
        log::warn!("[Replica] pending queue full, discarded {} changes", overflow);
    }

    /// Whether `id` was applied at some point. Covered ids missing from the
    /// item index were garbage collected.
    fn exists(&self, id: OpId) -> bool {
        self.nodes.contains_key(&id) || self.locations.contains_key(&id)
    }

    fn integrate(&mut self, change: Change) -> Integration {
        let current = self.version.get(change.id.replica);
        if change.id.seq <= current {
            return Integration::Duplicate;
        }
        let span = change.span();
        if change.id.seq.checked_add(span).is_none() || change.lamport.checked_add(span).is_none()
        {
            return Integration::Discarded(CollabError::MalformedOperation(format!(
                "clock of change {} overflows",
                change.id
            )));
        }
        if change.id.seq != current + 1 {
            return Integration::Deferred(change);
        }
        let anchors = change.anchors();
        if anchors
            .iter()
            .chain(change.targets())
            .any(|dep| !self.version.covers(*dep))
        {
            return Integration::Deferred(change);
        }

        let outcome = match anchors.iter().find(|dep| !self.exists(**dep)) {
            Some(missing) => Err(CollabError::UnknownAnchor(*missing)),
            None => self.check(&change),
        };

        self.version.set(change.id.replica, change.last_id().seq);
        self.lamport = self.lamport.max(change.lamport + span - 1);

        let result = match outcome {
            Ok(()) => {
                self.execute(&change);
                Integration::Applied
            }
            Err(err) => Integration::Rejected(err),
        };
        self.log.push(change);
        result
    }

    /// Structural validation of a change whose dependencies exist.
    fn check(&self, change: &Change) -> Result<()> {
        let malformed = |msg: String| Err(CollabError::MalformedOperation(msg));
        match &change.kind {
            ChangeKind::InsertText {
                parent,
                after,
                text,
                marks,
            } => {
                let entry = self.entry(*parent)?;
                if text.is_empty() {
                    return malformed("empty text insertion".into());
                }
                if !entry.node_type.is_textblock() {
                    return malformed(format!("cannot insert text into {:?}", entry.node_type));
                }
                if let Some(after) = after
                    && self.locations.get(after) != Some(parent)
                {
                    return malformed(format!("{} is not inside {}", after, parent));
                }
                validate_marks(entry.node_type, marks)
            }
            ChangeKind::InsertNode {
                parent,
                after,
                node_type,
                attrs,
            } => {
                let entry = self.entry(*parent)?;
                if *node_type == NodeType::Text || !entry.node_type.allows_child(*node_type) {
                    return malformed(format!(
                        "{:?} cannot contain {:?}",
                        entry.node_type, node_type
                    ));
                }
                if let Some(after) = after
                    && self.locations.get(after) != Some(parent)
                {
                    return malformed(format!("{} is not inside {}", after, parent));
                }
                for (key, value) in attrs {
                    validate_attr(*node_type, key, value)?;
                }
                Ok(())
            }
            ChangeKind::Delete { .. } => Ok(()),
            ChangeKind::SetAttr { node, key, value } => {
                let entry = self.entry(*node)?;
                match value {
                    Some(value) => validate_attr(entry.node_type, key, value),
                    None if entry.node_type.attr_kind(key).is_none() => malformed(format!(
                        "{:?} has no attribute '{}'",
                        entry.node_type, key
                    )),
                    None => Ok(()),
                }
            }
            ChangeKind::SetMark {
                mark_type, mark, ..
            } => match mark {
                Some(mark) if mark.mark_type != *mark_type => {
                    malformed("mark does not match its register".into())
                }
                Some(mark) => validate_mark(mark),
                None => Ok(()),
            },
        }
    }

    /// Insertion index for an item placed after `after` with key `order`.
    fn insert_index(entry: &NodeEntry, after: Option<OpId>, order: OrderKey) -> usize {
        let mut index = match after.and_then(|a| entry.index_of(a)) {
            Some(i) => i + 1,
            None => 0,
        };
        while index < entry.children.len() && entry.children[index].order > order {
            index += 1;
        }
        index
    }

    fn execute(&mut self, change: &Change) {
        let order = change.order();
        match &change.kind {
            ChangeKind::InsertText {
                parent,
                after,
                text,
                marks,
            } => {
                let Some(entry) = self.nodes.get_mut(parent) else {
                    return;
                };
                let start = Self::insert_index(entry, *after, order);
                for (i, ch) in text.chars().enumerate() {
                    let char_order =
                        OrderKey::new(change.lamport.saturating_add(i as u64), change.id.replica);
                    let marks = marks
                        .iter()
                        .map(|m| {
                            (
                                m.mark_type,
                                Register {
                                    order: char_order,
                                    value: Some(m.clone()),
                                },
                            )
                        })
                        .collect();
                    let id = change.id.offset(i as u64);
                    entry.children.insert(
                        start + i,
                        Item {
                            id,
                            order: char_order,
                            content: ItemContent::Char { ch, marks },
                            deleted: None,
                        },
                    );
                    self.locations.insert(id, *parent);
                }
            }
            ChangeKind::InsertNode {
                parent,
                after,
                node_type,
                attrs,
            } => {
                let Some(entry) = self.nodes.get_mut(parent) else {
                    return;
                };
                let index = Self::insert_index(entry, *after, order);
                entry.children.insert(
                    index,
                    Item {
                        id: change.id,
                        order,
                        content: ItemContent::Node,
                        deleted: None,
                    },
                );
                let mut node = NodeEntry::new(*node_type, *parent);
                node.attrs = attrs
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            Register {
                                order,
                                value: Some(v.clone()),
                            },
                        )
                    })
                    .collect();
                self.nodes.insert(change.id, node);
                self.locations.insert(change.id, *parent);
            }
            ChangeKind::Delete { targets } => {
                for target in targets {
                    if let Some(item) = self.item_mut(*target)
                        && item.deleted.is_none()
                    {
                        item.deleted = Some(change.id);
                    }
                }
            }
            ChangeKind::SetAttr { node, key, value } => {
                if let Some(entry) = self.nodes.get_mut(node) {
                    match entry.attrs.get_mut(key) {
                        Some(register) => register.write(order, value.clone()),
                        None => {
                            entry.attrs.insert(
                                key.clone(),
                                Register {
                                    order,
                                    value: value.clone(),
                                },
                            );
                        }
                    }
                }
            }
            ChangeKind::SetMark {
                targets,
                mark_type,
                mark,
            } => {
                for target in targets {
                    let Some(item) = self.item_mut(*target) else {
                        continue;
                    };
                    if let ItemContent::Char { marks, .. } = &mut item.content {
                        match marks.get_mut(mark_type) {
                            Some(register) => register.write(order, mark.clone()),
                            None => {
                                marks.insert(
                                    *mark_type,
                                    Register {
                                        order,
                                        value: mark.clone(),
                                    },
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    fn item_mut(&mut self, id: OpId) -> Option<&mut Item> {
        let container = *self.locations.get(&id)?;
        let entry = self.nodes.get_mut(&container)?;
        entry.children.iter_mut().find(|item| item.id == id)
    }

    // ------------------------------------------------------------------
    // Maintenance and encoding
    // ------------------------------------------------------------------

    /// Physically remove tombstones whose deletion is covered by `stable`,
    /// a state vector every peer is known to have reached. Returns the
    /// number of items removed.
    pub fn collect_garbage(&mut self, stable: &StateVector) -> usize {
        let mut removed_nodes = Vec::new();
        let mut removed_items = Vec::new();
        for entry in self.nodes.values_mut() {
            entry.children.retain(|item| match item.deleted {
                Some(deleted) if stable.covers(deleted) => {
                    removed_items.push(item.id);
                    if matches!(item.content, ItemContent::Node) {
                        removed_nodes.push(item.id);
                    }
                    false
                }
                _ => true,
            });
        }
        while let Some(id) = removed_nodes.pop() {
            if let Some(entry) = self.nodes.remove(&id) {
                for item in entry.children {
                    removed_items.push(item.id);
                    if matches!(item.content, ItemContent::Node) {
                        removed_nodes.push(item.id);
                    }
                }
            }
        }
        for id in &removed_items {
            self.locations.remove(id);
        }
        if !removed_items.is_empty() {
            log::debug!(
                "[Replica] collected {} tombstoned items",
                removed_items.len()
            );
        }
        removed_items.len()
    }

    /// Encode the full change log.
    pub fn encode_state(&self) -> Vec<u8> {
        encode_changes(&self.log)
    }

    /// Encode the changes a peer at `remote` is missing.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        encode_changes(self.changes_since(remote))
    }

    /// Logged changes not covered by `remote`, in log order.
    pub fn changes_since<'a>(&'a self, remote: &'a StateVector) -> impl Iterator<Item = &'a Change> {
        self.log.iter().filter(move |c| !remote.covers(c.id))
    }

    /// Changes that seed an empty document with `content`.
    ///
    /// They are generated from an empty state under a replica id derived
    /// from the content itself. Replicas seeding the same content produce
    /// identical changes that deduplicate on merge; different seeds get
    /// distinct ids and merge like any concurrent insertions.
    pub fn seed_changes(content: &DocumentNode) -> Result<Vec<Change>> {
        if content.children.is_empty() {
            return Ok(Vec::new());
        }
        let draft = Self::seed_under(ReplicaId::SEED, content)?;
        Self::seed_under(ReplicaId::seed(&encode_changes(&draft)), content)
    }

    fn seed_under(replica: ReplicaId, content: &DocumentNode) -> Result<Vec<Change>> {
        let mut seed = ReplicaState::new(replica);
        seed.apply_local(&[Operation::InsertNodes {
            at: Position::root(0),
            nodes: content.children.clone(),
        }])
    }
}
