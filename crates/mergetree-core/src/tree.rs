//! The replicated tree: arena of nodes, mutating operations with local LWW,
//! observers, tidy, and the structural validator.
//!
//! A `Tree` is the unit of serialization. It is not shareable across
//! threads; concurrent writers build separate instances and exchange whole
//! states through `merge`. Observer callbacks run synchronously on the
//! mutating call and must not reenter the tree.

use crate::abac::{AbacAction, AbacPolicy, AncestryView, PolicyError};
use crate::clock::{resolve_conflict, VectorClock};
use crate::identity::{ClientId, IdentityError};
use crate::lseq::{self, Position, BASE};
use crate::node::{fresh_node_id, Edge, Node, NodeId, NodeKind, ROOT_ID};
use crate::value::normalize_number;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("node {0} is not a map node")]
    NotMap(NodeId),
    #[error("node {0} is not an array node")]
    NotArray(NodeId),
    #[error("node {0} is not a literal")]
    NotLiteral(NodeId),
    #[error("key {0} not found")]
    KeyNotFound(String),
    #[error("cannot attach node {0} to itself")]
    SelfAttachment(NodeId),
    #[error("adding edge from {from} to {to} would create a cycle")]
    WouldCycle { from: NodeId, to: NodeId },
    #[error("node {0} already has a parent")]
    AlreadyAttached(NodeId),
    #[error("conflict detected for node {0}")]
    Conflict(NodeId),
    #[error("node {0} has no children")]
    NoChildren(NodeId),
    #[error("sibling index {0} out of bounds")]
    SiblingOutOfBounds(usize),
    #[error("tree must have exactly one root node, found {0}")]
    RootCount(usize),
    #[error("node {0} must have exactly one kind: map, array, or literal")]
    KindExclusivity(NodeId),
    #[error("literal node {0} must not have children")]
    LiteralWithChildren(NodeId),
    #[error("cycle detected at node {0}")]
    CycleDetected(NodeId),
    #[error("node {child} has multiple parents: {first} and {second}")]
    MultipleParents {
        child: NodeId,
        first: NodeId,
        second: NodeId,
    },
    #[error("node {child} records parent {recorded} but is linked under {linked}")]
    ParentMismatch {
        child: NodeId,
        recorded: NodeId,
        linked: NodeId,
    },
    #[error("root node must not have a parent")]
    RootHasParent,
    #[error("unreachable node found: {0}")]
    Unreachable(NodeId),
    #[error("node {0} has no signature")]
    MissingSignature(NodeId),
    #[error("client {client} is not allowed to modify node {node}")]
    NotAllowed { client: ClientId, node: NodeId },
    #[error("tree has no access policy")]
    PolicyMissing,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Observer event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEvent {
    Added,
    Updated,
    Removed,
}

/// Single-method observer notified after each mutating operation.
/// Implementations must not call back into the tree.
pub trait TreeObserver: Send {
    fn notify(&mut self, node: &str, event: TreeEvent);
}

impl<F> TreeObserver for F
where
    F: FnMut(&str, TreeEvent) + Send,
{
    fn notify(&mut self, node: &str, event: TreeEvent) {
        self(node, event)
    }
}

pub type SubscriberId = u64;

pub struct Tree {
    pub root_id: NodeId,
    pub nodes: BTreeMap<NodeId, Node>,
    pub policy: Option<AbacPolicy>,
    pub secure: bool,
    subscribers: BTreeMap<SubscriberId, Box<dyn TreeObserver>>,
    next_subscriber: SubscriberId,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root_id", &self.root_id)
            .field("nodes", &self.nodes.len())
            .field("secure", &self.secure)
            .finish()
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.root_id == other.root_id
            && self.nodes == other.nodes
            && self.policy == other.policy
            && self.secure == other.secure
    }
}

impl Tree {
    /// A fresh tree holding only the pre-created synthetic root.
    pub fn new() -> Self {
        let root = Node::new(ROOT_ID.to_owned(), NodeKind::Root);
        let mut nodes = BTreeMap::new();
        nodes.insert(root.id.clone(), root);
        Self {
            root_id: ROOT_ID.to_owned(),
            nodes,
            policy: None,
            secure: false,
            subscribers: BTreeMap::new(),
            next_subscriber: 1,
        }
    }

    /// Deep, independent copy; observers are not carried over.
    pub fn clone_tree(&self) -> Tree {
        Tree {
            root_id: self.root_id.clone(),
            nodes: self.nodes.clone(),
            policy: self.policy.clone(),
            secure: self.secure,
            subscribers: BTreeMap::new(),
            next_subscriber: 1,
        }
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn root(&self) -> &Node {
        // The root is inserted at construction and never removed.
        &self.nodes[&self.root_id]
    }

    pub fn subscribe(&mut self, observer: impl TreeObserver + 'static) -> SubscriberId {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.insert(id, Box::new(observer));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub(crate) fn notify(&mut self, node: &str, event: TreeEvent) {
        for observer in self.subscribers.values_mut() {
            observer.notify(node, event);
        }
    }

    /// Allocates a detached node. No parent link, no notification; the node
    /// joins the tree proper once an edge attaches it.
    pub fn create_node(&mut self, label: &str, kind: NodeKind, client: &str) -> NodeId {
        let id = fresh_node_id(label);
        let mut node = Node::new(id.clone(), kind);
        node.clock.set(client, 1);
        node.owner = client.to_owned();
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Allocates a node and links it under `parent` in one step.
    pub fn create_attached_node(
        &mut self,
        label: &str,
        kind: NodeKind,
        parent: &str,
        client: &str,
    ) -> Result<NodeId, TreeError> {
        let id = self.create_node(label, kind, client);
        self.add_edge(parent, &id, "", client)?;
        self.notify(&id, TreeEvent::Added);
        Ok(id)
    }

    /// Attaches a fresh map node under `parent`.
    pub fn create_map_node(&mut self, parent: &str, client: &str) -> Result<NodeId, TreeError> {
        let id = self.create_node("map", NodeKind::Map, client);
        self.add_edge(parent, &id, "", client)?;
        self.notify(&id, TreeEvent::Added);
        Ok(id)
    }

    /// Attaches a fresh array node under `parent`.
    pub fn create_array_node(&mut self, parent: &str, client: &str) -> Result<NodeId, TreeError> {
        let id = self.create_node("arr", NodeKind::Array, client);
        self.add_edge(parent, &id, "", client)?;
        self.notify(&id, TreeEvent::Added);
        Ok(id)
    }

    /// Looks up the child of a map node reached through `key`.
    pub fn key_node(&self, map_id: &str, key: &str) -> Result<Option<NodeId>, TreeError> {
        let node = self
            .nodes
            .get(map_id)
            .ok_or_else(|| TreeError::NodeNotFound(map_id.to_owned()))?;
        if !node.is_map {
            return Err(TreeError::NotMap(map_id.to_owned()));
        }
        for edge in &node.edges {
            if edge.label == key {
                if !self.nodes.contains_key(&edge.to) {
                    return Err(TreeError::NodeNotFound(edge.to.clone()));
                }
                return Ok(Some(edge.to.clone()));
            }
        }
        Ok(None)
    }

    /// Sets `key` on a map node, updating the existing literal in place or
    /// attaching a fresh literal child.
    pub fn set_key_value(
        &mut self,
        map_id: &str,
        key: &str,
        value: Value,
        client: &str,
    ) -> Result<NodeId, TreeError> {
        let node = self
            .nodes
            .get(map_id)
            .ok_or_else(|| TreeError::NodeNotFound(map_id.to_owned()))?;
        if !node.is_map {
            return Err(TreeError::NotMap(map_id.to_owned()));
        }

        let existing = node
            .edges
            .iter()
            .find(|e| e.label == key)
            .map(|e| e.to.clone());
        if let Some(value_id) = existing {
            let target = self
                .nodes
                .get(&value_id)
                .ok_or_else(|| TreeError::NodeNotFound(value_id.clone()))?;
            let version = target.clock.max_version() + 1;
            if let Err(err) = self.set_literal_with_version(&value_id, value, client, version) {
                error!(node = %value_id, client, %err, "set literal failed");
                return Err(err);
            }
            if let Some(target) = self.nodes.get_mut(&value_id) {
                target.parent_id = map_id.to_owned();
            }
            return Ok(value_id);
        }

        let value_id = fresh_node_id("val");
        let mut value_node = Node::new(value_id.clone(), NodeKind::Literal);
        value_node.clock.set(client, 1);
        value_node.owner = client.to_owned();
        self.nodes.insert(value_id.clone(), value_node);
        self.set_literal_with_version(&value_id, value, client, 1)?;
        self.add_edge(map_id, &value_id, key, client)?;
        self.notify(&value_id, TreeEvent::Added);
        Ok(value_id)
    }

    /// Unlinks the child reached through `key`. The target node is not
    /// tombstoned; it stays in the arena until `tidy` runs.
    pub fn remove_key_value(&mut self, map_id: &str, key: &str, client: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get(map_id)
            .ok_or_else(|| TreeError::NodeNotFound(map_id.to_owned()))?;
        if !node.is_map {
            return Err(TreeError::NotMap(map_id.to_owned()));
        }
        let target = node
            .edges
            .iter()
            .find(|e| e.label == key)
            .map(|e| e.to.clone())
            .ok_or_else(|| TreeError::KeyNotFound(key.to_owned()))?;
        self.remove_edge(map_id, &target, client)
    }

    pub fn add_edge(&mut self, from: &str, to: &str, label: &str, client: &str) -> Result<(), TreeError> {
        self.valid_attachment(from, to)?;
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;
        let version = from_node.clock.get(client) + 1;
        self.add_edge_with_version(from, to, label, client, version)
    }

    pub(crate) fn add_edge_with_version(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        client: &str,
        version: u64,
    ) -> Result<(), TreeError> {
        if !self.nodes.contains_key(to) {
            return Err(TreeError::NodeNotFound(to.to_owned()));
        }
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;

        let mut proposed = from_node.clock.clone();
        proposed.set(client, version);
        let (winning, winning_owner) =
            resolve_conflict(&from_node.clock, &proposed, &from_node.owner, client);
        let accepted = winning == &proposed && winning_owner == client;

        if accepted {
            let edge = Edge {
                from: from.to_owned(),
                to: to.to_owned(),
                label: label.to_owned(),
                position: Position::new(),
            };
            if let Some(node) = self.nodes.get_mut(from) {
                node.edges.push(edge);
                node.clock = proposed;
                node.owner = client.to_owned();
            }
            if let Some(child) = self.nodes.get_mut(to) {
                child.parent_id = from.to_owned();
            }
            self.notify(from, TreeEvent::Added);
            debug!(from, to, label, version, "edge added");
        } else {
            debug!(from, to, label, version, "edge add ignored due to conflict");
        }
        Ok(())
    }

    /// Appends `to` after the current last sibling of `from`.
    pub fn append_edge(&mut self, from: &str, to: &str, label: &str, client: &str) -> Result<(), TreeError> {
        self.valid_attachment(from, to)?;
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;
        let last_sibling = from_node.edges.last().map(|e| e.to.clone()).unwrap_or_default();
        let version = from_node.clock.get(client) + 1;
        self.insert_edge_with_version(from, to, label, &last_sibling, false, client, version)
    }

    /// Inserts `to` before the current first sibling of `from`.
    pub fn prepend_edge(&mut self, from: &str, to: &str, label: &str, client: &str) -> Result<(), TreeError> {
        self.valid_attachment(from, to)?;
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;
        let first_sibling = from_node.edges.first().map(|e| e.to.clone()).unwrap_or_default();
        let version = from_node.clock.get(client) + 1;
        self.insert_edge_with_version(from, to, label, &first_sibling, true, client, version)
    }

    pub fn insert_edge_left(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        sibling: &str,
        client: &str,
    ) -> Result<(), TreeError> {
        self.valid_attachment(from, to)?;
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;
        let version = from_node.clock.get(client) + 1;
        self.insert_edge_with_version(from, to, label, sibling, true, client, version)
    }

    pub fn insert_edge_right(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        sibling: &str,
        client: &str,
    ) -> Result<(), TreeError> {
        self.valid_attachment(from, to)?;
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;
        let version = from_node.clock.get(client) + 1;
        self.insert_edge_with_version(from, to, label, sibling, false, client, version)
    }

    pub(crate) fn insert_edge_with_version(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        sibling: &str,
        left: bool,
        client: &str,
        version: u64,
    ) -> Result<(), TreeError> {
        if !self.nodes.contains_key(to) {
            return Err(TreeError::NodeNotFound(to.to_owned()));
        }
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;

        let mut proposed = from_node.clock.clone();
        proposed.set(client, version);

        let mut sorted = from_node.edges.clone();
        sorted.sort_by(|a, b| lseq::compare(&a.position, &b.position).then_with(|| a.to.cmp(&b.to)));

        let mut left_pos: Position = Position::new();
        let mut right_pos: Position = vec![BASE];
        if !sibling.is_empty() && !sorted.is_empty() {
            if let Some(i) = sorted.iter().position(|e| e.to == sibling) {
                if left {
                    left_pos = if i > 0 {
                        sorted[i - 1].position.clone()
                    } else {
                        Position::new()
                    };
                    right_pos = sorted[i].position.clone();
                } else {
                    left_pos = sorted[i].position.clone();
                    right_pos = if i + 1 < sorted.len() {
                        sorted[i + 1].position.clone()
                    } else {
                        vec![BASE]
                    };
                }
            }
        }
        let position = lseq::position_between(&left_pos, &right_pos);

        if let Some(node) = self.nodes.get_mut(from) {
            node.edges.push(Edge {
                from: from.to_owned(),
                to: to.to_owned(),
                label: label.to_owned(),
                position: position.clone(),
            });
            node.sort_edges();
            node.clock = proposed;
            node.owner = client.to_owned();
        }
        if let Some(child) = self.nodes.get_mut(to) {
            child.parent_id = from.to_owned();
        }
        self.notify(from, TreeEvent::Added);
        debug!(from, to, sibling, left, ?position, version, "edge inserted");
        Ok(())
    }

    pub fn remove_edge(&mut self, from: &str, to: &str, client: &str) -> Result<(), TreeError> {
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;
        let version = from_node.clock.get(client) + 1;
        self.remove_edge_with_version(from, to, client, version, false)
    }

    pub(crate) fn remove_edge_with_version(
        &mut self,
        from: &str,
        to: &str,
        client: &str,
        version: u64,
        ignore_conflicts: bool,
    ) -> Result<(), TreeError> {
        let from_node = self
            .nodes
            .get(from)
            .ok_or_else(|| TreeError::NodeNotFound(from.to_owned()))?;

        let mut proposed = from_node.clock.clone();
        proposed.set(client, version);
        let (winning, _) = resolve_conflict(&from_node.clock, &proposed, &from_node.owner, client);
        let accepted = winning == &proposed || ignore_conflicts;

        if !accepted {
            error!(from, to, version, "edge remove ignored due to conflict");
            return Err(TreeError::Conflict(from.to_owned()));
        }

        if let Some(node) = self.nodes.get_mut(from) {
            node.edges.retain(|e| e.to != to);
            node.clock = proposed;
            node.owner = client.to_owned();
        }
        if let Some(child) = self.nodes.get_mut(to) {
            child.parent_id.clear();
        }
        self.notify(from, TreeEvent::Removed);
        debug!(from, to, version, "edge removed");
        Ok(())
    }

    /// Returns the child at `index` in LSEQ order.
    pub fn sibling(&self, parent: &str, index: usize) -> Result<NodeId, TreeError> {
        let node = self
            .nodes
            .get(parent)
            .ok_or_else(|| TreeError::NodeNotFound(parent.to_owned()))?;
        if node.edges.is_empty() {
            return Err(TreeError::NoChildren(parent.to_owned()));
        }
        let mut sorted = node.edges.clone();
        sorted.sort_by(|a, b| lseq::compare(&a.position, &b.position).then_with(|| a.to.cmp(&b.to)));
        let edge = sorted
            .get(index)
            .ok_or(TreeError::SiblingOutOfBounds(index))?;
        if !self.nodes.contains_key(&edge.to) {
            return Err(TreeError::NodeNotFound(edge.to.clone()));
        }
        Ok(edge.to.clone())
    }

    pub fn get_literal(&self, id: &str) -> Result<Value, TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_owned()))?;
        if !node.is_literal {
            return Err(TreeError::NotLiteral(id.to_owned()));
        }
        Ok(node.literal_value.clone())
    }

    pub fn set_literal(&mut self, id: &str, value: Value, client: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_owned()))?;
        let version = node.clock.max_version() + 1;
        self.set_literal_with_version(id, value, client, version)
    }

    pub(crate) fn set_literal_with_version(
        &mut self,
        id: &str,
        value: Value,
        client: &str,
        version: u64,
    ) -> Result<(), TreeError> {
        let value = normalize_number(value);
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_owned()))?;

        let proposed = VectorClock::single(client, version);
        let (winning, winning_owner) =
            resolve_conflict(&node.clock, &proposed, &node.owner, client);
        let accepted = winning == &proposed && winning_owner == client;

        if !accepted {
            debug!(node = id, client, version, "literal set ignored due to conflict");
            return Err(TreeError::Conflict(id.to_owned()));
        }

        let has_parent = {
            let node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| TreeError::NodeNotFound(id.to_owned()))?;
            node.is_literal = true;
            node.literal_value = value;
            node.clock = proposed;
            node.owner = client.to_owned();
            !node.parent_id.is_empty()
        };
        debug!(node = id, client, version, "literal set");
        // Detached nodes are not part of the tree yet; observers only hear
        // about attached content.
        if has_parent {
            self.notify(id, TreeEvent::Updated);
        }
        Ok(())
    }

    /// Soft-deletes the node under a winning clock tick. Physical removal
    /// happens in `tidy`.
    pub fn mark_deleted(&mut self, id: &str, client: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_owned()))?;
        let version = node.clock.max_version() + 1;
        self.mark_deleted_with_version(id, client, version)
    }

    pub(crate) fn mark_deleted_with_version(
        &mut self,
        id: &str,
        client: &str,
        version: u64,
    ) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_owned()))?;

        let proposed = VectorClock::single(client, version);
        let (winning, winning_owner) =
            resolve_conflict(&node.clock, &proposed, &node.owner, client);
        let accepted = winning == &proposed && winning_owner == client;

        if !accepted {
            debug!(node = id, client, version, "delete ignored due to conflict");
            return Err(TreeError::Conflict(id.to_owned()));
        }

        if let Some(node) = self.nodes.get_mut(id) {
            node.clock = proposed;
            node.owner = client.to_owned();
            node.is_deleted = true;
        }
        debug!(node = id, client, version, "deleted flag set");
        self.notify(id, TreeEvent::Updated);
        Ok(())
    }

    /// Removes unreferenced nodes, unlinks tombstoned children, then removes
    /// tombstoned nodes.
    ///
    /// Never call this automatically after each change: a node that looks
    /// orphaned now may be re-referenced by a concurrent merge. Run it
    /// manually once a batch of operations has settled, or before
    /// persisting.
    pub fn tidy(&mut self) {
        let mut referenced: BTreeSet<NodeId> = BTreeSet::new();
        for node in self.nodes.values() {
            for edge in &node.edges {
                referenced.insert(edge.to.clone());
            }
        }
        referenced.insert(self.root_id.clone());

        self.nodes.retain(|id, _| {
            let keep = referenced.contains(id);
            if !keep {
                debug!(node = %id, "purged unreferenced node");
            }
            keep
        });

        let gone: BTreeSet<NodeId> = {
            let deleted: BTreeSet<&NodeId> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.is_deleted)
                .map(|(id, _)| id)
                .collect();
            let known: BTreeSet<&NodeId> = self.nodes.keys().collect();
            let mut out = BTreeSet::new();
            for node in self.nodes.values() {
                for edge in &node.edges {
                    if !known.contains(&edge.to) || deleted.contains(&edge.to) {
                        out.insert(edge.to.clone());
                    }
                }
            }
            out
        };
        for node in self.nodes.values_mut() {
            node.edges.retain(|e| !gone.contains(&e.to));
        }

        self.nodes.retain(|id, node| {
            if node.is_deleted {
                debug!(node = %id, "purged deleted node");
                false
            } else {
                true
            }
        });
    }

    /// Physically removes a detached node and everything below it. Single
    /// parentage guarantees the subtree is not referenced from outside.
    pub(crate) fn remove_subtree(&mut self, id: &str) {
        let mut stack = vec![id.to_owned()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                debug!(node = %current, "purged replaced node");
                for edge in node.edges {
                    stack.push(edge.to);
                }
            }
        }
    }

    pub(crate) fn normalize(&mut self) {
        for node in self.nodes.values_mut() {
            node.sort_edges();
        }
    }

    pub(crate) fn edge_exists(&self, from: &str, to: &str) -> bool {
        self.nodes
            .get(from)
            .map(|n| n.find_edge_to(to).is_some())
            .unwrap_or(false)
    }

    /// Rejects attachments that would self-link, create a cycle, or give
    /// `to` a second parent.
    pub(crate) fn valid_attachment(&self, from: &str, to: &str) -> Result<(), TreeError> {
        if from == to {
            return Err(TreeError::SelfAttachment(from.to_owned()));
        }

        let mut visited = BTreeSet::new();
        let mut stack = vec![to.to_owned()];
        while let Some(current) = stack.pop() {
            if current == from {
                return Err(TreeError::WouldCycle {
                    from: from.to_owned(),
                    to: to.to_owned(),
                });
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for edge in &node.edges {
                    stack.push(edge.to.clone());
                }
            }
        }

        for parent in self.nodes.values() {
            if parent.find_edge_to(to).is_some() {
                return Err(TreeError::AlreadyAttached(to.to_owned()));
            }
        }
        Ok(())
    }

    /// Enforces the structural invariants: one root, single parents, no
    /// cycles, kind exclusivity, childless literals, parent/edge agreement,
    /// and full reachability from the root.
    pub fn validate(&self) -> Result<(), TreeError> {
        let root_count = self.nodes.values().filter(|n| n.is_root).count();
        if root_count != 1 {
            debug!(root_count, "invalid root node count");
            return Err(TreeError::RootCount(root_count));
        }

        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        let mut parent_of: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        self.validate_from(&self.root_id, &mut BTreeSet::new(), &mut visited, &mut parent_of)?;

        for id in self.nodes.keys() {
            if !visited.contains(id) {
                debug!(node = %id, "unreachable node detected");
                return Err(TreeError::Unreachable(id.clone()));
            }
        }
        Ok(())
    }

    fn validate_from(
        &self,
        current: &NodeId,
        ancestors: &mut BTreeSet<NodeId>,
        visited: &mut BTreeSet<NodeId>,
        parent_of: &mut BTreeMap<NodeId, NodeId>,
    ) -> Result<(), TreeError> {
        if ancestors.contains(current) {
            debug!(node = %current, "cycle detected");
            return Err(TreeError::CycleDetected(current.clone()));
        }
        if visited.contains(current) {
            return Ok(());
        }
        visited.insert(current.clone());

        let node = self
            .nodes
            .get(current)
            .ok_or_else(|| TreeError::NodeNotFound(current.clone()))?;

        if !node.is_root {
            let kinds =
                usize::from(node.is_map) + usize::from(node.is_array) + usize::from(node.is_literal);
            if kinds != 1 {
                debug!(node = %current, node.is_map, node.is_array, node.is_literal, "invalid kind combination");
                return Err(TreeError::KindExclusivity(current.clone()));
            }
        }
        if node.is_literal && !node.edges.is_empty() {
            debug!(node = %current, "literal node has children");
            return Err(TreeError::LiteralWithChildren(current.clone()));
        }

        ancestors.insert(current.clone());
        for edge in &node.edges {
            let child = self
                .nodes
                .get(&edge.to)
                .ok_or_else(|| TreeError::NodeNotFound(edge.to.clone()))?;
            if child.is_root {
                debug!(parent = %current, "root node has a parent");
                return Err(TreeError::RootHasParent);
            }
            if let Some(existing) = parent_of.get(&edge.to) {
                if existing != current {
                    debug!(child = %edge.to, first = %existing, second = %current, "multiple parents detected");
                    return Err(TreeError::MultipleParents {
                        child: edge.to.clone(),
                        first: existing.clone(),
                        second: current.clone(),
                    });
                }
            }
            if child.parent_id != *current {
                debug!(child = %edge.to, recorded = %child.parent_id, linked = %current, "parent link mismatch");
                return Err(TreeError::ParentMismatch {
                    child: edge.to.clone(),
                    recorded: child.parent_id.clone(),
                    linked: current.clone(),
                });
            }
            parent_of.insert(edge.to.clone(), current.clone());
            self.validate_from(&edge.to, ancestors, visited, parent_of)?;
        }
        ancestors.remove(current);
        Ok(())
    }

    /// `validate` plus per-node signature verification, ABAC authorization
    /// of every recovered signer, and verification of the policy itself.
    pub fn verify(&self) -> Result<(), TreeError> {
        let policy = self.policy.as_ref().ok_or(TreeError::PolicyMissing)?;
        self.validate()?;

        for (id, node) in &self.nodes {
            if node.signature.is_empty() {
                return Err(TreeError::MissingSignature(id.clone()));
            }
            let recovered = node.verify()?;
            if !policy.is_allowed(self, &recovered, AbacAction::Modify, id) {
                return Err(TreeError::NotAllowed {
                    client: recovered,
                    node: id.clone(),
                });
            }
        }

        policy.verify()?;
        Ok(())
    }

    /// True when `target` lies in the subtree rooted at `root` (a node is
    /// its own descendant).
    pub fn is_descendant(&self, root: &str, target: &str) -> bool {
        if root == target {
            return true;
        }
        let mut visited = BTreeSet::new();
        let mut stack = vec![root.to_owned()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for edge in &node.edges {
                    if edge.to == target {
                        return true;
                    }
                    stack.push(edge.to.clone());
                }
            }
        }
        false
    }
}

impl AncestryView for Tree {
    fn is_descendant(&self, root: &str, target: &str) -> bool {
        Tree::is_descendant(self, root, target)
    }
}
