//! JSON bridge: import between `serde_json::Value` and the tree shape,
//! export back to JSON, and `/`-separated path lookup.
//!
//! Objects map to Map nodes whose edge labels are the keys; arrays map to
//! Array nodes with unlabeled, LSEQ-ordered edges; scalars map to Literal
//! nodes with numbers normalized to 64-bit floats.

use crate::node::{NodeId, NodeKind};
use crate::tree::{Tree, TreeError, TreeEvent};
use serde_json::{Map, Value};

impl Tree {
    /// Imports a JSON document at the root, replacing the root's existing
    /// children. Returns the id of the imported container (or literal).
    pub fn import_json(&mut self, data: &[u8], client: &str) -> Result<NodeId, TreeError> {
        self.import_json_collect(data, client, &mut Vec::new())
    }

    pub(crate) fn import_json_collect(
        &mut self,
        data: &[u8],
        client: &str,
        created: &mut Vec<NodeId>,
    ) -> Result<NodeId, TreeError> {
        let value: Value = serde_json::from_slice(data)?;
        let root_id = self.root_id.clone();
        // Replacing the root's children: unlink each old child, then sweep
        // its subtree so no unreachable orphans survive the import.
        let existing: Vec<NodeId> = self.root().edges.iter().map(|e| e.to.clone()).collect();
        for child in existing {
            self.remove_edge(&root_id, &child, client)?;
            self.remove_subtree(&child);
        }
        self.import_value(&root_id, "", &value, client, created)
    }

    /// Imports a JSON document under `parent` keyed by `key`.
    pub fn import_json_to_map(
        &mut self,
        data: &[u8],
        parent: &str,
        key: &str,
        client: &str,
    ) -> Result<NodeId, TreeError> {
        self.import_json_to_map_collect(data, parent, key, client, &mut Vec::new())
    }

    pub(crate) fn import_json_to_map_collect(
        &mut self,
        data: &[u8],
        parent: &str,
        key: &str,
        client: &str,
        created: &mut Vec<NodeId>,
    ) -> Result<NodeId, TreeError> {
        let value: Value = serde_json::from_slice(data)?;
        if !self.nodes.contains_key(parent) {
            return Err(TreeError::NodeNotFound(parent.to_owned()));
        }
        self.import_value(parent, key, &value, client, created)
    }

    /// Appends the elements of a JSON array (or a single value) under an
    /// Array node. Returns the array node's id.
    pub fn import_json_to_array(
        &mut self,
        data: &[u8],
        array_id: &str,
        client: &str,
    ) -> Result<NodeId, TreeError> {
        self.import_json_to_array_collect(data, array_id, client, &mut Vec::new())
    }

    pub(crate) fn import_json_to_array_collect(
        &mut self,
        data: &[u8],
        array_id: &str,
        client: &str,
        created: &mut Vec<NodeId>,
    ) -> Result<NodeId, TreeError> {
        let value: Value = serde_json::from_slice(data)?;
        let node = self
            .nodes
            .get(array_id)
            .ok_or_else(|| TreeError::NodeNotFound(array_id.to_owned()))?;
        if !node.is_array {
            return Err(TreeError::NotArray(array_id.to_owned()));
        }
        match &value {
            Value::Array(items) => {
                for item in items {
                    self.import_value(array_id, "", item, client, created)?;
                }
            }
            other => {
                self.import_value(array_id, "", other, client, created)?;
            }
        }
        Ok(array_id.to_owned())
    }

    fn import_value(
        &mut self,
        parent: &str,
        label: &str,
        value: &Value,
        client: &str,
        created: &mut Vec<NodeId>,
    ) -> Result<NodeId, TreeError> {
        match value {
            Value::Object(map) => {
                let id = self.create_node("map", NodeKind::Map, client);
                self.attach_imported(parent, &id, label, client)?;
                created.push(id.clone());
                for (key, child) in map {
                    self.import_value(&id, key, child, client, created)?;
                }
                Ok(id)
            }
            Value::Array(items) => {
                let id = self.create_node("arr", NodeKind::Array, client);
                self.attach_imported(parent, &id, label, client)?;
                created.push(id.clone());
                for item in items {
                    self.import_value(&id, "", item, client, created)?;
                }
                Ok(id)
            }
            scalar => {
                let id = self.create_node("val", NodeKind::Literal, client);
                self.set_literal_with_version(&id, scalar.clone(), client, 1)?;
                self.attach_imported(parent, &id, label, client)?;
                created.push(id.clone());
                Ok(id)
            }
        }
    }

    fn attach_imported(
        &mut self,
        parent: &str,
        id: &str,
        label: &str,
        client: &str,
    ) -> Result<(), TreeError> {
        let parent_is_array = self
            .nodes
            .get(parent)
            .ok_or_else(|| TreeError::NodeNotFound(parent.to_owned()))?
            .is_array;
        if parent_is_array {
            self.append_edge(parent, id, label, client)?;
        } else {
            self.add_edge(parent, id, label, client)?;
        }
        self.notify(id, TreeEvent::Added);
        Ok(())
    }

    /// Exports the tree back to a JSON value. A lone container child of the
    /// root is exported directly, mirroring what `import_json` builds.
    pub fn export_json(&self) -> Result<Value, TreeError> {
        if let Some(child) = self.lone_container_child(&self.root_id) {
            return self.node_value(&child);
        }
        self.node_value(&self.root_id)
    }

    fn node_value(&self, id: &str) -> Result<Value, TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_owned()))?;
        if node.is_literal {
            return Ok(node.literal_value.clone());
        }
        let mut edges = node.edges.clone();
        edges.sort_by(|a, b| {
            crate::lseq::compare(&a.position, &b.position).then_with(|| a.to.cmp(&b.to))
        });
        let as_object =
            node.is_map || (!node.is_array && edges.iter().any(|e| !e.label.is_empty()));
        if as_object {
            let mut out = Map::new();
            for edge in &edges {
                out.insert(edge.label.clone(), self.node_value(&edge.to)?);
            }
            Ok(Value::Object(out))
        } else {
            let mut out = Vec::with_capacity(edges.len());
            for edge in &edges {
                out.push(self.node_value(&edge.to)?);
            }
            Ok(Value::Array(out))
        }
    }

    /// Resolves a `/`-separated path to a node id. Numeric segments index
    /// the LSEQ-ordered children of array nodes; other segments match edge
    /// labels. A single unlabeled container child is descended into
    /// transparently, so `/foo` and `/0` address imported documents.
    pub fn node_by_path(&self, path: &str) -> Result<NodeId, TreeError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = self.root_id.clone();
        if segments.is_empty() {
            if let Some(child) = self.lone_container_child(&current) {
                return Ok(child);
            }
            return Ok(current);
        }
        for segment in segments {
            current = self
                .resolve_segment(&current, segment)
                .ok_or_else(|| TreeError::InvalidPath(path.to_owned()))?;
        }
        Ok(current)
    }

    fn resolve_segment(&self, id: &str, segment: &str) -> Option<NodeId> {
        let node = self.nodes.get(id)?;
        if let Some(edge) = node.edges.iter().find(|e| e.label == segment) {
            return Some(edge.to.clone());
        }
        if node.is_array {
            if let Ok(index) = segment.parse::<usize>() {
                let mut edges = node.edges.clone();
                edges.sort_by(|a, b| {
                    crate::lseq::compare(&a.position, &b.position).then_with(|| a.to.cmp(&b.to))
                });
                return edges.get(index).map(|e| e.to.clone());
            }
        }
        let child = self.lone_container_child(id)?;
        self.resolve_segment(&child, segment)
    }

    pub(crate) fn lone_container_child(&self, id: &str) -> Option<NodeId> {
        let node = self.nodes.get(id)?;
        if node.edges.len() != 1 || !node.edges[0].label.is_empty() {
            return None;
        }
        let child = self.nodes.get(&node.edges[0].to)?;
        if child.is_map || child.is_array {
            Some(child.id.clone())
        } else {
            None
        }
    }
}
