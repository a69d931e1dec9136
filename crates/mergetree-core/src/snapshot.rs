//! Self-contained snapshot blob for a whole tree.
//!
//! The encoding is deterministic JSON with stable field names; `save`
//! followed by `load_bytes` reproduces an identical tree, signatures
//! included.

use crate::abac::AbacPolicy;
use crate::node::{Node, NodeId};
use crate::tree::{Tree, TreeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize)]
struct TreeSnapshot {
    root: NodeId,
    nodes: BTreeMap<NodeId, Node>,
    abac: Option<AbacPolicy>,
    secure: bool,
}

impl Tree {
    /// Serializes the whole tree into a single blob.
    pub fn save(&self) -> Result<Vec<u8>, TreeError> {
        let snapshot = TreeSnapshot {
            root: self.root_id.clone(),
            nodes: self.nodes.clone(),
            abac: self.policy.clone(),
            secure: self.secure,
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    /// Rebuilds a tree from a snapshot blob. Structural soundness and
    /// signatures are the caller's concern; `SecureTree::load` layers the
    /// verification on top.
    pub fn load_bytes(data: &[u8]) -> Result<Tree, TreeError> {
        let snapshot: TreeSnapshot = serde_json::from_slice(data)?;
        if !snapshot.nodes.contains_key(&snapshot.root) {
            return Err(TreeError::NodeNotFound(snapshot.root));
        }
        let mut tree = Tree::new();
        tree.root_id = snapshot.root;
        tree.nodes = snapshot.nodes;
        tree.policy = snapshot.abac;
        tree.secure = snapshot.secure;
        Ok(tree)
    }
}
