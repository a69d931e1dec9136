//! Secure adapter: every mutation is authorized against the ABAC policy and
//! re-signed, so the wrapped tree always satisfies `verify`.
//!
//! Operations take the acting writer's hex private key, derive the identity,
//! check `Modify` permission on the touched node BEFORE mutating, run the
//! raw tree operation, and then re-sign every node whose canonical content
//! changed.

use crate::abac::{AbacAction, AbacPolicy};
use crate::identity::Identity;
use crate::node::{Node, NodeId, NodeKind};
use crate::tree::{SubscriberId, Tree, TreeError, TreeObserver};
use serde_json::Value;

pub struct SecureTree {
    tree: Tree,
    identity: Identity,
}

impl SecureTree {
    /// Creates a secure tree owned by the identity behind `prv_hex`: a
    /// fresh policy owned by that identity and a signed root.
    pub fn new(prv_hex: &str) -> Result<Self, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        let mut tree = Tree::new();
        tree.secure = true;
        tree.policy = Some(AbacPolicy::new(identity.clone())?);
        let root_id = tree.root_id.clone();
        sign_nodes(&mut tree, [root_id], &identity)?;
        Ok(Self { tree, identity })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Raw access to the wrapped tree. Mutations made through this handle
    /// bypass authorization and signing.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn policy(&self) -> Option<&AbacPolicy> {
        self.tree.policy.as_ref()
    }

    /// Mutable access to the policy, e.g. to grant rules before a merge.
    pub fn policy_mut(&mut self) -> Result<&mut AbacPolicy, TreeError> {
        self.tree.policy.as_mut().ok_or(TreeError::PolicyMissing)
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.tree.get_node(id)
    }

    pub fn node_by_path(&self, path: &str) -> Result<NodeId, TreeError> {
        self.tree.node_by_path(path)
    }

    pub fn export_json(&self) -> Result<String, TreeError> {
        let value = self.tree.export_json()?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    pub fn subscribe(&mut self, observer: impl TreeObserver + 'static) -> SubscriberId {
        self.tree.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.tree.unsubscribe(id)
    }

    /// Allocates a detached node. Detached nodes are invisible to the tree
    /// until attached, so no authorization target exists yet; the node is
    /// signed for when it joins.
    pub fn create_node(
        &mut self,
        label: &str,
        kind: NodeKind,
        prv_hex: &str,
    ) -> Result<NodeId, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        let id = self.tree.create_node(label, kind, identity.client_id());
        sign_nodes(&mut self.tree, [id.clone()], &identity)?;
        Ok(id)
    }

    pub fn create_attached_node(
        &mut self,
        label: &str,
        kind: NodeKind,
        parent: &str,
        prv_hex: &str,
    ) -> Result<NodeId, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, parent)?;
        let id = self
            .tree
            .create_attached_node(label, kind, parent, identity.client_id())?;
        sign_nodes(&mut self.tree, [parent.to_owned(), id.clone()], &identity)?;
        Ok(id)
    }

    pub fn create_map_node(&mut self, parent: &str, prv_hex: &str) -> Result<NodeId, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, parent)?;
        let id = self.tree.create_map_node(parent, identity.client_id())?;
        sign_nodes(&mut self.tree, [parent.to_owned(), id.clone()], &identity)?;
        Ok(id)
    }

    pub fn set_key_value(
        &mut self,
        map_id: &str,
        key: &str,
        value: Value,
        prv_hex: &str,
    ) -> Result<NodeId, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, map_id)?;
        let value_id = self
            .tree
            .set_key_value(map_id, key, value, identity.client_id())?;
        sign_nodes(
            &mut self.tree,
            [map_id.to_owned(), value_id.clone()],
            &identity,
        )?;
        Ok(value_id)
    }

    pub fn remove_key_value(
        &mut self,
        map_id: &str,
        key: &str,
        prv_hex: &str,
    ) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, map_id)?;
        let removed = self.tree.key_node(map_id, key)?;
        self.tree
            .remove_key_value(map_id, key, identity.client_id())?;
        let mut touched = vec![map_id.to_owned()];
        touched.extend(removed);
        sign_nodes(&mut self.tree, touched, &identity)?;
        Ok(())
    }

    pub fn get_literal(&self, id: &str) -> Result<Value, TreeError> {
        self.tree.get_literal(id)
    }

    pub fn set_literal(&mut self, id: &str, value: Value, prv_hex: &str) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, id)?;
        self.tree.set_literal(id, value, identity.client_id())?;
        sign_nodes(&mut self.tree, [id.to_owned()], &identity)
    }

    pub fn mark_deleted(&mut self, id: &str, prv_hex: &str) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, id)?;
        self.tree.mark_deleted(id, identity.client_id())?;
        sign_nodes(&mut self.tree, [id.to_owned()], &identity)
    }

    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        prv_hex: &str,
    ) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, from)?;
        self.tree.add_edge(from, to, label, identity.client_id())?;
        sign_nodes(&mut self.tree, [from.to_owned(), to.to_owned()], &identity)
    }

    pub fn append_edge(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        prv_hex: &str,
    ) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, from)?;
        self.tree
            .append_edge(from, to, label, identity.client_id())?;
        sign_nodes(&mut self.tree, [from.to_owned(), to.to_owned()], &identity)
    }

    pub fn prepend_edge(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        prv_hex: &str,
    ) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, from)?;
        self.tree
            .prepend_edge(from, to, label, identity.client_id())?;
        sign_nodes(&mut self.tree, [from.to_owned(), to.to_owned()], &identity)
    }

    pub fn insert_edge_left(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        sibling: &str,
        prv_hex: &str,
    ) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, from)?;
        self.tree
            .insert_edge_left(from, to, label, sibling, identity.client_id())?;
        sign_nodes(&mut self.tree, [from.to_owned(), to.to_owned()], &identity)
    }

    pub fn insert_edge_right(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        sibling: &str,
        prv_hex: &str,
    ) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, from)?;
        self.tree
            .insert_edge_right(from, to, label, sibling, identity.client_id())?;
        sign_nodes(&mut self.tree, [from.to_owned(), to.to_owned()], &identity)
    }

    pub fn remove_edge(&mut self, from: &str, to: &str, prv_hex: &str) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, from)?;
        self.tree.remove_edge(from, to, identity.client_id())?;
        sign_nodes(&mut self.tree, [from.to_owned(), to.to_owned()], &identity)
    }

    pub fn import_json(&mut self, data: &[u8], prv_hex: &str) -> Result<NodeId, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        let root_id = self.tree.root_id.clone();
        self.authorize(&identity, &root_id)?;
        let mut created = Vec::new();
        let id = self
            .tree
            .import_json_collect(data, identity.client_id(), &mut created)?;
        created.push(root_id);
        sign_nodes(&mut self.tree, created, &identity)?;
        Ok(id)
    }

    pub fn import_json_to_map(
        &mut self,
        data: &[u8],
        parent: &str,
        key: &str,
        prv_hex: &str,
    ) -> Result<NodeId, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, parent)?;
        let mut created = Vec::new();
        let id = self.tree.import_json_to_map_collect(
            data,
            parent,
            key,
            identity.client_id(),
            &mut created,
        )?;
        created.push(parent.to_owned());
        sign_nodes(&mut self.tree, created, &identity)?;
        Ok(id)
    }

    pub fn import_json_to_array(
        &mut self,
        data: &[u8],
        array_id: &str,
        prv_hex: &str,
    ) -> Result<NodeId, TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.authorize(&identity, array_id)?;
        let mut created = Vec::new();
        let id = self.tree.import_json_to_array_collect(
            data,
            array_id,
            identity.client_id(),
            &mut created,
        )?;
        created.push(array_id.to_owned());
        sign_nodes(&mut self.tree, created, &identity)?;
        Ok(id)
    }

    /// Two-phase validated merge; `self` is untouched on any failure.
    pub fn merge(&mut self, other: &SecureTree, prv_hex: &str) -> Result<(), TreeError> {
        let identity = Identity::from_hex(prv_hex)?;
        self.tree.secure_merge(&other.tree, &identity)
    }

    pub fn validate(&self) -> Result<(), TreeError> {
        self.tree.validate()
    }

    pub fn verify(&self) -> Result<(), TreeError> {
        self.tree.verify()
    }

    pub fn tidy(&mut self) {
        self.tree.tidy()
    }

    /// Deep, independent copy sharing the same local identity.
    pub fn clone_tree(&self) -> SecureTree {
        SecureTree {
            tree: self.tree.clone_tree(),
            identity: self.identity.clone(),
        }
    }

    pub fn save(&self) -> Result<Vec<u8>, TreeError> {
        self.tree.save()
    }

    /// Loads a snapshot, re-attaches the local identity to the policy, and
    /// verifies the tree when the snapshot is marked secure.
    pub fn load(&mut self, data: &[u8]) -> Result<(), TreeError> {
        let mut tree = Tree::load_bytes(data)?;
        if let Some(policy) = tree.policy.as_mut() {
            policy.attach_identity(self.identity.clone());
        }
        if tree.secure {
            tree.verify()?;
        }
        self.tree = tree;
        Ok(())
    }

    fn authorize(&self, identity: &Identity, node: &str) -> Result<(), TreeError> {
        let policy = self.tree.policy.as_ref().ok_or(TreeError::PolicyMissing)?;
        if !policy.is_allowed(&self.tree, identity.client_id(), AbacAction::Modify, node) {
            return Err(TreeError::NotAllowed {
                client: identity.client_id().clone(),
                node: node.to_owned(),
            });
        }
        Ok(())
    }
}

fn sign_nodes(
    tree: &mut Tree,
    ids: impl IntoIterator<Item = NodeId>,
    identity: &Identity,
) -> Result<(), TreeError> {
    for id in ids {
        if let Some(node) = tree.nodes.get_mut(&id) {
            node.sign(identity)?;
        }
    }
    Ok(())
}
