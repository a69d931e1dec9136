//! Node and edge records, the canonical node hash, and per-node signing.

use crate::clock::VectorClock;
use crate::identity::{self, ClientId, Identity, IdentityError};
use crate::lseq::{self, Position};
use crate::value::canonical_literal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque node identifier of the form `<label>-<uuid-hash>`. The synthetic
/// root is always `"root"`.
pub type NodeId = String;

pub const ROOT_ID: &str = "root";

/// The kind a node is created with. A node carries exactly one kind for its
/// whole life; only the synthetic root is structurally distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Map,
    Array,
    Literal,
}

/// Parent-to-child link. Map children carry the map key as `label`; array
/// children are unlabeled and ordered by `position`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub label: String,
    #[serde(rename = "lseqposition")]
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "parentid")]
    pub parent_id: NodeId,
    pub edges: Vec<Edge>,
    pub clock: VectorClock,
    pub owner: ClientId,
    #[serde(rename = "isroot")]
    pub is_root: bool,
    #[serde(rename = "ismap")]
    pub is_map: bool,
    #[serde(rename = "isarray")]
    pub is_array: bool,
    #[serde(rename = "ispromoted")]
    pub is_promoted: bool,
    #[serde(rename = "isliteral")]
    pub is_literal: bool,
    #[serde(rename = "litteralValue")]
    pub literal_value: Value,
    #[serde(rename = "nounce")]
    pub nonce: String,
    pub signature: String,
    #[serde(rename = "deleted")]
    pub is_deleted: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        let mut node = Self {
            id,
            parent_id: String::new(),
            edges: Vec::new(),
            clock: VectorClock::new(),
            owner: String::new(),
            is_root: false,
            is_map: false,
            is_array: false,
            is_promoted: false,
            is_literal: false,
            literal_value: Value::Null,
            nonce: String::new(),
            signature: String::new(),
            is_deleted: false,
        };
        node.set_kind(kind);
        node
    }

    pub(crate) fn set_kind(&mut self, kind: NodeKind) {
        match kind {
            NodeKind::Root => self.is_root = true,
            NodeKind::Map => self.is_map = true,
            NodeKind::Array => self.is_array = true,
            NodeKind::Literal => self.is_literal = true,
        }
    }

    /// The kind the node currently reports through its flags, if exactly one
    /// is set.
    pub fn kind(&self) -> Option<NodeKind> {
        match (self.is_root, self.is_map, self.is_array, self.is_literal) {
            (true, false, false, false) => Some(NodeKind::Root),
            (false, true, false, false) => Some(NodeKind::Map),
            (false, false, true, false) => Some(NodeKind::Array),
            (false, false, false, true) => Some(NodeKind::Literal),
            _ => None,
        }
    }

    pub(crate) fn sort_edges(&mut self) {
        self.edges
            .sort_by(|a, b| lseq::compare(&a.position, &b.position).then_with(|| a.to.cmp(&b.to)));
    }

    pub(crate) fn find_edge_to(&self, to: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.to == to)
    }

    /// Canonical SHA3-256 digest over the node's signed content: identity,
    /// parent link, owner, clock, kind flags, literal value, nonce, and the
    /// LSEQ-ordered edge fingerprints.
    pub fn canonical_hash(&self) -> [u8; 32] {
        let mut payload = String::new();
        payload.push_str(&self.id);
        payload.push('|');
        payload.push_str(&self.parent_id);
        payload.push('|');
        payload.push_str(&self.owner);
        payload.push('|');
        for (client, version) in self.clock.iter() {
            payload.push_str(client);
            payload.push(':');
            payload.push_str(&version.to_string());
            payload.push(';');
        }
        payload.push('|');
        for flag in [
            self.is_root,
            self.is_map,
            self.is_array,
            self.is_literal,
            self.is_promoted,
        ] {
            payload.push(if flag { '1' } else { '0' });
        }
        payload.push('|');
        payload.push_str(&canonical_literal(&self.literal_value));
        payload.push('|');
        payload.push_str(&self.nonce);
        payload.push('|');
        let mut edges = self.edges.clone();
        edges.sort_by(|a, b| lseq::compare(&a.position, &b.position).then_with(|| a.to.cmp(&b.to)));
        for edge in &edges {
            payload.push_str(&edge.to);
            payload.push('|');
            payload.push_str(&edge.label);
            payload.push('|');
            for digit in &edge.position {
                payload.push_str(&digit.to_string());
                payload.push(',');
            }
            payload.push(';');
        }
        identity::sha3_digest(payload.as_bytes())
    }

    /// Signs the node with a fresh nonce, storing both the nonce and the
    /// recoverable hex signature.
    pub fn sign(&mut self, identity: &Identity) -> Result<(), IdentityError> {
        self.nonce = identity::random_nonce();
        let digest = self.canonical_hash();
        self.signature = identity.sign_digest(&digest)?;
        Ok(())
    }

    /// Verifies the stored signature against the current content and returns
    /// the recovered signer id. Fails when the signature is missing or
    /// malformed; content tampering surfaces as a foreign recovered id.
    pub fn verify(&self) -> Result<ClientId, IdentityError> {
        if self.signature.is_empty() {
            return Err(IdentityError::MalformedSignature);
        }
        let digest = self.canonical_hash();
        identity::recover_client_id(&digest, &self.signature)
    }
}

/// Allocates a fresh node id for the given label.
pub(crate) fn fresh_node_id(label: &str) -> NodeId {
    format!("{label}-{}", identity::random_content_id())
}
