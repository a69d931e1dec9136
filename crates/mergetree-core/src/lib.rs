//! Core primitives for mergetree: a secure, mergeable, JSON-shaped tree.
//!
//! Replicas mutate locally under vector-clock LWW, exchange whole states,
//! and converge through the merge engine; every structural mutation is
//! attributed to a secp256k1 identity and gated by an ABAC policy attached
//! to the tree.

pub mod abac;
pub mod clock;
pub mod identity;
pub mod json;
pub mod lseq;
pub mod merge;
pub mod node;
pub mod secure;
pub mod snapshot;
pub mod tree;
pub mod value;

pub use abac::{AbacAction, AbacPolicy, AbacRule, AncestryView};
pub use clock::VectorClock;
pub use identity::{ClientId, Identity};
pub use node::{Edge, Node, NodeId, NodeKind, ROOT_ID};
pub use secure::SecureTree;
pub use tree::{Tree, TreeError, TreeEvent, TreeObserver};

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
