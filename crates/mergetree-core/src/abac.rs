//! Attribute-based access control: a signed, versioned rule store owned by
//! a single identity, merged by last-writer-wins over its own clock.

use crate::identity::{self, ClientId, Identity, IdentityError};
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Matches every node.
pub const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy has no signing identity")]
    NoIdentity,
    #[error("policy signature does not match owner {0}")]
    OwnerMismatch(ClientId),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Actions a rule can grant. Only `Modify` gates mutations; `Read` is
/// carried for completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbacAction {
    Modify,
    Read,
}

impl std::fmt::Display for AbacAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbacAction::Modify => write!(f, "modify"),
            AbacAction::Read => write!(f, "read"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbacRule {
    pub recursive: bool,
}

pub type RuleSet = BTreeMap<ClientId, BTreeMap<AbacAction, BTreeMap<NodeId, AbacRule>>>;

/// Minimal view of the tree the policy needs for recursive rules.
pub trait AncestryView {
    /// True when `target` lies in the subtree rooted at `root`.
    fn is_descendant(&self, root: &str, target: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbacPolicy {
    pub rules: RuleSet,
    pub clock: u64,
    #[serde(rename = "ownerid")]
    pub owner_id: ClientId,
    pub signature: String,
    #[serde(rename = "nounce")]
    pub nonce: String,
    /// Local signing identity; never serialized and never replaced by merge.
    #[serde(skip)]
    identity: Option<Identity>,
}

impl PartialEq for AbacPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.rules == other.rules
            && self.clock == other.clock
            && self.owner_id == other.owner_id
            && self.signature == other.signature
            && self.nonce == other.nonce
    }
}

impl AbacPolicy {
    /// A fresh policy owned and signed by `identity`.
    pub fn new(identity: Identity) -> Result<Self, PolicyError> {
        let mut policy = Self {
            rules: RuleSet::new(),
            clock: 0,
            owner_id: identity.client_id().clone(),
            signature: String::new(),
            nonce: String::new(),
            identity: Some(identity),
        };
        policy.resign()?;
        Ok(policy)
    }

    /// Re-attaches the local signing identity after deserialization.
    pub fn attach_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Grants `client` the action on `node`, optionally covering the whole
    /// subtree below it.
    pub fn allow(
        &mut self,
        client: &str,
        action: AbacAction,
        node: &str,
        recursive: bool,
    ) -> Result<(), PolicyError> {
        self.rules
            .entry(client.to_owned())
            .or_default()
            .entry(action)
            .or_default()
            .insert(node.to_owned(), AbacRule { recursive });
        self.clock += 1;
        debug!(client, %action, node, recursive, clock = self.clock, "policy rule added");
        self.resign()
    }

    /// Replaces the recursion flag of an existing rule (or records the rule
    /// if absent).
    pub fn update_rule(
        &mut self,
        client: &str,
        action: AbacAction,
        node: &str,
        recursive: bool,
    ) -> Result<(), PolicyError> {
        self.allow(client, action, node, recursive)
    }

    pub fn remove_rule(
        &mut self,
        client: &str,
        action: AbacAction,
        node: &str,
    ) -> Result<(), PolicyError> {
        if let Some(actions) = self.rules.get_mut(client) {
            if let Some(nodes) = actions.get_mut(&action) {
                nodes.remove(node);
                if nodes.is_empty() {
                    actions.remove(&action);
                }
            }
            if actions.is_empty() {
                self.rules.remove(client);
            }
        }
        self.clock += 1;
        debug!(client, %action, node, clock = self.clock, "policy rule removed");
        self.resign()
    }

    pub fn rule(&self, client: &str, action: AbacAction, node: &str) -> Option<&AbacRule> {
        self.rules.get(client)?.get(&action)?.get(node)
    }

    /// Authorization check: the owner is unconditionally allowed; otherwise
    /// an exact rule, a wildcard rule, or a recursive rule on an ancestor
    /// grants access.
    pub fn is_allowed(
        &self,
        tree: &dyn AncestryView,
        client: &str,
        action: AbacAction,
        node: &str,
    ) -> bool {
        if client == self.owner_id {
            return true;
        }
        let Some(nodes) = self.rules.get(client).and_then(|a| a.get(&action)) else {
            return false;
        };
        if nodes.contains_key(node) || nodes.contains_key(WILDCARD) {
            return true;
        }
        nodes
            .iter()
            .any(|(target, rule)| rule.recursive && tree.is_descendant(target, node))
    }

    /// Recomputes the canonical policy digest and checks that the stored
    /// signature recovers to the recorded owner.
    pub fn verify(&self) -> Result<ClientId, PolicyError> {
        let digest = self.canonical_hash();
        let recovered = identity::recover_client_id(&digest, &self.signature)?;
        if recovered != self.owner_id {
            return Err(PolicyError::OwnerMismatch(self.owner_id.clone()));
        }
        Ok(recovered)
    }

    /// LWW merge: the strictly newer policy replaces the other wholesale;
    /// equal clocks keep the lexicographically smaller owner. The local
    /// signing identity is never replaced.
    pub fn merge(&mut self, other: &AbacPolicy) -> Result<(), PolicyError> {
        let other_wins = other.clock > self.clock
            || (other.clock == self.clock && other.owner_id < self.owner_id);
        if other_wins {
            debug!(
                local_clock = self.clock,
                remote_clock = other.clock,
                remote_owner = %other.owner_id,
                "policy replaced by remote state"
            );
            self.rules = other.rules.clone();
            self.clock = other.clock;
            self.owner_id = other.owner_id.clone();
            self.signature = other.signature.clone();
            self.nonce = other.nonce.clone();
        }
        self.verify()?;
        Ok(())
    }

    fn resign(&mut self) -> Result<(), PolicyError> {
        let identity = self.identity.as_ref().ok_or(PolicyError::NoIdentity)?;
        self.nonce = identity::random_nonce();
        let digest = self.canonical_hash();
        self.signature = identity.sign_digest(&digest)?;
        Ok(())
    }

    /// SHA3-256 over the canonical serialization
    /// `(sorted rules, clock, ownerID, nonce)`.
    fn canonical_hash(&self) -> [u8; 32] {
        let mut payload = String::new();
        for (client, actions) in &self.rules {
            for (action, nodes) in actions {
                for (node, rule) in nodes {
                    payload.push_str(client);
                    payload.push('|');
                    payload.push_str(&action.to_string());
                    payload.push('|');
                    payload.push_str(node);
                    payload.push('|');
                    payload.push(if rule.recursive { '1' } else { '0' });
                    payload.push(';');
                }
            }
        }
        payload.push('|');
        payload.push_str(&self.clock.to_string());
        payload.push('|');
        payload.push_str(&self.owner_id);
        payload.push('|');
        payload.push_str(&self.nonce);
        identity::sha3_digest(payload.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRV: &str = "d6eb959e9aec2e6fdc44b5862b269e987b8a4d6f2baca542d8acaa97ee5e74f6";

    /// Stand-in hierarchy: only "child" descends from "parent".
    struct MockTree;

    impl AncestryView for MockTree {
        fn is_descendant(&self, root: &str, target: &str) -> bool {
            root == "parent" && target == "child"
        }
    }

    fn policy() -> AbacPolicy {
        let identity = Identity::from_hex(PRV).expect("identity should parse");
        AbacPolicy::new(identity).expect("policy should sign")
    }

    #[test]
    fn modify_rules_exact_wildcard_and_recursive() {
        let tree = MockTree;
        let mut policy = policy();

        policy
            .allow("alice", AbacAction::Modify, WILDCARD, false)
            .expect("allow");
        policy
            .allow("alice", AbacAction::Modify, "parent", true)
            .expect("allow");
        policy
            .allow("bob", AbacAction::Modify, "node-y", false)
            .expect("allow");

        let cases = [
            ("alice", "node-x", true),
            ("alice", "node-y", true),
            ("bob", "node-x", false),
            ("bob", "node-y", true),
            ("charlie", "node-y", false),
            ("alice", "child", true),
            ("bob", "child", false),
        ];
        for (client, node, expected) in cases {
            assert_eq!(
                policy.is_allowed(&tree, client, AbacAction::Modify, node),
                expected,
                "is_allowed({client}, modify, {node})"
            );
        }
    }

    #[test]
    fn owner_is_always_allowed() {
        let tree = MockTree;
        let policy = policy();
        let owner = policy.owner_id.clone();
        assert!(policy.is_allowed(&tree, &owner, AbacAction::Modify, "anything"));
    }

    #[test]
    fn update_and_remove_rules() {
        let tree = MockTree;
        let mut policy = policy();

        assert!(!policy.is_allowed(&tree, "carol", AbacAction::Modify, "node-test"));

        policy
            .allow("carol", AbacAction::Modify, "node-test", false)
            .expect("allow");
        assert!(policy.is_allowed(&tree, "carol", AbacAction::Modify, "node-test"));

        policy
            .update_rule("carol", AbacAction::Modify, "node-test", true)
            .expect("update");
        let rule = policy
            .rule("carol", AbacAction::Modify, "node-test")
            .expect("rule should exist");
        assert!(rule.recursive);

        policy
            .remove_rule("carol", AbacAction::Modify, "node-test")
            .expect("remove");
        assert!(!policy.is_allowed(&tree, "carol", AbacAction::Modify, "node-test"));
    }

    #[test]
    fn mutations_bump_the_clock_and_keep_the_signature_valid() {
        let mut policy = policy();
        let initial = policy.clock;
        policy
            .allow("alice", AbacAction::Read, "node-x", false)
            .expect("allow");
        assert_eq!(policy.clock, initial + 1);
        let recovered = policy.verify().expect("policy should verify");
        assert_eq!(recovered, policy.owner_id);
    }

    #[test]
    fn tampered_owner_fails_verification() {
        let mut policy = policy();
        policy.owner_id = "f".repeat(64);
        assert!(policy.verify().is_err());
    }

    #[test]
    fn merge_is_last_writer_wins_wholesale() {
        let identity_a = Identity::generate();
        let identity_b = Identity::generate();

        let mut policy_a = AbacPolicy::new(identity_a).expect("policy should sign");
        policy_a
            .allow("client1", AbacAction::Modify, "node1", false)
            .expect("allow");
        for _ in 0..3 {
            policy_a
                .allow("client1", AbacAction::Read, "nodeX", false)
                .expect("allow");
        }

        let mut policy_b = AbacPolicy::new(identity_b).expect("policy should sign");
        policy_b
            .allow("client2", AbacAction::Modify, "node2", true)
            .expect("allow");
        for _ in 0..5 {
            policy_b
                .allow("client2", AbacAction::Read, "nodeY", true)
                .expect("allow");
        }

        policy_a.verify().expect("policy a should verify");
        policy_b.verify().expect("policy b should verify");

        policy_a.merge(&policy_b).expect("merge should work");

        assert_eq!(policy_a.clock, policy_b.clock);
        assert_eq!(policy_a.owner_id, policy_b.owner_id);
        assert_eq!(policy_a.rules, policy_b.rules);
        policy_a.verify().expect("merged policy should verify");

        let tree = MockTree;
        assert!(policy_a.is_allowed(&tree, "client2", AbacAction::Modify, "node2"));
        assert!(!policy_a.is_allowed(&tree, "client1", AbacAction::Modify, "node1"));
    }

    #[test]
    fn merge_with_older_remote_keeps_local_state() {
        let identity_a = Identity::generate();
        let identity_b = Identity::generate();

        let mut policy_a = AbacPolicy::new(identity_a).expect("policy should sign");
        for _ in 0..4 {
            policy_a
                .allow("client1", AbacAction::Modify, "node1", false)
                .expect("allow");
        }
        let before = policy_a.clone();

        let mut policy_b = AbacPolicy::new(identity_b).expect("policy should sign");
        policy_b
            .allow("client2", AbacAction::Modify, "node2", false)
            .expect("allow");

        policy_a.merge(&policy_b).expect("merge should work");
        assert_eq!(policy_a, before);
    }
}
