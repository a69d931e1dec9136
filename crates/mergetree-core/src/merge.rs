//! Whole-state merge: node union, literal LWW reconciliation, edge
//! reconciliation with the array-promotion rule, clock union, and the
//! two-phase validated `secure_merge`.

use crate::identity::Identity;
use crate::node::{Node, NodeId, NodeKind};
use crate::tree::{Tree, TreeError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

impl Tree {
    /// Folds `other` into `self`. Literal updates that lose LWW are logged
    /// and skipped; structural failures surface as errors.
    pub fn merge(&mut self, other: &Tree) -> Result<(), TreeError> {
        self.merge_inner(other, None)
    }

    /// Two-phase merge for secure trees: the fold is rehearsed on a clone
    /// and verified (signatures, ABAC, policy) before touching `self`.
    /// Nodes whose signed content changes during the fold are re-signed by
    /// the merging writer's identity.
    pub fn secure_merge(&mut self, other: &Tree, identity: &Identity) -> Result<(), TreeError> {
        if self.policy.is_none() {
            return Err(TreeError::PolicyMissing);
        }

        let mut work = self.clone_tree();
        work.merge_inner(other, Some(identity))?;
        work.verify()?;
        if let (Some(local), Some(remote)) = (&mut work.policy, &other.policy) {
            local.merge(remote)?;
        }
        work.verify()?;

        // The rehearsal passed; apply the same fold to the live tree.
        self.merge_inner(other, Some(identity))?;
        if let (Some(local), Some(remote)) = (&mut self.policy, &other.policy) {
            local.merge(remote)?;
        }
        Ok(())
    }

    fn merge_inner(&mut self, other: &Tree, signer: Option<&Identity>) -> Result<(), TreeError> {
        // Parent -> promoted array, remembered for the rest of this merge so
        // further remote edges to the same parent land under the array.
        let mut promotions: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut dirty: BTreeSet<NodeId> = BTreeSet::new();

        for (id, remote) in &other.nodes {
            if !self.nodes.contains_key(id) {
                self.nodes.insert(id.clone(), clone_remote(remote));
            }

            let (merged_clock, merged_owner) = {
                let local = &self.nodes[id];
                let owner = if local.owner <= remote.owner {
                    local.owner.clone()
                } else {
                    remote.owner.clone()
                };
                (local.clock.merged(&remote.clock), owner)
            };

            if remote.is_literal {
                let value = remote.literal_value.clone();
                let version = remote.clock.get(&remote.owner);
                // A losing update drops the remote value but still falls
                // through to the clock union below; both replicas must end
                // up with the same clock no matter which side won.
                match self.set_literal_with_version(id, value, &remote.owner, version) {
                    Ok(()) => {
                        if let Some(local) = self.nodes.get_mut(id) {
                            local.nonce = remote.nonce.clone();
                            local.signature = remote.signature.clone();
                        }
                    }
                    Err(err) => {
                        warn!(node = %id, %err, "literal update lost during merge");
                    }
                }
            }

            for re in &remote.edges {
                if !self.nodes.contains_key(&re.from) {
                    if let Some(remote_from) = other.nodes.get(&re.from) {
                        self.nodes.insert(re.from.clone(), clone_remote(remote_from));
                    }
                }
                if !self.nodes.contains_key(&re.to) {
                    if let Some(remote_to) = other.nodes.get(&re.to) {
                        self.nodes.insert(re.to.clone(), clone_remote(remote_to));
                    }
                }

                if self.edge_exists(&re.from, &re.to) {
                    continue;
                }

                let (from_edges, from_is_array, from_is_map, from_owner) = {
                    let from = self
                        .nodes
                        .get(&re.from)
                        .ok_or_else(|| TreeError::NodeNotFound(re.from.clone()))?;
                    (from.edges.clone(), from.is_array, from.is_map, from.owner.clone())
                };

                // Two writers attached different children under the same
                // single-child parent: promote the parent to an array
                // holding both, ordered by ascending node id.
                if from_edges.len() == 1 && !from_is_array && !from_is_map {
                    let existing_id = from_edges[0].to.clone();
                    let (existing_owner, existing_version) = {
                        let existing = self
                            .nodes
                            .get(&existing_id)
                            .ok_or_else(|| TreeError::NodeNotFound(existing_id.clone()))?;
                        (existing.owner.clone(), existing.clock.get(&existing.owner))
                    };

                    let array_id = self.create_node("arr", NodeKind::Array, &from_owner);
                    if let Some(array) = self.nodes.get_mut(&array_id) {
                        array.is_promoted = true;
                    }
                    self.add_edge(&re.from, &array_id, "", &from_owner)?;
                    let _ = self.remove_edge_with_version(
                        &re.from,
                        &existing_id,
                        &existing_owner,
                        existing_version,
                        true,
                    );

                    let mut children = vec![existing_id.clone(), re.to.clone()];
                    children.sort();
                    for child in &children {
                        if let Err(err) = self.append_edge(&array_id, child, "", &from_owner) {
                            warn!(array = %array_id, child = %child, %err, "append under promoted array failed");
                        }
                    }

                    debug!(parent = %re.from, array = %array_id, "parent promoted to array");
                    dirty.extend([
                        re.from.clone(),
                        array_id.clone(),
                        existing_id,
                        re.to.clone(),
                    ]);
                    promotions.insert(re.from.clone(), array_id);
                    continue;
                }

                if let Some(array_id) = promotions.get(&re.from).cloned() {
                    if self.edge_exists(&array_id, &re.to) {
                        continue;
                    }
                    let mut existing: Vec<NodeId> = self
                        .nodes
                        .get(&array_id)
                        .map(|a| a.edges.iter().map(|e| e.to.clone()).collect())
                        .unwrap_or_default();
                    existing.sort();

                    let mut inserted = false;
                    for (i, child) in existing.iter().enumerate() {
                        if re.to < *child {
                            if i > 0 {
                                self.insert_edge_right(
                                    &array_id,
                                    &re.to,
                                    &re.label,
                                    &existing[i - 1],
                                    &remote.owner,
                                )?;
                            } else {
                                self.prepend_edge(&array_id, &re.to, &re.label, &remote.owner)?;
                            }
                            inserted = true;
                            break;
                        }
                    }
                    if !inserted {
                        self.append_edge(&array_id, &re.to, &re.label, &remote.owner)?;
                    }
                    dirty.extend([array_id, re.to.clone()]);
                    continue;
                }

                if from_is_array {
                    // Splice the remote child after the sibling it follows
                    // in the remote order, when that sibling exists locally.
                    let sibling = other
                        .nodes
                        .get(&re.from)
                        .and_then(|remote_parent| {
                            let mut sorted = remote_parent.edges.clone();
                            sorted.sort_by(|a, b| {
                                crate::lseq::compare(&a.position, &b.position)
                                    .then_with(|| a.to.cmp(&b.to))
                            });
                            let i = sorted.iter().position(|e| e.to == re.to)?;
                            if i > 0 {
                                Some(sorted[i - 1].to.clone())
                            } else {
                                None
                            }
                        })
                        .filter(|sibling| self.nodes.contains_key(sibling));

                    match sibling {
                        None => {
                            debug!(from = %re.from, to = %re.to, "prepending remote edge, no local left sibling");
                            self.prepend_edge(&re.from, &re.to, &re.label, &remote.owner)?;
                        }
                        Some(sibling) => {
                            debug!(from = %re.from, to = %re.to, %sibling, "inserting remote edge right of sibling");
                            self.insert_edge_right(
                                &re.from,
                                &re.to,
                                &re.label,
                                &sibling,
                                &remote.owner,
                            )?;
                        }
                    }
                } else {
                    let version = self
                        .nodes
                        .get(&re.from)
                        .map(|n| n.clock.get(&remote.owner) + 1)
                        .unwrap_or(1);
                    self.add_edge_with_version(&re.from, &re.to, &re.label, &remote.owner, version)?;
                }
                dirty.extend([re.from.clone(), re.to.clone()]);
            }

            if let Some(local) = self.nodes.get_mut(id) {
                if local.clock != merged_clock || local.owner != merged_owner {
                    local.clock = merged_clock;
                    local.owner = merged_owner;
                    dirty.insert(id.clone());
                }
            }
        }

        self.normalize();

        if let Some(identity) = signer {
            for id in &dirty {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.sign(identity)?;
                }
            }
        }
        Ok(())
    }
}

fn clone_remote(remote: &Node) -> Node {
    let mut cloned = remote.clone();
    cloned.edges = Vec::new();
    cloned
}
