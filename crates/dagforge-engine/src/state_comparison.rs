//! State comparison against a reference manifest
//!
//! Compares the current manifest against a previously written one (usually
//! production) to identify modified nodes and their downstream impact.

use dagforge_manifest::{DependencyGraph, Manifest, Node};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Reason why a node is considered modified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationReason {
    /// Node is new (not in the reference manifest)
    New,
    /// File content changed (checksum different)
    BodyChanged,
    /// Unrendered config changed
    ConfigChanged,
    /// Resolved dependencies changed
    DependenciesChanged,
    /// Contract enforcement or declared columns changed
    ContractChanged,
    /// Node was deleted from the current manifest
    Deleted,
}

impl std::fmt::Display for ModificationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModificationReason::New => write!(f, "new node"),
            ModificationReason::BodyChanged => write!(f, "body changed"),
            ModificationReason::ConfigChanged => write!(f, "config changed"),
            ModificationReason::DependenciesChanged => write!(f, "dependencies changed"),
            ModificationReason::ContractChanged => write!(f, "contract changed"),
            ModificationReason::Deleted => write!(f, "deleted"),
        }
    }
}

/// A node that differs between the reference and current manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifiedNode {
    /// Unique ID of the node (e.g., "model.project.users")
    pub unique_id: String,
    pub name: String,
    /// Reasons why this node is considered modified
    pub reasons: Vec<ModificationReason>,
    /// Downstream nodes affected by this change (blast radius)
    pub downstream_impact: Vec<String>,
    pub downstream_count: usize,
}

/// Result of comparing current manifest against a reference manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateComparisonResult {
    /// Nodes that have been modified, new ones included
    pub modified_nodes: Vec<ModifiedNode>,
    /// Nodes not present in the reference manifest
    pub new_nodes: Vec<String>,
    /// Nodes present only in the reference manifest
    pub deleted_nodes: Vec<String>,
    /// Total blast radius (unique downstream nodes affected)
    pub total_blast_radius: usize,
    /// All affected node IDs (modified + their downstream)
    pub all_affected_nodes: BTreeSet<String>,
}

impl StateComparisonResult {
    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        !self.modified_nodes.is_empty() || !self.new_nodes.is_empty() || !self.deleted_nodes.is_empty()
    }

    /// Modified and new node IDs (for `state:modified` selection)
    pub fn modified_ids(&self) -> BTreeSet<String> {
        self.modified_nodes.iter().map(|m| m.unique_id.clone()).collect()
    }
}

/// Compares two manifests to identify changes
pub struct StateComparison;

impl StateComparison {
    /// Compare the current manifest against a reference manifest
    pub fn compare(current: &Manifest, reference: &Manifest) -> StateComparisonResult {
        let mut modified_nodes = Vec::new();
        let mut new_nodes = Vec::new();
        let mut deleted_nodes = Vec::new();
        let mut all_affected_nodes = BTreeSet::new();

        let graph = DependencyGraph::from_manifest(current);

        for (node_id, node) in &current.nodes {
            let reasons = match reference.nodes.get(node_id) {
                Some(previous) => Self::detect_modifications(node, previous),
                None => {
                    new_nodes.push(node_id.clone());
                    vec![ModificationReason::New]
                }
            };
            if reasons.is_empty() {
                continue;
            }

            let downstream: Vec<String> = graph.descendants(node_id, None).into_iter().collect();
            all_affected_nodes.insert(node_id.clone());
            all_affected_nodes.extend(downstream.iter().cloned());

            modified_nodes.push(ModifiedNode {
                unique_id: node_id.clone(),
                name: node.name.clone(),
                reasons,
                downstream_count: downstream.len(),
                downstream_impact: downstream,
            });
        }

        for node_id in reference.nodes.keys() {
            if !current.nodes.contains_key(node_id) {
                deleted_nodes.push(node_id.clone());
                all_affected_nodes.insert(node_id.clone());
            }
        }

        StateComparisonResult {
            modified_nodes,
            new_nodes,
            deleted_nodes,
            total_blast_radius: all_affected_nodes.len(),
            all_affected_nodes,
        }
    }

    /// Specific modifications between two versions of a node
    fn detect_modifications(current: &Node, previous: &Node) -> Vec<ModificationReason> {
        let mut reasons = Vec::new();

        if current.checksum != previous.checksum {
            reasons.push(ModificationReason::BodyChanged);
        }

        if current.unrendered_config != previous.unrendered_config {
            reasons.push(ModificationReason::ConfigChanged);
        }

        let current_deps: BTreeSet<_> = current.depends_on.nodes.iter().collect();
        let previous_deps: BTreeSet<_> = previous.depends_on.nodes.iter().collect();
        if current_deps != previous_deps {
            reasons.push(ModificationReason::DependenciesChanged);
        }

        if Self::contract_changed(current, previous) {
            reasons.push(ModificationReason::ContractChanged);
        }

        reasons
    }

    /// Enforcement toggled, or an enforced contract's column types changed
    fn contract_changed(current: &Node, previous: &Node) -> bool {
        let (now, before) = (&current.config.contract, &previous.config.contract);
        if now.enforced != before.enforced {
            return true;
        }
        if !now.enforced {
            return false;
        }
        if current.columns.len() != previous.columns.len() {
            return true;
        }
        current.columns.iter().any(|(name, column)| match previous.columns.get(name) {
            Some(old) => old.data_type != column.data_type,
            None => true,
        })
    }
}
