//! Contract extraction
//!
//! Collects the declared columns of models whose `contract.enforced` is set.
//! The compiler compares them with the columns projected by compiled SQL.

use crate::manifest::Manifest;
use crate::node::Node;
use std::collections::BTreeMap;

/// A declared contract column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredColumn {
    pub name: String,
    pub data_type: Option<String>,
}

/// Columns a model promises to produce, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredContract {
    pub unique_id: String,
    pub columns: Vec<DeclaredColumn>,
}

impl DeclaredContract {
    /// Lowercased column names, for case-insensitive comparison
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.to_lowercase()).collect()
    }
}

/// Extract contracts from manifest
pub struct ContractExtractor;

impl ContractExtractor {
    /// Extract all enforced contracts
    pub fn extract_all(manifest: &Manifest) -> BTreeMap<String, DeclaredContract> {
        manifest
            .models()
            .filter_map(|node| Self::extract_from_node(node).map(|c| (node.unique_id.clone(), c)))
            .collect()
    }

    /// Extract contract from a single node
    pub fn extract_from_node(node: &Node) -> Option<DeclaredContract> {
        if !node.config.contract.enforced {
            return None;
        }

        let columns = node
            .columns
            .values()
            .map(|col| DeclaredColumn {
                name: col.name.clone(),
                data_type: col.data_type.as_deref().map(normalize_data_type),
            })
            .collect();

        Some(DeclaredContract {
            unique_id: node.unique_id.clone(),
            columns,
        })
    }
}

/// Canonical spelling of common type aliases
pub fn normalize_data_type(data_type: &str) -> String {
    let lower = data_type.trim().to_lowercase();
    match lower.as_str() {
        "int" | "integer" | "int4" => "integer".to_string(),
        "bigint" | "int8" | "int64" => "bigint".to_string(),
        "float" | "float8" | "double" | "double precision" | "float64" => "double".to_string(),
        "bool" | "boolean" => "boolean".to_string(),
        "varchar" | "text" | "string" | "character varying" => "text".to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ColumnInfo, ContractConfig, NodeConfig, ResourceType};

    #[test]
    fn only_enforced_contracts_are_extracted() {
        let mut manifest = Manifest::default();
        let mut enforced = Node::new(ResourceType::Model, "p", "a", "models/a.sql").with_config(NodeConfig {
            contract: ContractConfig {
                enforced: true,
                alias_types: true,
            },
            ..NodeConfig::default()
        });
        enforced.columns.insert(
            "id".to_string(),
            ColumnInfo {
                name: "id".to_string(),
                data_type: Some("INT".to_string()),
                ..ColumnInfo::default()
            },
        );
        manifest.add_node(enforced).unwrap();
        manifest
            .add_node(Node::new(ResourceType::Model, "p", "b", "models/b.sql"))
            .unwrap();

        let contracts = ContractExtractor::extract_all(&manifest);
        assert_eq!(contracts.len(), 1);
        let contract = &contracts["model.p.a"];
        assert_eq!(contract.column_names(), vec!["id"]);
        assert_eq!(contract.columns[0].data_type.as_deref(), Some("integer"));
    }
}
