//! Deferral to a reference manifest
//!
//! Unselected upstream nodes can be read from another environment's
//! relations. Only `defer_relation` is touched; edges never change.

use dagforge_manifest::{DeferRelation, Manifest};

/// Copy relation coordinates from `other` for refable, non-ephemeral nodes
/// present in both manifests. Returns how many nodes were updated.
pub fn merge_from_artifact(manifest: &mut Manifest, other: &Manifest) -> usize {
    let mut merged = 0;
    for (unique_id, node) in manifest.nodes.iter_mut() {
        if !node.is_refable() || node.is_ephemeral() {
            continue;
        }
        let Some(theirs) = other.nodes.get(unique_id) else {
            continue;
        };
        if theirs.is_ephemeral() {
            continue;
        }
        node.defer_relation = Some(DeferRelation {
            database: theirs.database.clone(),
            schema: theirs.schema.clone(),
            alias: theirs.alias.clone(),
            relation_name: theirs.relation_name.clone(),
        });
        merged += 1;
    }
    tracing::info!(merged, "Merged defer relations from reference manifest");
    merged
}
