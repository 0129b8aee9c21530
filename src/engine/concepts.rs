use std::collections::HashMap;

use tracing::debug;

use crate::error::EngineResult;
use crate::storage::{
    normalize_concept_name, Concept, ConceptMap, ConceptRelationship, LoopConcept, SqliteStorage,
    Storage,
};

/// Syncs a loop's extracted concept map into the durable concept store
/// and relationship graph.
#[derive(Clone)]
pub struct ConceptLinker {
    storage: SqliteStorage,
}

impl ConceptLinker {
    /// Create a new linker.
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Ensure every concept and relationship in the map exists in the
    /// store and is linked to the loop. Idempotent: re-running against
    /// the same map creates nothing new and never clobbers an existing
    /// link's demonstration state or an existing edge's strength.
    ///
    /// Returns the normalized-name to concept-id mapping for the loop's
    /// concepts. Relationships whose endpoints are not in the map are
    /// skipped; the graph never holds a dangling edge.
    pub async fn ensure_loop_concepts(
        &self,
        loop_id: &str,
        map: &ConceptMap,
    ) -> EngineResult<HashMap<String, String>> {
        debug!(
            loop_id = %loop_id,
            concepts = map.concepts.len(),
            relationships = map.relationships.len(),
            "Syncing loop concepts"
        );

        let mut concept_ids = HashMap::new();

        for key_concept in &map.concepts {
            let normalized = normalize_concept_name(&key_concept.name);
            if normalized.is_empty() {
                continue;
            }

            let concept = match self
                .storage
                .find_concept_by_normalized_name(&normalized)
                .await?
            {
                Some(existing) => existing,
                None => {
                    let mut fresh = Concept::new(key_concept.name.trim());
                    if !key_concept.explanation.is_empty() {
                        fresh = fresh.with_description(&key_concept.explanation);
                    }
                    self.storage.create_concept(&fresh).await?;
                    // A concurrent insert of the same name may have won;
                    // the stored row is canonical either way.
                    self.storage
                        .find_concept_by_normalized_name(&normalized)
                        .await?
                        .unwrap_or(fresh)
                }
            };

            let link = LoopConcept::new(loop_id, &concept.id, key_concept.importance)
                .with_explanation(&key_concept.explanation);
            self.storage.upsert_loop_concept(&link).await?;

            concept_ids.insert(normalized, concept.id);
        }

        for link in &map.relationships {
            let from = concept_ids.get(&normalize_concept_name(&link.from));
            let to = concept_ids.get(&normalize_concept_name(&link.to));
            let (Some(from_id), Some(to_id)) = (from, to) else {
                debug!(
                    from = %link.from,
                    to = %link.to,
                    "Skipping relationship with unknown endpoint"
                );
                continue;
            };
            if from_id == to_id {
                continue;
            }

            let edge = ConceptRelationship::new(from_id, to_id, link.kind);
            self.storage.ensure_relationship(&edge).await?;
        }

        Ok(concept_ids)
    }
}
