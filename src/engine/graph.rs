use chrono::{DateTime, Utc};
use serde::Serialize;

use super::mastery::{decayed_mastery, LEARNING_THRESHOLD, MASTERED_THRESHOLD};
use crate::error::{EngineError, EngineResult};
use crate::storage::{
    Concept, ConceptRelationship, RelationshipKind, SqliteStorage, Storage, UserConcept,
};

/// One concept in the user's knowledge graph, with display mastery.
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    /// Concept ID.
    pub concept_id: String,
    /// Display name.
    pub name: String,
    /// Optional category.
    pub category: Option<String>,
    /// Decayed display mastery (0-100).
    pub mastery: i64,
    /// Lifetime encounter count.
    pub times_encountered: i64,
    /// When the user last saw the concept.
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// One edge in the user's knowledge graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    /// Source concept ID.
    pub from_concept_id: String,
    /// Target concept ID.
    pub to_concept_id: String,
    /// Relationship type.
    pub kind: RelationshipKind,
    /// Accumulated strength.
    pub strength: f64,
}

impl From<ConceptRelationship> for GraphEdge {
    fn from(edge: ConceptRelationship) -> Self {
        Self {
            from_concept_id: edge.from_concept_id,
            to_concept_id: edge.to_concept_id,
            kind: edge.kind,
            strength: edge.strength,
        }
    }
}

/// Aggregate mastery statistics over a set of graph nodes.
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    /// Number of concepts.
    pub total_concepts: usize,
    /// Mean display mastery; 0 when the graph is empty.
    pub average_mastery: f64,
    /// Concepts at or above the mastered threshold.
    pub mastered: usize,
    /// Concepts between the learning and mastered thresholds.
    pub learning: usize,
    /// Concepts below the learning threshold.
    pub fresh: usize,
}

/// The user's full knowledge graph.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeGraphView {
    /// Concepts the user has encountered.
    pub nodes: Vec<GraphNode>,
    /// Relationships among them.
    pub edges: Vec<GraphEdge>,
    /// Aggregate statistics.
    pub stats: GraphStats,
}

/// One concept with the user's full record and its relationships.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptDetail {
    /// The concept.
    pub concept: Concept,
    /// The user's aggregate record.
    pub stats: UserConcept,
    /// Decayed display mastery.
    pub displayed_mastery: i64,
    /// Relationships touching the concept, in either direction.
    pub relationships: Vec<GraphEdge>,
}

/// Cross-loop progress summary.
#[derive(Debug, Clone, Serialize)]
pub struct Insights {
    /// Graph-wide mastery statistics.
    pub stats: GraphStats,
    /// Total loops the user has created.
    pub loops_total: i64,
    /// Loops completed to mastery.
    pub loops_mastered: i64,
    /// Review schedules due right now.
    pub reviews_due: usize,
}

/// Read side of the concept store: graph view, concept detail, insights.
#[derive(Clone)]
pub struct KnowledgeGraph {
    storage: SqliteStorage,
}

impl KnowledgeGraph {
    /// Create a new graph reader.
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// The user's knowledge graph with decayed display mastery.
    pub async fn view(&self, user_id: &str) -> EngineResult<KnowledgeGraphView> {
        let now = Utc::now();
        let known = self.storage.known_concepts(user_id).await?;

        let nodes: Vec<GraphNode> = known
            .into_iter()
            .map(|record| GraphNode {
                mastery: decayed_mastery(record.stats.mastery, record.stats.last_seen_at, now),
                concept_id: record.concept.id,
                name: record.concept.name,
                category: record.concept.category,
                times_encountered: record.stats.times_encountered,
                last_seen_at: record.stats.last_seen_at,
            })
            .collect();

        let edges = self
            .storage
            .relationships_known_to_user(user_id)
            .await?
            .into_iter()
            .map(GraphEdge::from)
            .collect();

        let stats = compute_stats(&nodes);
        Ok(KnowledgeGraphView {
            nodes,
            edges,
            stats,
        })
    }

    /// One concept with the user's record and its relationships.
    pub async fn concept_detail(
        &self,
        user_id: &str,
        concept_id: &str,
    ) -> EngineResult<ConceptDetail> {
        let stats = self
            .storage
            .user_concept(user_id, concept_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Concept", concept_id))?;
        let concept = self
            .storage
            .get_concept(concept_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Concept", concept_id))?;

        let relationships = self
            .storage
            .relationships_touching(concept_id)
            .await?
            .into_iter()
            .map(GraphEdge::from)
            .collect();

        let displayed_mastery = decayed_mastery(stats.mastery, stats.last_seen_at, Utc::now());
        Ok(ConceptDetail {
            concept,
            stats,
            displayed_mastery,
            relationships,
        })
    }

    /// Cross-loop progress summary for the user.
    pub async fn insights(&self, user_id: &str) -> EngineResult<Insights> {
        let view = self.view(user_id).await?;
        let loops_total = self.storage.count_loops(user_id).await?;
        let loops_mastered = self.storage.count_mastered_loops(user_id).await?;
        let reviews_due = self
            .storage
            .due_schedules(user_id, Utc::now())
            .await?
            .len();

        Ok(Insights {
            stats: view.stats,
            loops_total,
            loops_mastered,
            reviews_due,
        })
    }
}

/// Bucketed statistics over decayed display mastery.
pub fn compute_stats(nodes: &[GraphNode]) -> GraphStats {
    let total_concepts = nodes.len();
    let average_mastery = if total_concepts == 0 {
        0.0
    } else {
        nodes.iter().map(|n| n.mastery as f64).sum::<f64>() / total_concepts as f64
    };

    let mastered = nodes
        .iter()
        .filter(|n| n.mastery >= MASTERED_THRESHOLD)
        .count();
    let learning = nodes
        .iter()
        .filter(|n| n.mastery >= LEARNING_THRESHOLD && n.mastery < MASTERED_THRESHOLD)
        .count();
    let fresh = total_concepts - mastered - learning;

    GraphStats {
        total_concepts,
        average_mastery,
        mastered,
        learning,
        fresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(mastery: i64) -> GraphNode {
        GraphNode {
            concept_id: "c".to_string(),
            name: "n".to_string(),
            category: None,
            mastery,
            times_encountered: 1,
            last_seen_at: None,
        }
    }

    #[test]
    fn test_compute_stats_buckets() {
        let nodes = vec![node(95), node(80), node(79), node(40), node(39), node(0)];
        let stats = compute_stats(&nodes);
        assert_eq!(stats.total_concepts, 6);
        assert_eq!(stats.mastered, 2);
        assert_eq!(stats.learning, 2);
        assert_eq!(stats.fresh, 2);
        assert!((stats.average_mastery - 55.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_compute_stats_empty() {
        let stats = compute_stats(&[]);
        assert_eq!(stats.total_concepts, 0);
        assert_eq!(stats.average_mastery, 0.0);
    }
}
