//! Mastery scoring and the loop-completion fold.
//!
//! Stored mastery is computed at fold time from lifetime counts and the
//! evidence quality of the current loop; display mastery additionally
//! decays with time since the concept was last seen. Decay is never
//! written back.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::concepts::ConceptLinker;
use crate::error::EngineResult;
use crate::storage::{
    normalize_concept_name, AttemptKind, ConceptMap, Demonstration, Importance, KeyConcept,
    LearningLoop, LoopAttempt, LoopPhase, LoopStatus, MasteryFold, RelationshipBump,
    SqliteStorage, Storage, UserConceptUpsert,
};

/// Strength added to an edge per completed loop demonstrating both endpoints.
pub const RELATIONSHIP_STRENGTH_DELTA: f64 = 1.0;

/// Display mastery at or above this is "mastered".
pub const MASTERED_THRESHOLD: i64 = 80;
/// Display mastery at or above this (and below mastered) is "learning".
pub const LEARNING_THRESHOLD: i64 = 40;

/// Weight of a concept's importance within its loop.
pub fn importance_weight(importance: Importance) -> f64 {
    match importance {
        Importance::Core => 1.15,
        Importance::Supporting => 1.00,
        Importance::Detail => 0.85,
    }
}

/// Weight of the phase in which a concept was demonstrated. Later-phase
/// evidence counts for more; `None` means no demonstration this loop.
pub fn phase_weight(phase: Option<LoopPhase>) -> f64 {
    match phase {
        Some(LoopPhase::Simplify) => 1.10,
        Some(LoopPhase::SecondAttempt) => 1.00,
        Some(LoopPhase::Learning) => 0.90,
        Some(LoopPhase::FirstAttempt) => 0.85,
        _ => 1.00,
    }
}

/// Stored mastery from lifetime counts plus this loop's evidence.
///
/// The demonstration ratio is scaled by the importance and phase weights
/// only when a demonstration happened; a plain encounter keeps the raw
/// ratio. Clamped to 0-100.
pub fn compute_mastery_score(
    times_encountered: i64,
    times_demonstrated: i64,
    importance: Importance,
    demonstrated_phase: Option<LoopPhase>,
) -> i64 {
    if times_encountered <= 0 {
        return 0;
    }

    let base = times_demonstrated as f64 / times_encountered as f64 * 100.0;
    let weighted = match demonstrated_phase {
        Some(_) => base * importance_weight(importance) * phase_weight(demonstrated_phase),
        None => base,
    };

    (weighted.round() as i64).clamp(0, 100)
}

const DECAY_TIERS: [(i64, f64); 4] = [(7, 1.00), (14, 0.90), (30, 0.75), (60, 0.50)];
const DECAY_FLOOR: f64 = 0.25;

/// Display decay multiplier for a concept last seen this many days ago.
/// A concept never seen decays to the floor.
pub fn decay_factor(days_since_seen: Option<i64>) -> f64 {
    match days_since_seen {
        Some(days) => DECAY_TIERS
            .iter()
            .find(|(limit, _)| days < *limit)
            .map(|(_, factor)| *factor)
            .unwrap_or(DECAY_FLOOR),
        None => DECAY_FLOOR,
    }
}

/// Display mastery: stored mastery scaled by time decay.
pub fn decayed_mastery(
    stored: i64,
    last_seen_at: Option<DateTime<Utc>>,
    as_of: DateTime<Utc>,
) -> i64 {
    let days = last_seen_at.map(|seen| (as_of - seen).num_days());
    (stored as f64 * decay_factor(days)).round() as i64
}

/// Phase credited for a demonstration observed in this attempt.
/// Quick reviews re-test old material and carry no phase credit.
pub fn attempt_phase(attempt: &LoopAttempt) -> Option<LoopPhase> {
    match attempt.kind {
        AttemptKind::SimplifyChallenge => Some(LoopPhase::Simplify),
        AttemptKind::FullExplanation => Some(if attempt.attempt_number >= 2 {
            LoopPhase::SecondAttempt
        } else {
            LoopPhase::FirstAttempt
        }),
        AttemptKind::QuickReview => None,
    }
}

/// Which of the loop's concepts the covered points refer to.
///
/// A point matches a concept by normalized exact equality, or by the
/// point containing the concept name ("explained how osmosis works"
/// covers "Osmosis"). Returns normalized concept names.
pub fn covered_concepts(points: &[String], concepts: &[KeyConcept]) -> HashSet<String> {
    let normalized_points: Vec<String> = points
        .iter()
        .map(|p| normalize_concept_name(p))
        .filter(|p| !p.is_empty())
        .collect();

    concepts
        .iter()
        .filter_map(|concept| {
            let key = normalize_concept_name(&concept.name);
            if key.is_empty() {
                return None;
            }
            let hit = normalized_points
                .iter()
                .any(|point| *point == key || point.contains(&key));
            hit.then_some(key)
        })
        .collect()
}

/// Folds a completed loop's evidence into the user's lasting mastery
/// records and the relationship graph.
#[derive(Clone)]
pub struct MasteryFolder {
    storage: SqliteStorage,
    linker: ConceptLinker,
}

impl MasteryFolder {
    /// Create a new folder.
    pub fn new(storage: SqliteStorage, linker: ConceptLinker) -> Self {
        Self { storage, linker }
    }

    /// Fold one completed loop. Computes the full write set, then applies
    /// it as a single transaction; the caller guarantees this runs at
    /// most once per loop.
    pub async fn fold_completion(&self, learning_loop: &LearningLoop) -> EngineResult<()> {
        let now = Utc::now();

        let mut loop_update = learning_loop.clone();
        loop_update.status = LoopStatus::Mastered;
        loop_update.phase = LoopPhase::Complete;
        loop_update.updated_at = now;

        if learning_loop.key_concepts.is_empty() {
            // Degraded or contentless loop: complete it without evidence.
            self.storage
                .apply_mastery_fold(&MasteryFold {
                    loop_update,
                    user_concepts: Vec::new(),
                    demonstrations: Vec::new(),
                    relationship_bumps: Vec::new(),
                })
                .await?;
            return Ok(());
        }

        let map = ConceptMap {
            concepts: learning_loop.key_concepts.clone(),
            relationships: learning_loop.concept_links.clone(),
        };
        let concept_ids = self
            .linker
            .ensure_loop_concepts(&learning_loop.id, &map)
            .await?;

        let attributed = self.attributed_phases(learning_loop).await?;

        let mut user_concepts = Vec::new();
        let mut demonstrations = Vec::new();
        let mut demonstrated_names = HashSet::new();

        for key_concept in &learning_loop.key_concepts {
            let normalized = normalize_concept_name(&key_concept.name);
            let Some(concept_id) = concept_ids.get(&normalized) else {
                continue;
            };

            let phase = attributed.get(&normalized).copied();
            let demonstrated = phase.is_some();

            let prior = self
                .storage
                .user_concept(&learning_loop.user_id, concept_id)
                .await?;
            let (prior_encountered, prior_demonstrated) = prior
                .map(|record| (record.times_encountered, record.times_demonstrated))
                .unwrap_or((0, 0));

            let times_encountered = prior_encountered + 1;
            let times_demonstrated = prior_demonstrated + i64::from(demonstrated);
            let mastery = compute_mastery_score(
                times_encountered,
                times_demonstrated,
                key_concept.importance,
                phase,
            );

            debug!(
                concept = %key_concept.name,
                demonstrated,
                mastery,
                "Folding concept evidence"
            );

            user_concepts.push(UserConceptUpsert {
                user_id: learning_loop.user_id.clone(),
                concept_id: concept_id.clone(),
                mastery,
                times_encountered,
                times_demonstrated,
                last_seen_at: now,
                last_demonstrated_at: demonstrated.then_some(now),
            });

            if let Some(phase) = phase {
                demonstrations.push(Demonstration {
                    loop_id: learning_loop.id.clone(),
                    concept_id: concept_id.clone(),
                    phase,
                    at: now,
                });
                demonstrated_names.insert(normalized);
            }
        }

        let mut relationship_bumps = Vec::new();
        for link in &learning_loop.concept_links {
            let from_key = normalize_concept_name(&link.from);
            let to_key = normalize_concept_name(&link.to);
            if !demonstrated_names.contains(&from_key) || !demonstrated_names.contains(&to_key) {
                continue;
            }
            let (Some(from_id), Some(to_id)) = (concept_ids.get(&from_key), concept_ids.get(&to_key))
            else {
                continue;
            };
            relationship_bumps.push(RelationshipBump {
                from_concept_id: from_id.clone(),
                to_concept_id: to_id.clone(),
                kind: link.kind,
                delta: RELATIONSHIP_STRENGTH_DELTA,
            });
        }

        let fold = MasteryFold {
            loop_update,
            user_concepts,
            demonstrations,
            relationship_bumps,
        };
        self.storage.apply_mastery_fold(&fold).await?;

        info!(
            loop_id = %learning_loop.id,
            concepts = fold.user_concepts.len(),
            demonstrated = fold.demonstrations.len(),
            bumps = fold.relationship_bumps.len(),
            "Folded loop completion"
        );

        Ok(())
    }

    /// Demonstration phase per concept, from the loop's best evidence:
    /// the latest attempt's covered points at that attempt's phase, plus
    /// Socratic-addressed concepts at the learning phase (which never
    /// overrides stronger attempt evidence).
    async fn attributed_phases(
        &self,
        learning_loop: &LearningLoop,
    ) -> EngineResult<HashMap<String, LoopPhase>> {
        let mut phases = HashMap::new();

        if let Some(attempt) = self.storage.latest_attempt(&learning_loop.id).await? {
            if let Some(phase) = attempt_phase(&attempt) {
                for name in covered_concepts(&attempt.covered_points, &learning_loop.key_concepts)
                {
                    phases.insert(name, phase);
                }
            }
        }

        if let Some(session) = self
            .storage
            .latest_session_for_loop(&learning_loop.id)
            .await?
        {
            for concept in &session.addressed_concepts {
                phases
                    .entry(normalize_concept_name(concept))
                    .or_insert(LoopPhase::Learning);
            }
        }

        Ok(phases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mastery_score_weighted_demonstration() {
        // 1 of 2 demonstrated, core concept, second attempt:
        // 50 * 1.15 * 1.00 = 57.5 -> 58
        assert_eq!(
            compute_mastery_score(2, 1, Importance::Core, Some(LoopPhase::SecondAttempt)),
            58
        );

        // Same counts, detail concept, learning phase:
        // 50 * 0.85 * 0.90 = 38.25 -> 38
        assert_eq!(
            compute_mastery_score(2, 1, Importance::Detail, Some(LoopPhase::Learning)),
            38
        );

        // 1 of 2 demonstrated, core concept, simplify phase:
        // 50 * 1.15 * 1.10 = 63.25 -> 63
        assert_eq!(
            compute_mastery_score(2, 1, Importance::Core, Some(LoopPhase::Simplify)),
            63
        );

        // 2 of 3 demonstrated, detail concept, learning phase:
        // 66.67 * 0.85 * 0.90 = 51.0 -> 51
        assert_eq!(
            compute_mastery_score(3, 2, Importance::Detail, Some(LoopPhase::Learning)),
            51
        );

        // 3 of 5 demonstrated, supporting concept, first attempt:
        // 60 * 1.00 * 0.85 = 51
        assert_eq!(
            compute_mastery_score(5, 3, Importance::Supporting, Some(LoopPhase::FirstAttempt)),
            51
        );
    }

    #[test]
    fn test_mastery_score_without_demonstration_is_unweighted() {
        // No demonstration this loop: raw ratio, no importance weight.
        assert_eq!(compute_mastery_score(2, 1, Importance::Core, None), 50);
        assert_eq!(compute_mastery_score(3, 0, Importance::Core, None), 0);
    }

    #[test]
    fn test_mastery_score_bounds() {
        assert_eq!(compute_mastery_score(0, 0, Importance::Core, None), 0);
        // 100 * 1.15 * 1.10 would be 127; clamped.
        assert_eq!(
            compute_mastery_score(1, 1, Importance::Core, Some(LoopPhase::Simplify)),
            100
        );
    }

    #[test]
    fn test_decay_tiers() {
        assert_eq!(decay_factor(Some(0)), 1.00);
        assert_eq!(decay_factor(Some(6)), 1.00);
        assert_eq!(decay_factor(Some(7)), 0.90);
        assert_eq!(decay_factor(Some(13)), 0.90);
        assert_eq!(decay_factor(Some(14)), 0.75);
        assert_eq!(decay_factor(Some(29)), 0.75);
        assert_eq!(decay_factor(Some(30)), 0.50);
        assert_eq!(decay_factor(Some(59)), 0.50);
        assert_eq!(decay_factor(Some(60)), 0.25);
        assert_eq!(decay_factor(Some(400)), 0.25);
        assert_eq!(decay_factor(None), 0.25);
    }

    #[test]
    fn test_decayed_mastery() {
        let now = Utc::now();
        assert_eq!(decayed_mastery(80, Some(now - chrono::Duration::days(3)), now), 80);
        assert_eq!(decayed_mastery(80, Some(now - chrono::Duration::days(20)), now), 60);
        assert_eq!(decayed_mastery(80, Some(now - chrono::Duration::days(90)), now), 20);
        assert_eq!(decayed_mastery(80, None, now), 20);
    }

    #[test]
    fn test_attempt_phase_classification() {
        let first = LoopAttempt::new("l", 1, AttemptKind::FullExplanation, "t");
        assert_eq!(attempt_phase(&first), Some(LoopPhase::FirstAttempt));

        let second = LoopAttempt::new("l", 2, AttemptKind::FullExplanation, "t");
        assert_eq!(attempt_phase(&second), Some(LoopPhase::SecondAttempt));

        let simplify = LoopAttempt::new("l", 3, AttemptKind::SimplifyChallenge, "t");
        assert_eq!(attempt_phase(&simplify), Some(LoopPhase::Simplify));

        let review = LoopAttempt::new("l", 4, AttemptKind::QuickReview, "t");
        assert_eq!(attempt_phase(&review), None);
    }

    #[test]
    fn test_covered_concepts_matching() {
        let concepts = vec![
            KeyConcept {
                name: "Osmosis".to_string(),
                explanation: String::new(),
                importance: Importance::Core,
            },
            KeyConcept {
                name: "Turgor Pressure".to_string(),
                explanation: String::new(),
                importance: Importance::Supporting,
            },
        ];

        let points = vec![
            "osmosis".to_string(),
            "explained how turgor pressure keeps plants rigid".to_string(),
        ];
        let covered = covered_concepts(&points, &concepts);
        assert!(covered.contains("osmosis"));
        assert!(covered.contains("turgor pressure"));

        let points = vec!["something unrelated".to_string()];
        assert!(covered_concepts(&points, &concepts).is_empty());
    }
}
