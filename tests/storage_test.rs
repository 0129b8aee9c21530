//! Integration tests for the SQLite storage layer
//!
//! Tests database operations using an in-memory SQLite database.

use chrono::{Duration, Utc};

use teachback_engine::storage::{
    AttemptKind, Concept, ConceptRelationship, Demonstration, Importance, LearningLoop,
    LoopAttempt, LoopConcept, LoopPhase, LoopStatus, MasteryFold, MessageRole, PrecisionMode,
    RelationshipBump, RelationshipKind, ReviewSchedule, ReviewStatus, SocraticSession,
    SqliteStorage, Storage, UserConceptUpsert,
};

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

#[cfg(test)]
mod file_backed_tests {
    use super::*;
    use teachback_engine::config::DatabaseConfig;

    #[tokio::test]
    async fn test_file_backed_storage_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested/teachback.db"),
            max_connections: 2,
        };

        let storage = SqliteStorage::new(&config).await.unwrap();
        let concept = Concept::new("Osmosis");
        storage.create_concept(&concept).await.unwrap();

        // Reopening the same file sees the migrated schema and the data.
        let reopened = SqliteStorage::new(&config).await.unwrap();
        let found = reopened
            .find_concept_by_normalized_name("osmosis")
            .await
            .unwrap();
        assert!(found.is_some());
    }
}

#[cfg(test)]
mod concept_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_find_concept() {
        let storage = create_test_storage().await;

        let concept = Concept::new("Photosynthesis").with_description("Light to sugar");
        storage.create_concept(&concept).await.unwrap();

        let by_id = storage.get_concept(&concept.id).await.unwrap().unwrap();
        assert_eq!(by_id.name, "Photosynthesis");
        assert_eq!(by_id.description.as_deref(), Some("Light to sugar"));

        let by_name = storage
            .find_concept_by_normalized_name("photosynthesis")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, concept.id);
    }

    #[tokio::test]
    async fn test_duplicate_normalized_name_keeps_first_row() {
        let storage = create_test_storage().await;

        let first = Concept::new("Osmosis");
        storage.create_concept(&first).await.unwrap();

        // Same dedup key; the insert is silently ignored.
        let second = Concept::new("  OSMOSIS ");
        storage.create_concept(&second).await.unwrap();

        let found = storage
            .find_concept_by_normalized_name("osmosis")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.name, "Osmosis");
    }

    #[tokio::test]
    async fn test_get_nonexistent_concept() {
        let storage = create_test_storage().await;
        let result = storage.get_concept("missing").await.unwrap();
        assert!(result.is_none());
    }
}

#[cfg(test)]
mod relationship_tests {
    use super::*;

    async fn two_concepts(storage: &SqliteStorage) -> (Concept, Concept) {
        let a = Concept::new("Osmosis");
        let b = Concept::new("Turgor Pressure");
        storage.create_concept(&a).await.unwrap();
        storage.create_concept(&b).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_ensure_relationship_is_idempotent() {
        let storage = create_test_storage().await;
        let (a, b) = two_concepts(&storage).await;

        let edge = ConceptRelationship::new(&a.id, &b.id, RelationshipKind::Causes);
        storage.ensure_relationship(&edge).await.unwrap();

        // Re-ensuring leaves the existing edge untouched.
        let again = ConceptRelationship::new(&a.id, &b.id, RelationshipKind::Causes);
        storage.ensure_relationship(&again).await.unwrap();

        let stored = storage
            .get_relationship(&a.id, &b.id, RelationshipKind::Causes)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, edge.id);
        assert_eq!(stored.strength, 1.0);
    }

    #[tokio::test]
    async fn test_distinct_kinds_are_distinct_edges() {
        let storage = create_test_storage().await;
        let (a, b) = two_concepts(&storage).await;

        storage
            .ensure_relationship(&ConceptRelationship::new(
                &a.id,
                &b.id,
                RelationshipKind::Causes,
            ))
            .await
            .unwrap();
        storage
            .ensure_relationship(&ConceptRelationship::new(
                &a.id,
                &b.id,
                RelationshipKind::Enables,
            ))
            .await
            .unwrap();

        let touching = storage.relationships_touching(&a.id).await.unwrap();
        assert_eq!(touching.len(), 2);
    }
}

#[cfg(test)]
mod loop_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_loop() {
        let storage = create_test_storage().await;

        let learning_loop =
            LearningLoop::new("user-1", "Osmosis is...", PrecisionMode::Balanced, false)
                .with_subject("biology");
        storage.create_loop(&learning_loop).await.unwrap();

        let stored = storage.get_loop(&learning_loop.id).await.unwrap().unwrap();
        assert_eq!(stored.user_id, "user-1");
        assert_eq!(stored.subject.as_deref(), Some("biology"));
        assert_eq!(stored.phase, LoopPhase::FirstAttempt);
        assert_eq!(stored.status, LoopStatus::InProgress);
        assert!(!stored.extraction_degraded);
    }

    #[tokio::test]
    async fn test_update_loop_roundtrips_concepts() {
        let storage = create_test_storage().await;

        let mut learning_loop =
            LearningLoop::new("user-1", "Osmosis is...", PrecisionMode::Precise, true);
        storage.create_loop(&learning_loop).await.unwrap();

        learning_loop.key_concepts = vec![teachback_engine::storage::KeyConcept {
            name: "Osmosis".to_string(),
            explanation: "Water moves across a membrane".to_string(),
            importance: Importance::Core,
        }];
        learning_loop.concept_links = vec![teachback_engine::storage::ConceptLink {
            from: "Osmosis".to_string(),
            to: "Turgor Pressure".to_string(),
            kind: RelationshipKind::Causes,
        }];
        learning_loop.phase = LoopPhase::Reading;
        storage.update_loop(&learning_loop).await.unwrap();

        let stored = storage.get_loop(&learning_loop.id).await.unwrap().unwrap();
        assert_eq!(stored.key_concepts.len(), 1);
        assert_eq!(stored.key_concepts[0].importance, Importance::Core);
        assert_eq!(stored.concept_links[0].kind, RelationshipKind::Causes);
        assert_eq!(stored.phase, LoopPhase::Reading);
        assert_eq!(stored.precision_mode, PrecisionMode::Precise);
    }

    #[tokio::test]
    async fn test_update_missing_loop_fails() {
        let storage = create_test_storage().await;
        let ghost = LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        let result = storage.update_loop(&ghost).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_loop_counts() {
        let storage = create_test_storage().await;

        let mut a = LearningLoop::new("user-1", "a", PrecisionMode::Balanced, false);
        let b = LearningLoop::new("user-1", "b", PrecisionMode::Balanced, false);
        let other = LearningLoop::new("user-2", "c", PrecisionMode::Balanced, false);
        storage.create_loop(&a).await.unwrap();
        storage.create_loop(&b).await.unwrap();
        storage.create_loop(&other).await.unwrap();

        a.status = LoopStatus::Mastered;
        storage.update_loop(&a).await.unwrap();

        assert_eq!(storage.count_loops("user-1").await.unwrap(), 2);
        assert_eq!(storage.count_mastered_loops("user-1").await.unwrap(), 1);
        assert_eq!(storage.count_loops("user-3").await.unwrap(), 0);
    }
}

#[cfg(test)]
mod loop_concept_tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_loop_concept_is_idempotent() {
        let storage = create_test_storage().await;

        let concept = Concept::new("Osmosis");
        storage.create_concept(&concept).await.unwrap();
        let learning_loop = LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        storage.create_loop(&learning_loop).await.unwrap();

        let link = LoopConcept::new(&learning_loop.id, &concept.id, Importance::Core);
        storage.upsert_loop_concept(&link).await.unwrap();
        storage.upsert_loop_concept(&link).await.unwrap();

        let links = storage.loop_concepts(&learning_loop.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(!links[0].demonstrated);
    }
}

#[cfg(test)]
mod attempt_tests {
    use super::*;

    #[tokio::test]
    async fn test_record_attempt_advances_loop_atomically() {
        let storage = create_test_storage().await;

        let mut learning_loop =
            LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        storage.create_loop(&learning_loop).await.unwrap();

        let mut attempt = LoopAttempt::new(
            &learning_loop.id,
            1,
            AttemptKind::FullExplanation,
            "my explanation",
        )
        .with_duration(95);
        attempt.score = 72;
        attempt.coverage = 0.8;
        attempt.covered_points = vec!["Osmosis".to_string()];
        attempt.missed_points = vec!["Turgor Pressure".to_string()];
        attempt.feedback = "Good start".to_string();

        learning_loop.phase = LoopPhase::FirstResults;
        storage
            .record_attempt(&attempt, &learning_loop)
            .await
            .unwrap();

        let stored_attempt = storage.get_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored_attempt.score, 72);
        assert_eq!(stored_attempt.duration_seconds, Some(95));
        assert_eq!(stored_attempt.missed_points, vec!["Turgor Pressure"]);

        let stored_loop = storage.get_loop(&learning_loop.id).await.unwrap().unwrap();
        assert_eq!(stored_loop.phase, LoopPhase::FirstResults);
    }

    #[tokio::test]
    async fn test_latest_attempt_and_ordering() {
        let storage = create_test_storage().await;

        let learning_loop = LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        storage.create_loop(&learning_loop).await.unwrap();

        for number in 1..=3 {
            let attempt = LoopAttempt::new(
                &learning_loop.id,
                number,
                AttemptKind::FullExplanation,
                format!("attempt {}", number),
            );
            storage
                .record_attempt(&attempt, &learning_loop)
                .await
                .unwrap();
        }

        let attempts = storage.attempts_for_loop(&learning_loop.id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].attempt_number, 1);

        let latest = storage
            .latest_attempt(&learning_loop.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.attempt_number, 3);
    }

    #[tokio::test]
    async fn test_count_attempts_since() {
        let storage = create_test_storage().await;

        let learning_loop = LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        storage.create_loop(&learning_loop).await.unwrap();
        let attempt = LoopAttempt::new(&learning_loop.id, 1, AttemptKind::FullExplanation, "t");
        storage
            .record_attempt(&attempt, &learning_loop)
            .await
            .unwrap();

        let recent = storage
            .count_attempts_since("user-1", Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent, 1);

        let future = storage
            .count_attempts_since("user-1", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(future, 0);

        let other_user = storage
            .count_attempts_since("user-2", Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(other_user, 0);
    }
}

#[cfg(test)]
mod mastery_fold_tests {
    use super::*;

    struct FoldFixture {
        learning_loop: LearningLoop,
        osmosis: Concept,
        turgor: Concept,
    }

    async fn setup(storage: &SqliteStorage) -> FoldFixture {
        let learning_loop = LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        storage.create_loop(&learning_loop).await.unwrap();

        let osmosis = Concept::new("Osmosis");
        let turgor = Concept::new("Turgor Pressure");
        storage.create_concept(&osmosis).await.unwrap();
        storage.create_concept(&turgor).await.unwrap();
        for concept in [&osmosis, &turgor] {
            storage
                .upsert_loop_concept(&LoopConcept::new(
                    &learning_loop.id,
                    &concept.id,
                    Importance::Core,
                ))
                .await
                .unwrap();
        }
        storage
            .ensure_relationship(&ConceptRelationship::new(
                &osmosis.id,
                &turgor.id,
                RelationshipKind::Causes,
            ))
            .await
            .unwrap();

        FoldFixture {
            learning_loop,
            osmosis,
            turgor,
        }
    }

    fn fold_for(fixture: &FoldFixture, now: chrono::DateTime<Utc>) -> MasteryFold {
        let mut loop_update = fixture.learning_loop.clone();
        loop_update.status = LoopStatus::Mastered;
        loop_update.phase = LoopPhase::Complete;

        MasteryFold {
            loop_update,
            user_concepts: vec![
                UserConceptUpsert {
                    user_id: "user-1".to_string(),
                    concept_id: fixture.osmosis.id.clone(),
                    mastery: 58,
                    times_encountered: 2,
                    times_demonstrated: 1,
                    last_seen_at: now,
                    last_demonstrated_at: Some(now),
                },
                UserConceptUpsert {
                    user_id: "user-1".to_string(),
                    concept_id: fixture.turgor.id.clone(),
                    mastery: 50,
                    times_encountered: 1,
                    times_demonstrated: 1,
                    last_seen_at: now,
                    last_demonstrated_at: Some(now),
                },
            ],
            demonstrations: vec![Demonstration {
                loop_id: fixture.learning_loop.id.clone(),
                concept_id: fixture.osmosis.id.clone(),
                phase: LoopPhase::SecondAttempt,
                at: now,
            }],
            relationship_bumps: vec![RelationshipBump {
                from_concept_id: fixture.osmosis.id.clone(),
                to_concept_id: fixture.turgor.id.clone(),
                kind: RelationshipKind::Causes,
                delta: 1.0,
            }],
        }
    }

    #[tokio::test]
    async fn test_apply_mastery_fold() {
        let storage = create_test_storage().await;
        let fixture = setup(&storage).await;
        let now = Utc::now();

        storage
            .apply_mastery_fold(&fold_for(&fixture, now))
            .await
            .unwrap();

        let stored_loop = storage
            .get_loop(&fixture.learning_loop.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_loop.status, LoopStatus::Mastered);
        assert_eq!(stored_loop.phase, LoopPhase::Complete);

        let record = storage
            .user_concept("user-1", &fixture.osmosis.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.mastery, 58);
        assert_eq!(record.times_encountered, 2);
        assert_eq!(record.times_demonstrated, 1);
        assert!(record.last_demonstrated_at.is_some());

        let links = storage
            .loop_concepts(&fixture.learning_loop.id)
            .await
            .unwrap();
        let demonstrated: Vec<_> = links.iter().filter(|l| l.demonstrated).collect();
        assert_eq!(demonstrated.len(), 1);
        assert_eq!(demonstrated[0].concept_id, fixture.osmosis.id);
        assert_eq!(
            demonstrated[0].demonstrated_phase,
            Some(LoopPhase::SecondAttempt)
        );

        // Strength 1.0 from sync, +1.0 from the fold.
        let edge = storage
            .get_relationship(&fixture.osmosis.id, &fixture.turgor.id, RelationshipKind::Causes)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edge.strength, 2.0);
    }

    #[tokio::test]
    async fn test_fold_upsert_overwrites_aggregates() {
        let storage = create_test_storage().await;
        let fixture = setup(&storage).await;
        let now = Utc::now();

        storage
            .apply_mastery_fold(&fold_for(&fixture, now))
            .await
            .unwrap();

        // A later fold writes absolute values over the old row.
        let mut second = fold_for(&fixture, now);
        second.user_concepts[0].mastery = 77;
        second.user_concepts[0].times_encountered = 3;
        second.user_concepts[0].times_demonstrated = 2;
        second.demonstrations.clear();
        second.relationship_bumps.clear();
        storage.apply_mastery_fold(&second).await.unwrap();

        let record = storage
            .user_concept("user-1", &fixture.osmosis.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.mastery, 77);
        assert_eq!(record.times_encountered, 3);
    }

    #[tokio::test]
    async fn test_known_concepts_join() {
        let storage = create_test_storage().await;
        let fixture = setup(&storage).await;

        storage
            .apply_mastery_fold(&fold_for(&fixture, Utc::now()))
            .await
            .unwrap();

        let mut known = storage.known_concepts("user-1").await.unwrap();
        known.sort_by(|a, b| a.concept.name.cmp(&b.concept.name));
        assert_eq!(known.len(), 2);
        assert_eq!(known[0].concept.name, "Osmosis");
        assert_eq!(known[0].stats.mastery, 58);

        let edges = storage.relationships_known_to_user("user-1").await.unwrap();
        assert_eq!(edges.len(), 1);

        assert!(storage.known_concepts("user-2").await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_session_roundtrip_and_active_lookup() {
        let storage = create_test_storage().await;

        let learning_loop = LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        storage.create_loop(&learning_loop).await.unwrap();

        let mut session = SocraticSession::new(
            &learning_loop.id,
            vec!["Osmosis".to_string(), "Diffusion".to_string()],
        );
        session.push_message(MessageRole::Assistant, "What happens to the water?");
        storage.create_session(&session).await.unwrap();

        let active = storage
            .active_session_for_loop(&learning_loop.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, session.id);
        assert_eq!(active.messages.len(), 1);
        assert_eq!(active.messages[0].role, MessageRole::Assistant);

        session.address("Osmosis");
        session.push_message(MessageRole::User, "It moves into the cell");
        storage.update_session(&session).await.unwrap();

        let stored = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.addressed_concepts, vec!["Osmosis"]);
        assert_eq!(stored.messages.len(), 2);

        // Completed sessions disappear from the active lookup.
        session.status = teachback_engine::storage::SessionStatus::Completed;
        storage.update_session(&session).await.unwrap();
        assert!(storage
            .active_session_for_loop(&learning_loop.id)
            .await
            .unwrap()
            .is_none());

        let latest = storage
            .latest_session_for_loop(&learning_loop.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, session.id);
    }
}

#[cfg(test)]
mod schedule_tests {
    use super::*;

    #[tokio::test]
    async fn test_schedule_roundtrip_and_due_query() {
        let storage = create_test_storage().await;

        let learning_loop = LearningLoop::new("user-1", "text", PrecisionMode::Balanced, false);
        storage.create_loop(&learning_loop).await.unwrap();

        let mut schedule = ReviewSchedule::new("user-1", &learning_loop.id, 3);
        storage.create_schedule(&schedule).await.unwrap();

        let stored = storage
            .schedule_for_loop("user-1", &learning_loop.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.interval_days, 3);
        assert_eq!(stored.status, ReviewStatus::Scheduled);

        // Not due until the interval elapses.
        assert!(storage
            .due_schedules("user-1", Utc::now())
            .await
            .unwrap()
            .is_empty());
        let due = storage
            .due_schedules("user-1", Utc::now() + Duration::days(4))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        // Paused schedules never show up as due.
        schedule.status = ReviewStatus::Paused;
        storage.update_schedule(&schedule).await.unwrap();
        assert!(storage
            .due_schedules("user-1", Utc::now() + Duration::days(4))
            .await
            .unwrap()
            .is_empty());
    }
}
