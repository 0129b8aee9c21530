use pretty_assertions::assert_eq;

use super::*;

#[test]
fn test_normalize_concept_name() {
    assert_eq!(normalize_concept_name("  Photosynthesis "), "photosynthesis");
    assert_eq!(normalize_concept_name("ATP Synthase"), "atp synthase");
    assert_eq!(normalize_concept_name("photosynthesis"), "photosynthesis");
}

#[test]
fn test_concept_new_sets_normalized_name() {
    let concept = Concept::new("  Cell Membrane ");
    assert_eq!(concept.name, "  Cell Membrane ");
    assert_eq!(concept.normalized_name, "cell membrane");
    assert!(!concept.id.is_empty());
}

#[test]
fn test_loop_phase_roundtrip() {
    let phases = [
        LoopPhase::PriorKnowledge,
        LoopPhase::Reading,
        LoopPhase::FirstAttempt,
        LoopPhase::FirstResults,
        LoopPhase::Learning,
        LoopPhase::SecondAttempt,
        LoopPhase::SecondResults,
        LoopPhase::Simplify,
        LoopPhase::SimplifyResults,
        LoopPhase::Complete,
    ];

    for phase in phases {
        let parsed: LoopPhase = phase.to_string().parse().unwrap();
        assert_eq!(parsed, phase);
    }

    assert!("sideways".parse::<LoopPhase>().is_err());
}

#[test]
fn test_loop_phase_ordering() {
    assert!(LoopPhase::PriorKnowledge.can_advance_to(LoopPhase::Reading));
    assert!(LoopPhase::FirstAttempt.can_advance_to(LoopPhase::Complete));
    assert!(!LoopPhase::Learning.can_advance_to(LoopPhase::FirstAttempt));
    assert!(!LoopPhase::Complete.can_advance_to(LoopPhase::Complete));
}

#[test]
fn test_attempt_kind_roundtrip() {
    assert_eq!(AttemptKind::FullExplanation.to_string(), "full_explanation");
    assert_eq!(
        "simplify_challenge".parse::<AttemptKind>().unwrap(),
        AttemptKind::SimplifyChallenge
    );
    assert_eq!(
        "quick_review".parse::<AttemptKind>().unwrap(),
        AttemptKind::QuickReview
    );
    assert!("freestyle".parse::<AttemptKind>().is_err());
}

#[test]
fn test_importance_and_relationship_kind_roundtrip() {
    for importance in [Importance::Core, Importance::Supporting, Importance::Detail] {
        assert_eq!(
            importance.to_string().parse::<Importance>().unwrap(),
            importance
        );
    }

    for kind in [
        RelationshipKind::Causes,
        RelationshipKind::Enables,
        RelationshipKind::Exemplifies,
        RelationshipKind::Contrasts,
        RelationshipKind::Prerequisite,
    ] {
        assert_eq!(
            kind.to_string().parse::<RelationshipKind>().unwrap(),
            kind
        );
    }
}

#[test]
fn test_new_loop_first_chunk_starts_at_prior_knowledge() {
    let first = LearningLoop::new("user-1", "chapter one", PrecisionMode::Balanced, true);
    assert_eq!(first.phase, LoopPhase::PriorKnowledge);
    assert_eq!(first.status, LoopStatus::InProgress);

    let later = LearningLoop::new("user-1", "chapter two", PrecisionMode::Balanced, false);
    assert_eq!(later.phase, LoopPhase::FirstAttempt);
}

#[test]
fn test_session_address_is_duplicate_safe() {
    let mut session = SocraticSession::new(
        "loop-1",
        vec!["Osmosis".to_string(), "Diffusion".to_string()],
    );

    assert!(session.address("osmosis"));
    assert!(!session.address("Osmosis"), "re-adding must be a no-op");
    assert_eq!(session.addressed_concepts.len(), 1);
    assert!(!session.is_complete());

    assert!(session.address("  DIFFUSION "));
    assert!(session.is_complete());
}

#[test]
fn test_session_completion_is_set_containment() {
    let mut session = SocraticSession::new("loop-1", vec!["A".to_string(), "B".to_string()]);

    // Extra addressed concepts outside the target list do not matter.
    session.address("C");
    session.address("B");
    assert!(!session.is_complete());
    assert_eq!(session.remaining_concepts(), vec!["A".to_string()]);

    session.address("a");
    assert!(session.is_complete());
    assert!(session.remaining_concepts().is_empty());
}

#[test]
fn test_review_schedule_new() {
    let schedule = ReviewSchedule::new("user-1", "loop-1", 3);
    assert_eq!(schedule.interval_days, 3);
    assert_eq!(schedule.times_reviewed, 0);
    assert_eq!(schedule.status, ReviewStatus::Scheduled);
    assert!(schedule.next_review_at > Utc::now() + Duration::days(2));
}

#[test]
fn test_concept_map_serde_roundtrip() {
    let map = ConceptMap {
        concepts: vec![KeyConcept {
            name: "Photosynthesis".to_string(),
            explanation: "Light to sugar".to_string(),
            importance: Importance::Core,
        }],
        relationships: vec![ConceptLink {
            from: "Light".to_string(),
            to: "Photosynthesis".to_string(),
            kind: RelationshipKind::Enables,
        }],
    };

    let json = serde_json::to_string(&map).unwrap();
    assert!(json.contains("\"core\""));
    assert!(json.contains("\"enables\""));

    let back: ConceptMap = serde_json::from_str(&json).unwrap();
    assert_eq!(back, map);
}
