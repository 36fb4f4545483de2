use std::collections::{BTreeMap, BTreeSet};

use contracts::{
    BehaviorCall, BehaviorKind, DecisionRecord, DecisionStatus, EntityId, EntityState, Goal,
    Inventory, KindCatalog, LearnerConfig, Trace, WorldSnapshot,
};
use learner_core::interaction::extract_interactions;
use learner_core::outcome::{
    effects_subsume, outcome_intersection, partition_is_disjoint, update_outcomes, Effect, Outcome,
};
use learner_core::policy::{bin_sort, rank, RankedCandidate};
use learner_core::signature::StateSignature;
use learner_core::GraphTrainer;
use proptest::prelude::*;

fn small_config() -> LearnerConfig {
    LearnerConfig {
        min_support: 2,
        validation_folds: 3,
        ..LearnerConfig::default()
    }
}

fn entity(kind: u32, x: f64) -> EntityState {
    EntityState {
        kind,
        x,
        y: 0.0,
        hp: 4.0,
    }
}

fn snapshot_at(clock: f64, wood: u32) -> WorldSnapshot {
    WorldSnapshot {
        clock,
        entities: BTreeMap::from([(1, entity(1, 0.0)), (50, entity(1000, 10.0))]),
        inventories: BTreeMap::from([(
            1,
            Inventory {
                items: if wood > 0 {
                    BTreeMap::from([(2000, wood)])
                } else {
                    BTreeMap::new()
                },
            },
        )]),
    }
}

fn gather_trace(count: u32) -> Trace {
    let mut trace = Trace::new("gather");
    for i in 0..count {
        let start = f64::from(i) * 2.0;
        trace.decisions.push(DecisionRecord::closed(
            BehaviorCall::targeted(BehaviorKind::Gather, 1, 50),
            Some(1),
            start,
            start + 1.0,
            DecisionStatus::Success,
        ));
        trace.snapshots.push(snapshot_at(start, i * 2));
        trace.snapshots.push(snapshot_at(start + 1.0, (i + 1) * 2));
    }
    let end = f64::from(count) * 2.0;
    trace.decisions.push(DecisionRecord::event(
        BehaviorCall::marker(BehaviorKind::Done),
        None,
        end,
    ));
    trace.snapshots.push(snapshot_at(end, count * 2));
    trace
}

#[test]
fn shared_target_groups_one_interaction_unrelated_starts_another() {
    let mut trace = Trace::new("grouping");
    trace.decisions.push(DecisionRecord::closed(
        BehaviorCall::targeted(BehaviorKind::Gather, 1, 100),
        Some(1),
        0.0,
        4.0,
        DecisionStatus::Success,
    ));
    trace.decisions.push(DecisionRecord::closed(
        BehaviorCall::targeted(BehaviorKind::Attack, 2, 100),
        Some(2),
        1.0,
        3.0,
        DecisionStatus::Success,
    ));
    trace.decisions.push(DecisionRecord::closed(
        BehaviorCall::targeted(BehaviorKind::Gather, 3, 200),
        Some(3),
        1.0,
        2.0,
        DecisionStatus::Success,
    ));

    let interactions = extract_interactions(&trace, 0.01);
    assert_eq!(interactions[0], vec![0, 1]);
    assert_eq!(interactions[1], vec![2]);
}

#[test]
fn wood_outcome_absorbs_differing_counts() {
    let mut outcomes: Vec<Outcome> = Vec::new();
    update_outcomes(
        &mut outcomes,
        vec![Effect::Obtain {
            item: 2000,
            count: 3,
        }],
    );
    update_outcomes(
        &mut outcomes,
        vec![Effect::Obtain {
            item: 2000,
            count: 5,
        }],
    );
    assert_eq!(outcomes.len(), 1);
    assert!(effects_subsume(
        &[Effect::Obtain {
            item: 2000,
            count: 5
        }],
        &outcomes[0].effects
    ));
}

#[test]
fn unseen_state_binds_absent_not_zeroed() {
    let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
    trainer.add_trace(&gather_trace(4));
    let graph = trainer.finalize();

    // an attack was never observed, so the state is absent rather than a
    // node full of zero-probability predictors
    let snapshot = snapshot_at(0.0, 0);
    let decisions = vec![DecisionRecord::open(
        BehaviorCall::targeted(BehaviorKind::Attack, 1, 50),
        Some(1),
        0.0,
    )];
    let signature = StateSignature::bind(1, &snapshot, &decisions);
    assert!(graph.bind_state(&signature).is_none());
}

#[test]
fn trained_corpus_ranks_observed_candidate() {
    let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
    trainer.add_trace(&gather_trace(6));
    let graph = trainer.finalize();

    let snapshot = snapshot_at(0.0, 0);
    let goals = vec![Goal::HasItem {
        item: 2000,
        count: 2,
        value: 1.0,
    }];
    let ranked = rank(&graph, 1, &snapshot, &[], &goals);

    assert!(!ranked.is_empty());
    let top = &ranked[0];
    assert_eq!(top.node_key, "(gather agent target)");
    assert!(top.value_ratio > 0.0);
    let call = top.call.as_ref().expect("instantiable behavior");
    assert_eq!(call.kind, BehaviorKind::Gather);
    assert_eq!(call.target_id(), Some(50));
}

#[test]
fn artifact_round_trips_and_still_binds() {
    let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
    trainer.add_trace(&gather_trace(4));
    let graph = trainer.finalize();

    let encoded = serde_json::to_string(&graph).expect("serialize");
    let decoded: learner_core::RuntimeGraph = serde_json::from_str(&encoded).expect("deserialize");
    assert_eq!(graph, decoded);

    let snapshot = snapshot_at(0.0, 0);
    let decisions = vec![DecisionRecord::open(
        BehaviorCall::targeted(BehaviorKind::Gather, 1, 50),
        Some(1),
        0.0,
    )];
    let signature = StateSignature::bind(1, &snapshot, &decisions);
    assert!(decoded.bind_state(&signature).is_some());
}

fn arbitrary_effect() -> impl Strategy<Value = Effect> {
    prop_oneof![
        (0u32..5, 1u32..9).prop_map(|(item, count)| Effect::Obtain {
            item: 2000 + item,
            count,
        }),
        prop_oneof![Just("agent"), Just("target"), Just("entity1")]
            .prop_map(|role| Effect::Died {
                role: role.to_string(),
            }),
    ]
}

fn effect_set() -> impl Strategy<Value = Vec<Effect>> {
    prop::collection::vec(arbitrary_effect(), 0..6).prop_map(|effects| {
        // dedup alike effects within one set, as generated deltas are
        let mut unique: Vec<Effect> = Vec::new();
        for effect in effects {
            if !unique.iter().any(|kept| kept.alike(&effect)) {
                unique.push(effect);
            }
        }
        unique
    })
}

fn candidate_strategy() -> impl Strategy<Value = RankedCandidate> {
    (-2.0f64..4.0, 0.0f64..1.5).prop_map(|(value_ratio, risk)| RankedCandidate {
        call: None,
        node_key: "(gather agent target)".to_string(),
        value_ratio,
        risk,
    })
}

proptest! {
    #[test]
    fn intersection_partitions_the_union(a in effect_set(), b in effect_set()) {
        let (its, lhs, rhs) = outcome_intersection(&a, &b);

        // its ∪ lhs reassembles a exactly
        prop_assert_eq!(its.len() + lhs.len(), a.len());
        for effect in &a {
            let in_its = its.iter().any(|e| e.alike(effect));
            let in_lhs = lhs.iter().any(|e| e.alike(effect));
            prop_assert!(in_its ^ in_lhs);
        }
        // rhs is exactly b minus anything alike the intersection
        for effect in &b {
            let in_its = its.iter().any(|e| e.alike(effect));
            let in_rhs = rhs.iter().any(|e| e.alike(effect));
            prop_assert!(in_its ^ in_rhs);
        }
        // the three parts are pairwise alike-disjoint
        for effect in &its {
            prop_assert!(!lhs.iter().any(|e| e.alike(effect)));
            prop_assert!(!rhs.iter().any(|e| e.alike(effect)));
        }
        for effect in &lhs {
            prop_assert!(!rhs.iter().any(|e| e.alike(effect)));
        }
    }

    #[test]
    fn repeated_update_is_idempotent(seed in effect_set(), update in effect_set()) {
        prop_assume!(!update.is_empty());
        let mut outcomes = Vec::new();
        update_outcomes(&mut outcomes, seed);
        update_outcomes(&mut outcomes, update.clone());
        let stable = outcomes.clone();
        update_outcomes(&mut outcomes, update);
        prop_assert_eq!(outcomes.clone(), stable);
        prop_assert!(partition_is_disjoint(&outcomes));
    }

    #[test]
    fn canonical_key_ignores_concrete_ids(offset in 1u64..10_000) {
        let build = |agent: EntityId, tree: EntityId, wolf: EntityId| {
            let entities = BTreeMap::from([
                (agent, entity(1, 0.0)),
                (tree, entity(1000, 5.0)),
                (wolf, entity(3, 8.0)),
            ]);
            let snapshot = WorldSnapshot {
                clock: 0.0,
                entities,
                inventories: BTreeMap::new(),
            };
            let decisions = vec![
                DecisionRecord::open(
                    BehaviorCall::targeted(BehaviorKind::Gather, agent, tree),
                    Some(agent),
                    0.0,
                ),
                DecisionRecord::open(
                    BehaviorCall::targeted(BehaviorKind::Attack, wolf, agent),
                    Some(wolf),
                    0.0,
                ),
            ];
            StateSignature::bind(agent, &snapshot, &decisions).key()
        };

        let base = build(1, 2, 3);
        let shifted = build(1 + offset, 2 + offset, 3 + offset);
        prop_assert_eq!(base, shifted);
    }

    #[test]
    fn bin_sort_honors_value_and_risk_bounds(
        candidates in prop::collection::vec(candidate_strategy(), 0..24)
    ) {
        let ranked = bin_sort(candidates, 0.33);

        for candidate in &ranked {
            prop_assert!(candidate.value_ratio > 0.0);
            prop_assert!(candidate.risk < 2.0 * 0.33);
        }

        // within each bin the ordering is value-descending
        let bin_of = |risk: f64| if risk < 0.33 { 0 } else { 1 };
        for window in ranked.windows(2) {
            let (a, b) = (&window[0], &window[1]);
            match bin_of(a.risk).cmp(&bin_of(b.risk)) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => prop_assert!(a.value_ratio >= b.value_ratio),
                std::cmp::Ordering::Greater => prop_assert!(false, "bins out of order"),
            }
        }
    }

    #[test]
    fn interactions_never_claim_a_record_twice(
        spans in prop::collection::vec((0u8..4, 0u8..4, 0.0f64..8.0, 0.1f64..4.0), 1..12)
    ) {
        let agents: [EntityId; 4] = [1, 2, 3, 4];
        let targets: [EntityId; 4] = [100, 101, 1, 2];
        let mut decisions: Vec<DecisionRecord> = spans
            .iter()
            .map(|(agent, target, start, width)| {
                DecisionRecord::closed(
                    BehaviorCall::targeted(
                        BehaviorKind::Attack,
                        agents[*agent as usize],
                        targets[*target as usize],
                    ),
                    Some(agents[*agent as usize]),
                    *start,
                    start + width,
                    DecisionStatus::Success,
                )
            })
            .collect();
        decisions.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut trace = Trace::new("random");
        trace.decisions = decisions;

        let interactions = extract_interactions(&trace, 0.01);
        let mut seen = BTreeSet::new();
        for interaction in &interactions {
            for index in interaction {
                prop_assert!(seen.insert(*index));
            }
        }
        prop_assert_eq!(seen.len(), trace.decisions.len());
    }
}
