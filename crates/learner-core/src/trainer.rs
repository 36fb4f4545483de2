//! Offline construction and training of the interaction graph.
//!
//! Exemplar sequences bucket into per-node success / failure / death /
//! choice / transition sets; once a corpus is ingested, `finalize` fits the
//! per-node predictors (independently across nodes, so the pass fans out
//! over a thread pool) and exports the immutable runtime artifact.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use tracing::{debug, warn};

use contracts::{
    BehaviorKind, EntityId, KindCatalog, LearnerConfig, Trace, WorldSnapshot, SCHEMA_VERSION_V1,
};

use crate::estimator::{validate_classifier, validate_regressor, Model, PredictorRecord};
use crate::features::{combo_bindings, feature_row};
use crate::graph::{RuntimeGraph, RuntimeNode, RuntimeOutcome, TransitionModel};
use crate::interaction::{exemplar_sequence, ExemplarNode};
use crate::outcome::{
    effects_subsume, generate_effects, substitute_effects, update_outcomes, Effect, Outcome,
};
use crate::signature::{DEAD_KEY, IDLE_KEY};

#[derive(Debug, Clone)]
struct SuccessExemplar {
    roles: BTreeMap<String, EntityId>,
    snapshot: WorldSnapshot,
    duration: f64,
    effects: Vec<Effect>,
    outcome_indices: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
struct DeathExemplar {
    roles: BTreeMap<String, EntityId>,
    snapshot: WorldSnapshot,
}

#[derive(Debug, Clone)]
struct TransitionExemplar {
    src_roles: BTreeMap<String, EntityId>,
    dest_roles: BTreeMap<String, EntityId>,
    snapshot: WorldSnapshot,
}

/// One graph node under construction: exemplar buckets plus the evolving
/// outcome partition.
#[derive(Debug, Clone)]
pub struct TrainNode {
    pub key: String,
    pub exemplar_count: usize,
    pub avg_reward: f64,
    pub outcomes: Vec<Outcome>,
    pub choices: BTreeSet<String>,
    pub choice_counts: BTreeMap<String, usize>,
    pub failure_count: usize,
    success: Vec<SuccessExemplar>,
    death: Vec<DeathExemplar>,
    transitions: BTreeMap<String, Vec<TransitionExemplar>>,
}

impl TrainNode {
    fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            exemplar_count: 0,
            avg_reward: 0.0,
            outcomes: Vec::new(),
            choices: BTreeSet::new(),
            choice_counts: BTreeMap::new(),
            failure_count: 0,
            success: Vec::new(),
            death: Vec::new(),
            transitions: BTreeMap::new(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.success.len()
    }

    pub fn death_count(&self) -> usize {
        self.death.len()
    }

    pub fn transition_counts(&self) -> BTreeMap<String, usize> {
        self.transitions
            .iter()
            .map(|(key, exemplars)| (key.clone(), exemplars.len()))
            .collect()
    }
}

pub struct GraphTrainer {
    config: LearnerConfig,
    catalog: KindCatalog,
    nodes: BTreeMap<String, TrainNode>,
}

impl GraphTrainer {
    pub fn new(config: LearnerConfig, catalog: KindCatalog) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(IDLE_KEY.to_string(), TrainNode::new(IDLE_KEY));
        nodes.insert(DEAD_KEY.to_string(), TrainNode::new(DEAD_KEY));
        Self {
            config,
            catalog,
            nodes,
        }
    }

    pub fn node(&self, key: &str) -> Option<&TrainNode> {
        self.nodes.get(key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ingest every agent's exemplar sequence from one closed trace.
    pub fn add_trace(&mut self, trace: &Trace) {
        for agent in trace.agent_ids(&self.catalog) {
            let sequence = exemplar_sequence(trace, agent);
            self.add_sequence(&sequence, trace);
        }
    }

    pub fn add_sequence(&mut self, sequence: &[ExemplarNode], trace: &Trace) {
        let first_kind = sequence
            .iter()
            .find_map(|node| node.record.as_ref())
            .map(|record| record.behavior.kind);
        if let Some(kind) = first_kind {
            self.node_mut(IDLE_KEY)
                .choices
                .insert(kind.as_str().to_string());
        }

        for index in 0..sequence.len() {
            self.ingest(sequence, index, trace);
        }
    }

    fn node_mut(&mut self, key: &str) -> &mut TrainNode {
        self.nodes
            .entry(key.to_string())
            .or_insert_with(|| TrainNode::new(key))
    }

    /// Classify one exemplar node into exactly one bucket of its graph node.
    fn ingest(&mut self, sequence: &[ExemplarNode], index: usize, trace: &Trace) {
        let entry = &sequence[index];
        let (key, mapping) = entry.key();
        self.node_mut(&key);

        let Some(record) = &entry.record else {
            // terminal markers only ensure their node exists
            return;
        };
        let Some(next) = sequence.get(index + 1) else {
            return;
        };

        let mut idle_choice = None;
        let config_hint = self.config.obtain_reward_hint;

        let Some(node) = self.nodes.get_mut(&key) else {
            return;
        };
        node.exemplar_count += 1;

        if record.status == contracts::DecisionStatus::Success && record.end == Some(entry.end) {
            match (trace.state_at(entry.start), trace.state_at(entry.end)) {
                (Some(before), Some(after)) => {
                    let mut effects = generate_effects(&self.catalog, before, after);
                    substitute_effects(&mut effects, &mapping);
                    update_outcomes(&mut node.outcomes, effects.clone());

                    if effects
                        .iter()
                        .any(|effect| matches!(effect, Effect::Obtain { .. }))
                    {
                        node.avg_reward = config_hint;
                    }

                    node.success.push(SuccessExemplar {
                        roles: labeled_roles(record),
                        snapshot: before.clone(),
                        duration: record.duration(),
                        effects,
                        outcome_indices: BTreeSet::new(),
                    });
                }
                _ => warn!(key = %node.key, start = entry.start, "no snapshot for success exemplar"),
            }

            // a completed behavior lands in an idle-like state; what the
            // agent picked next is a choice from there
            if let Some(next_record) = &next.record {
                if !next_record.instantaneous() {
                    idle_choice = Some(next_record.behavior.kind.as_str().to_string());
                }
            }
        } else if record.status == contracts::DecisionStatus::Failure
            && record.end == Some(entry.end)
        {
            node.failure_count += 1;
        } else if next.manual_label.as_deref() == Some(BehaviorKind::Killed.as_str()) {
            match trace.state_at(entry.start) {
                Some(snapshot) => node.death.push(DeathExemplar {
                    roles: labeled_roles(record),
                    snapshot: snapshot.clone(),
                }),
                None => warn!(key = %node.key, start = entry.start, "no snapshot for death exemplar"),
            }
        } else {
            let voluntary_switch = match &next.record {
                Some(next_record) => next_record.behavior.sig() != record.behavior.sig(),
                None => false,
            };

            if voluntary_switch {
                let name = next
                    .record
                    .as_ref()
                    .map(|next_record| next_record.behavior.kind.as_str().to_string())
                    .unwrap_or_default();
                node.choices.insert(name.clone());
                *node.choice_counts.entry(name).or_insert(0) += 1;
            } else {
                let (dest_key, dest_mapping) = next.key();
                match trace.state_at(entry.start) {
                    Some(snapshot) => {
                        node.transitions
                            .entry(dest_key)
                            .or_default()
                            .push(TransitionExemplar {
                                src_roles: reverse_roles(&mapping),
                                dest_roles: reverse_roles(&dest_mapping),
                                snapshot: snapshot.clone(),
                            });
                    }
                    None => {
                        warn!(key = %node.key, start = entry.start, "no snapshot for transition exemplar")
                    }
                }
            }
        }

        if let Some(name) = idle_choice {
            self.node_mut(IDLE_KEY).choices.insert(name);
        }
    }

    /// Sweep success exemplars and label them against the now-stable outcome
    /// partition.
    pub fn update_exemplar_outcomes(&mut self) {
        for node in self.nodes.values_mut() {
            let TrainNode {
                outcomes, success, ..
            } = node;
            for exemplar in success.iter_mut() {
                exemplar.outcome_indices = outcomes
                    .iter()
                    .enumerate()
                    .filter(|(_, outcome)| effects_subsume(&exemplar.effects, &outcome.effects))
                    .map(|(index, _)| index)
                    .collect();
            }
        }
    }

    /// Train every node's predictors and export the immutable artifact.
    pub fn finalize(mut self) -> RuntimeGraph {
        self.update_exemplar_outcomes();

        let config = self.config;
        let catalog = self.catalog;
        let nodes: BTreeMap<String, RuntimeNode> = self
            .nodes
            .par_iter()
            .map(|(key, node)| (key.clone(), train_node(node, &config, &catalog)))
            .collect();

        RuntimeGraph {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            config,
            catalog,
            nodes,
        }
    }
}

fn labeled_roles(record: &contracts::DecisionRecord) -> BTreeMap<String, EntityId> {
    record
        .behavior
        .labeled_entities()
        .into_iter()
        .map(|(name, eid)| (name.to_string(), eid))
        .collect()
}

fn reverse_roles(mapping: &BTreeMap<EntityId, String>) -> BTreeMap<String, EntityId> {
    mapping
        .iter()
        .map(|(eid, role)| (role.clone(), *eid))
        .collect()
}

fn train_node(node: &TrainNode, config: &LearnerConfig, catalog: &KindCatalog) -> RuntimeNode {
    let mut runtime = RuntimeNode {
        key: node.key.clone(),
        exemplar_count: node.exemplar_count,
        success_pct: 0.0,
        death_pct: 0.0,
        avg_reward: node.avg_reward,
        outcomes: node
            .outcomes
            .iter()
            .map(|outcome| RuntimeOutcome {
                effects: outcome.effects.clone(),
                predictor: None,
            })
            .collect(),
        duration: None,
        death: None,
        choices: node.choices.clone(),
        choice_counts: node.choice_counts.clone(),
        transitions: BTreeMap::new(),
    };

    if node.exemplar_count > 0 {
        runtime.success_pct = node.success.len() as f64 / node.exemplar_count as f64;
        runtime.death_pct = node.death.len() as f64 / node.exemplar_count as f64;
    }

    if node.success.len() >= config.min_support {
        train_success_predictors(node, config, catalog, &mut runtime);
    }

    if node.death.len() >= config.min_support && node.success.len() >= config.min_support {
        train_death_predictor(node, config, catalog, &mut runtime);
    }

    train_transition_predictors(node, config, catalog, &mut runtime);

    debug!(
        key = %runtime.key,
        exemplars = runtime.exemplar_count,
        outcomes = runtime.outcomes.len(),
        transitions = runtime.transitions.len(),
        "node trained"
    );
    runtime
}

fn success_rows<'a>(
    node: &'a TrainNode,
    catalog: &KindCatalog,
) -> Vec<(BTreeMap<String, f64>, &'a SuccessExemplar)> {
    node.success
        .iter()
        .filter_map(|exemplar| {
            match feature_row(&exemplar.snapshot, &exemplar.roles, catalog) {
                Some(row) => Some((row, exemplar)),
                None => {
                    // a role entity was already gone at the start snapshot
                    warn!(key = %node.key, "skipping malformed success exemplar");
                    None
                }
            }
        })
        .collect()
}

fn train_success_predictors(
    node: &TrainNode,
    config: &LearnerConfig,
    catalog: &KindCatalog,
    runtime: &mut RuntimeNode,
) {
    let labeled = success_rows(node, catalog);
    if labeled.is_empty() {
        return;
    }
    let rows: Vec<BTreeMap<String, f64>> = labeled.iter().map(|(row, _)| row.clone()).collect();
    let durations: Vec<f64> = labeled
        .iter()
        .map(|(_, exemplar)| exemplar.duration)
        .collect();

    // two candidate regressors; keep the one with the lower validated error
    let linear_quality = validate_regressor(&rows, &durations, config.validation_folds, |r, t| {
        Model::fit_linear(r, t)
    });
    let boosted_quality = validate_regressor(&rows, &durations, config.validation_folds, |r, t| {
        Model::fit_boost_regressor(r, t)
    });
    let use_boosted = boosted_quality.unwrap_or(f64::INFINITY)
        < linear_quality.unwrap_or(f64::INFINITY);
    runtime.duration = Some(if use_boosted {
        PredictorRecord {
            model: Model::fit_boost_regressor(&rows, &durations),
            quality: boosted_quality,
        }
    } else {
        PredictorRecord {
            model: Model::fit_linear(&rows, &durations),
            quality: linear_quality,
        }
    });

    for (index, outcome) in runtime.outcomes.iter_mut().enumerate() {
        let labels: Vec<bool> = labeled
            .iter()
            .map(|(_, exemplar)| exemplar.outcome_indices.contains(&index))
            .collect();
        let positives = labels.iter().filter(|label| **label).count();
        if positives < config.min_support {
            continue;
        }
        let quality = validate_classifier(&rows, &labels, config.validation_folds, |r, l| {
            Model::fit_boost_classifier(r, l)
        });
        outcome.predictor = Some(PredictorRecord {
            model: Model::fit_boost_classifier(&rows, &labels),
            quality,
        });
    }
}

fn train_death_predictor(
    node: &TrainNode,
    config: &LearnerConfig,
    catalog: &KindCatalog,
    runtime: &mut RuntimeNode,
) {
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for exemplar in &node.death {
        match feature_row(&exemplar.snapshot, &exemplar.roles, catalog) {
            Some(row) => {
                rows.push(row);
                labels.push(true);
            }
            None => warn!(key = %node.key, "skipping malformed death exemplar"),
        }
    }
    for (row, _) in success_rows(node, catalog) {
        rows.push(row);
        labels.push(false);
    }
    if rows.is_empty() {
        return;
    }

    let quality = validate_classifier(&rows, &labels, config.validation_folds, |r, l| {
        Model::fit_boost_classifier(r, l)
    });
    runtime.death = Some(PredictorRecord {
        model: Model::fit_boost_classifier(&rows, &labels),
        quality,
    });
}

fn train_transition_predictors(
    node: &TrainNode,
    config: &LearnerConfig,
    catalog: &KindCatalog,
    runtime: &mut RuntimeNode,
) {
    for (dest_key, exemplars) in &node.transitions {
        if exemplars.len() < config.min_support {
            continue;
        }
        let Some(first) = exemplars.first() else {
            continue;
        };
        let extra_roles: Vec<String> = first
            .dest_roles
            .keys()
            .filter(|role| !first.src_roles.contains_key(*role))
            .cloned()
            .collect();

        let mut rows = Vec::new();
        let mut labels = Vec::new();

        for exemplar in exemplars {
            let extras: BTreeMap<String, EntityId> = exemplar
                .dest_roles
                .iter()
                .filter(|(role, _)| !exemplar.src_roles.contains_key(*role))
                .map(|(role, eid)| (role.clone(), *eid))
                .collect();
            let extra_labels: Vec<String> = extras.keys().cloned().collect();

            let mut merged = exemplar.src_roles.clone();
            merged.extend(extras);
            match feature_row(&exemplar.snapshot, &merged, catalog) {
                Some(row) => {
                    rows.push(row);
                    labels.push(true);
                }
                None => {
                    warn!(key = %node.key, dest = %dest_key, "skipping malformed transition exemplar");
                    continue;
                }
            }

            // every plausible alternative binding of the extra roles is a
            // negative example
            let exclude: BTreeSet<EntityId> = merged.values().copied().collect();
            for binding in combo_bindings(&extra_labels, &exemplar.snapshot, catalog, &exclude) {
                let mut scenario = exemplar.src_roles.clone();
                scenario.extend(binding);
                if let Some(row) = feature_row(&exemplar.snapshot, &scenario, catalog) {
                    rows.push(row);
                    labels.push(false);
                }
            }
        }

        // exemplars that went elsewhere are negatives for this destination
        for (other_key, other_exemplars) in &node.transitions {
            if other_key == dest_key {
                continue;
            }
            for exemplar in other_exemplars {
                let exclude: BTreeSet<EntityId> =
                    exemplar.src_roles.values().copied().collect();
                for binding in combo_bindings(&extra_roles, &exemplar.snapshot, catalog, &exclude) {
                    let mut scenario = exemplar.src_roles.clone();
                    scenario.extend(binding);
                    if let Some(row) = feature_row(&exemplar.snapshot, &scenario, catalog) {
                        rows.push(row);
                        labels.push(false);
                    }
                }
            }
        }

        let positives = labels.iter().filter(|label| **label).count();
        let negatives = labels.len() - positives;
        if positives < config.min_support || negatives < config.min_support {
            continue;
        }

        let quality = validate_classifier(&rows, &labels, config.validation_folds, |r, l| {
            Model::fit_boost_classifier(r, l)
        });
        runtime.transitions.insert(
            dest_key.clone(),
            TransitionModel {
                predictor: PredictorRecord {
                    model: Model::fit_boost_classifier(&rows, &labels),
                    quality,
                },
                extra_roles,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{
        ArgValue, BehaviorCall, DecisionRecord, DecisionStatus, EntityState, Inventory,
    };

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

    fn snapshot_at(clock: f64, wood: u32, with_agent: bool) -> WorldSnapshot {
        let mut entities = BTreeMap::new();
        if with_agent {
            entities.insert(1, entity(1, 0.0));
        }
        entities.insert(50, entity(1000, 10.0));
        WorldSnapshot {
            clock,
            entities,
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

    /// A trace of repeated successful gathers, each yielding two wood.
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
            trace.snapshots.push(snapshot_at(start, i * 2, true));
            trace
                .snapshots
                .push(snapshot_at(start + 1.0, (i + 1) * 2, true));
        }
        let end_clock = f64::from(count) * 2.0;
        trace.decisions.push(DecisionRecord::event(
            BehaviorCall::marker(BehaviorKind::Done),
            None,
            end_clock,
        ));
        trace.snapshots.push(snapshot_at(end_clock, count * 2, true));
        trace
    }

    /// A trace where the agent's gather is cut short by its own death.
    fn death_trace(id: &str) -> Trace {
        let mut trace = Trace::new(id);
        trace.decisions.push(DecisionRecord::closed(
            BehaviorCall::targeted(BehaviorKind::Gather, 1, 50),
            Some(1),
            0.0,
            1.0,
            DecisionStatus::Interrupted,
        ));
        trace.decisions.push(DecisionRecord::event(
            BehaviorCall::targeted(BehaviorKind::Killed, 9, 1),
            Some(9),
            1.0,
        ));
        trace.snapshots.push(snapshot_at(0.0, 0, true));
        trace.snapshots.push(snapshot_at(1.0, 0, false));
        trace
    }

    #[test]
    fn success_exemplars_build_one_outcome_with_predictors() {
        let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
        trainer.add_trace(&gather_trace(6));

        let graph = trainer.finalize();
        let node = graph.node("(gather agent target)").expect("gather node");

        assert_eq!(node.exemplar_count, 6);
        assert!((node.success_pct - 1.0).abs() < 1e-9);
        assert_eq!(node.outcomes.len(), 1);
        assert!(matches!(
            node.outcomes[0].effects.as_slice(),
            [Effect::Obtain { item: 2000, .. }]
        ));
        assert!(node.outcomes[0].predictor.is_some());
        assert!(node.duration.is_some());
        assert!((node.avg_reward - 0.33).abs() < 1e-9);
    }

    #[test]
    fn first_behavior_registers_as_idle_choice() {
        let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
        trainer.add_trace(&gather_trace(3));

        let idle = trainer.node(IDLE_KEY).expect("idle node");
        assert!(idle.choices.contains("gather"));
    }

    #[test]
    fn death_marker_buckets_and_trains_death_model() {
        let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
        trainer.add_trace(&gather_trace(6));
        for i in 0..4 {
            trainer.add_trace(&death_trace(&format!("death_{i}")));
        }

        let node = trainer.node("(gather agent target)").expect("gather node");
        assert_eq!(node.death_count(), 4);

        let graph = trainer.finalize();
        let node = graph.node("(gather agent target)").expect("gather node");
        assert!(node.death.is_some());
        assert!(node.death_pct > 0.0);
    }

    #[test]
    fn voluntary_switch_records_choice_not_transition() {
        let mut trace = Trace::new("switch");
        trace.decisions.push(DecisionRecord::closed(
            BehaviorCall::targeted(BehaviorKind::Gather, 1, 50),
            Some(1),
            0.0,
            1.0,
            DecisionStatus::Interrupted,
        ));
        trace.decisions.push(DecisionRecord::closed(
            BehaviorCall::new(
                BehaviorKind::Craft,
                vec![ArgValue::Entity(1), ArgValue::Item(2004)],
            ),
            Some(1),
            1.0,
            2.0,
            DecisionStatus::Success,
        ));
        trace.decisions.push(DecisionRecord::event(
            BehaviorCall::marker(BehaviorKind::Done),
            None,
            2.0,
        ));
        trace.snapshots.push(snapshot_at(0.0, 0, true));
        trace.snapshots.push(snapshot_at(1.0, 0, true));
        trace.snapshots.push(snapshot_at(2.0, 0, true));

        let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
        trainer.add_trace(&trace);

        let node = trainer.node("(gather agent target)").expect("gather node");
        assert!(node.choices.contains("craft"));
        assert_eq!(node.choice_counts.get("craft"), Some(&1));
        assert!(node.transition_counts().is_empty());
    }

    #[test]
    fn failure_status_counts_separately() {
        let mut trace = Trace::new("failure");
        trace.decisions.push(DecisionRecord::closed(
            BehaviorCall::targeted(BehaviorKind::Gather, 1, 50),
            Some(1),
            0.0,
            1.0,
            DecisionStatus::Failure,
        ));
        trace.decisions.push(DecisionRecord::event(
            BehaviorCall::marker(BehaviorKind::Timeout),
            None,
            1.0,
        ));
        trace.snapshots.push(snapshot_at(0.0, 0, true));
        trace.snapshots.push(snapshot_at(1.0, 0, true));

        let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
        trainer.add_trace(&trace);

        let node = trainer.node("(gather agent target)").expect("gather node");
        assert_eq!(node.failure_count, 1);
        assert_eq!(node.success_count(), 0);
    }

    #[test]
    fn terminal_keys_become_nodes_without_exemplars() {
        let mut trainer = GraphTrainer::new(small_config(), KindCatalog::default_catalog());
        trainer.add_trace(&gather_trace(2));

        let done = trainer.node("done").expect("terminal node");
        assert_eq!(done.exemplar_count, 0);
    }
}
