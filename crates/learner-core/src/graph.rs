//! The trained, immutable interaction graph and its runtime binding.
//!
//! Nodes live in an explicit table keyed by canonical signature string;
//! transition targets are key lookups, never object references. Binding a
//! live state to a node is read-only and safe for concurrent evaluation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use contracts::{
    BehaviorCall, EntityId, Goal, KindCatalog, LearnerConfig, WorldSnapshot, SCHEMA_VERSION_V1,
};

use crate::estimator::PredictorRecord;
use crate::features::{combo_bindings, feature_row};
use crate::outcome::Effect;
use crate::signature::{StateSignature, IDLE_KEY};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeOutcome {
    pub effects: Vec<Effect>,
    pub predictor: Option<PredictorRecord>,
}

impl RuntimeOutcome {
    /// Predicted probability of this outcome; unknown odds read as 0.5.
    pub fn probability(&self, row: &BTreeMap<String, f64>) -> f64 {
        self.predictor
            .as_ref()
            .map(|record| record.model.estimate(row).clamp(0.0, 1.0))
            .unwrap_or(0.5)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionModel {
    pub predictor: PredictorRecord,
    /// Roles the destination introduces beyond the source binding, e.g. a
    /// new attacker appearing.
    pub extra_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeNode {
    pub key: String,
    pub exemplar_count: usize,
    pub success_pct: f64,
    pub death_pct: f64,
    pub avg_reward: f64,
    pub outcomes: Vec<RuntimeOutcome>,
    pub duration: Option<PredictorRecord>,
    pub death: Option<PredictorRecord>,
    pub choices: BTreeSet<String>,
    pub choice_counts: BTreeMap<String, usize>,
    pub transitions: BTreeMap<String, TransitionModel>,
}

impl RuntimeNode {
    pub fn is_idle(&self) -> bool {
        self.key.starts_with(IDLE_KEY)
    }
}

/// The exported training artifact: node table plus the configuration and
/// kind catalog it was trained under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeGraph {
    pub schema_version: String,
    pub config: LearnerConfig,
    pub catalog: KindCatalog,
    pub nodes: BTreeMap<String, RuntimeNode>,
}

impl RuntimeGraph {
    pub fn new(config: LearnerConfig, catalog: KindCatalog) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            config,
            catalog,
            nodes: BTreeMap::new(),
        }
    }

    pub fn node(&self, key: &str) -> Option<&RuntimeNode> {
        self.nodes.get(key)
    }

    /// Look up the node for a live state. `None` means the state was never
    /// observed in training; callers fall back to exploration.
    pub fn bind_state(&self, signature: &StateSignature) -> Option<NodeBinding<'_>> {
        let key = signature.key();
        match self.nodes.get(&key) {
            Some(node) => Some(NodeBinding {
                graph: self,
                node,
                signature: signature.clone(),
                reward: 0.0,
                cost: 1.0,
                death_prob: 0.0,
                dread: 0.0,
            }),
            None => {
                debug!(key, "unobserved state");
                None
            }
        }
    }
}

/// One live state bound to its learned node, carrying the evaluation scores.
#[derive(Debug, Clone)]
pub struct NodeBinding<'g> {
    graph: &'g RuntimeGraph,
    pub node: &'g RuntimeNode,
    pub signature: StateSignature,
    pub reward: f64,
    pub cost: f64,
    pub death_prob: f64,
    pub dread: f64,
}

impl NodeBinding<'_> {
    /// Score this state: expected reward against the agent's goals, scaled
    /// by the odds of not being interrupted; propagated risk from predicted
    /// transitions into deadly states; direct death odds; time cost.
    pub fn evaluate(&mut self, snapshot: &WorldSnapshot, goals: &[Goal]) {
        self.reward = 0.0;
        self.cost = 1.0;
        self.death_prob = 0.0;
        self.dread = 0.0;

        if self.node.is_idle() {
            return;
        }

        let roles = self.signature.bound_entities();
        if roles.values().any(|eid| snapshot.entity(*eid).is_none()) {
            warn!(key = %self.node.key, "role entity missing from snapshot");
            return;
        }

        let config = &self.graph.config;
        let catalog = &self.graph.catalog;
        let bound_ids: BTreeSet<EntityId> = roles.values().copied().collect();

        let mut no_interrupt = 1.0;
        let mut no_death = 1.0;
        for (dest_key, transition) in &self.node.transitions {
            let Some(dest) = self.graph.nodes.get(dest_key) else {
                continue;
            };
            for binding in combo_bindings(&transition.extra_roles, snapshot, catalog, &bound_ids) {
                let mut scenario = roles.clone();
                scenario.extend(binding);
                let Some(row) = feature_row(snapshot, &scenario, catalog) else {
                    continue;
                };
                let probability = transition.predictor.model.estimate(&row).clamp(0.0, 1.0);
                no_interrupt *= 1.0 - probability;
                no_death *= 1.0 - probability * dest.death_pct * config.dread_factor;
            }
        }
        self.dread = 1.0 - no_death;

        let Some(row) = feature_row(snapshot, &roles, catalog) else {
            return;
        };

        if let Some(death) = &self.node.death {
            self.death_prob = death.model.estimate(&row).clamp(0.0, 1.0);
        }

        for outcome in &self.node.outcomes {
            let probability = outcome.probability(&row);
            for effect in &outcome.effects {
                for goal in goals {
                    self.reward += probability * effect.value_for(goal);
                }
            }
        }
        self.reward *= no_interrupt;

        if let Some(duration) = &self.node.duration {
            self.cost = duration.model.estimate(&row).max(config.min_cost);
        }
    }

    pub fn death_concern(&self) -> f64 {
        self.death_prob + self.dread
    }

    pub fn value_ratio(&self) -> f64 {
        self.reward / self.cost
    }

    /// The concrete behavior this binding stands for, ready to start.
    pub fn instantiate(&self) -> Option<BehaviorCall> {
        self.signature.instantiate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{BehaviorKind, EntityState, Inventory};

    fn bare_node(key: &str) -> RuntimeNode {
        RuntimeNode {
            key: key.to_string(),
            exemplar_count: 0,
            success_pct: 0.0,
            death_pct: 0.0,
            avg_reward: 0.0,
            outcomes: Vec::new(),
            duration: None,
            death: None,
            choices: BTreeSet::new(),
            choice_counts: BTreeMap::new(),
            transitions: BTreeMap::new(),
        }
    }

    fn snapshot() -> WorldSnapshot {
        let mut entities = BTreeMap::new();
        entities.insert(
            1,
            EntityState {
                kind: 1,
                x: 0.0,
                y: 0.0,
                hp: 4.0,
            },
        );
        entities.insert(
            50,
            EntityState {
                kind: 1000,
                x: 2.0,
                y: 0.0,
                hp: 1.0,
            },
        );
        WorldSnapshot {
            clock: 0.0,
            entities,
            inventories: BTreeMap::from([(1, Inventory::default())]),
        }
    }

    fn graph_with(node: RuntimeNode) -> RuntimeGraph {
        let mut graph = RuntimeGraph::new(LearnerConfig::default(), KindCatalog::default_catalog());
        graph.nodes.insert(node.key.clone(), node);
        graph
    }

    #[test]
    fn unseen_signature_binds_absent() {
        let graph = graph_with(bare_node("(gather agent target)"));
        let snapshot = snapshot();
        let sig = StateSignature::bind(1, &snapshot, &[]);
        assert!(graph.bind_state(&sig).is_none());
    }

    #[test]
    fn untrained_node_evaluates_with_neutral_defaults() {
        let mut node = bare_node("(gather agent target)");
        node.outcomes.push(RuntimeOutcome {
            effects: vec![Effect::Obtain {
                item: 2000,
                count: 2,
            }],
            predictor: None,
        });
        let graph = graph_with(node);
        let snapshot = snapshot();

        let decisions = vec![contracts::DecisionRecord::open(
            BehaviorCall::targeted(BehaviorKind::Gather, 1, 50),
            Some(1),
            0.0,
        )];
        let sig = StateSignature::bind(1, &snapshot, &decisions);
        let mut binding = graph.bind_state(&sig).expect("bound");
        binding.evaluate(
            &snapshot,
            &[Goal::HasItem {
                item: 2000,
                count: 4,
                value: 1.0,
            }],
        );

        // unknown outcome odds read as one half, cost falls back to one
        assert!((binding.reward - 0.25).abs() < 1e-9);
        assert_eq!(binding.cost, 1.0);
        assert_eq!(binding.death_concern(), 0.0);
        assert!((binding.value_ratio() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn idle_binding_scores_zero() {
        let graph = graph_with(bare_node(IDLE_KEY));
        let snapshot = snapshot();
        let sig = StateSignature::bind(1, &snapshot, &[]);
        let mut binding = graph.bind_state(&sig).expect("bound");
        binding.evaluate(&snapshot, &[]);
        assert_eq!(binding.reward, 0.0);
        assert_eq!(binding.value_ratio(), 0.0);
    }

    #[test]
    fn graph_round_trips_through_serde() {
        let graph = graph_with(bare_node("(gather agent target)"));
        let encoded = serde_json::to_string(&graph).expect("serialize");
        let decoded: RuntimeGraph = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(graph, decoded);
    }
}
