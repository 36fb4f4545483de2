//! Candidate generation and risk-binned ranking for the deciding agent.
//!
//! Candidates are scored by value ratio (expected reward over expected
//! duration) and filtered through ordered risk bins: safety is preferred
//! lexicographically over pure expected value, and anything past the second
//! bin boundary is not worth returning at all.

use serde::Serialize;

use contracts::{BehaviorCall, BehaviorKind, DecisionRecord, EntityId, Goal, WorldSnapshot};

use crate::graph::RuntimeGraph;
use crate::signature::StateSignature;

const RISK_BINS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    /// The behavior to start; `None` means "stay the course" on the current
    /// bound state.
    pub call: Option<BehaviorCall>,
    pub node_key: String,
    pub value_ratio: f64,
    pub risk: f64,
}

/// All candidate behaviors the agent could start right now: one gather per
/// reachable gatherable, one attack per reachable combatant, in entity-id
/// order. Exploration shuffling is the simulation's concern, not ours.
pub fn candidate_calls(
    agent: EntityId,
    snapshot: &WorldSnapshot,
    graph: &RuntimeGraph,
) -> Vec<BehaviorCall> {
    let mut calls = Vec::new();
    for kind in [BehaviorKind::Gather, BehaviorKind::Attack] {
        for target in kind.target_candidates(agent, snapshot, &graph.catalog) {
            calls.push(BehaviorCall::targeted(kind, agent, target));
        }
    }
    calls
}

/// Bind the current state and every candidate's hypothetical signature,
/// evaluate each against the goals, and return the risk-binned ranking.
/// States the graph never observed simply contribute no candidate.
pub fn rank(
    graph: &RuntimeGraph,
    agent: EntityId,
    snapshot: &WorldSnapshot,
    decisions: &[DecisionRecord],
    goals: &[Goal],
) -> Vec<RankedCandidate> {
    let signature = StateSignature::bind(agent, snapshot, decisions);
    let mut candidates = Vec::new();

    if !signature.is_idle() {
        if let Some(mut binding) = graph.bind_state(&signature) {
            binding.evaluate(snapshot, goals);
            candidates.push(RankedCandidate {
                call: binding.instantiate(),
                node_key: binding.node.key.clone(),
                value_ratio: binding.value_ratio(),
                risk: binding.death_concern(),
            });
        }
    }

    for call in candidate_calls(agent, snapshot, graph) {
        let choice_signature = signature.update_agent_behavior(call.clone());
        if let Some(mut binding) = graph.bind_state(&choice_signature) {
            binding.evaluate(snapshot, goals);
            candidates.push(RankedCandidate {
                call: Some(call),
                node_key: binding.node.key.clone(),
                value_ratio: binding.value_ratio(),
                risk: binding.death_concern(),
            });
        }
    }

    bin_sort(candidates, graph.config.risk_bin_width)
}

/// Discard worthless candidates, bucket the rest into ordered risk bins, and
/// concatenate from safest up, excluding the highest-risk bin entirely.
pub fn bin_sort(candidates: Vec<RankedCandidate>, bin_width: f64) -> Vec<RankedCandidate> {
    let mut bins: Vec<Vec<RankedCandidate>> = (0..RISK_BINS).map(|_| Vec::new()).collect();

    for candidate in candidates {
        if candidate.value_ratio <= 0.0 {
            continue;
        }
        let slot = (0..RISK_BINS).find(|bin| candidate.risk < (*bin as f64 + 1.0) * bin_width);
        if let Some(bin) = slot {
            bins[bin].push(candidate);
        }
    }

    let mut ranked = Vec::new();
    for bin in bins.iter_mut().take(RISK_BINS - 1) {
        bin.sort_by(|a, b| b.value_ratio.total_cmp(&a.value_ratio));
        ranked.append(bin);
    }
    ranked
}
