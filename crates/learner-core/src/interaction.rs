//! Interaction extraction and per-agent exemplar sequences.
//!
//! An interaction is a maximal chain of decision records linked by "currently
//! acting or currently targeted" relationships. An exemplar sequence is one
//! agent's own timeline, split wherever another entity's behavior overlaps it
//! in both time and participants.

use std::collections::{BTreeMap, BTreeSet};

use contracts::{BehaviorKind, DecisionRecord, EntityId, Trace};

use crate::signature::{canonical_roles, compose_key};

/// Record indices belonging to one interaction, in trace order.
pub type Interaction = Vec<usize>;

/// Group every decision record of the trace into interactions. Each record is
/// claimed at most once.
pub fn extract_interactions(trace: &Trace, step_epsilon: f64) -> Vec<Interaction> {
    let mut used = BTreeSet::new();
    let mut interactions = Vec::new();
    for offset in 0..trace.decisions.len() {
        if !used.contains(&offset) {
            interactions.push(build_interaction(trace, offset, step_epsilon, &mut used));
        }
    }
    interactions
}

fn build_interaction(
    trace: &Trace,
    offset: usize,
    step_epsilon: f64,
    used: &mut BTreeSet<usize>,
) -> Interaction {
    let decisions = &trace.decisions;
    let start = &decisions[offset];
    let mut interaction = vec![offset];
    used.insert(offset);

    let Some(start_agent) = start.behavior.agent_id() else {
        // non-behavioral event, a singleton interaction
        return interaction;
    };

    // what each participant is currently doing within this interaction
    let mut doing: BTreeMap<EntityId, usize> = BTreeMap::new();
    doing.insert(start_agent, offset);

    for index in offset + 1..decisions.len() {
        if used.contains(&index) {
            continue;
        }
        let record = &decisions[index];

        // retire participants whose active record ended before this one starts
        doing.retain(|_, active| decisions[*active].end_or_inf() >= record.start);

        let Some(next_agent) = record.behavior.agent_id() else {
            continue;
        };
        let next_target = record.target_id();

        let mut extend = false;
        if currently_involved(decisions, &doing, next_agent) {
            if next_target.is_some_and(|target| currently_involved(decisions, &doing, target)) {
                extend = true;
            } else if continued_involvement(decisions, &doing, next_agent, record.start, step_epsilon)
            {
                // target is new, so the agent must stay involved past the
                // next tick to extend
                extend = true;
            } else {
                doing.remove(&next_agent);
            }
        } else if next_target.is_some_and(|target| {
            continued_involvement(decisions, &doing, target, record.start, step_epsilon)
        }) {
            extend = true;
        }

        if extend {
            doing.insert(next_agent, index);
            interaction.push(index);
            used.insert(index);
        }

        if doing.is_empty() {
            break;
        }
    }

    interaction
}

/// Acting or targeted in the current doing set.
fn currently_involved(
    decisions: &[DecisionRecord],
    doing: &BTreeMap<EntityId, usize>,
    eid: EntityId,
) -> bool {
    doing.contains_key(&eid)
        || doing
            .values()
            .any(|index| decisions[*index].target_id() == Some(eid))
}

/// Acting or targeted beyond the next tick.
fn continued_involvement(
    decisions: &[DecisionRecord],
    doing: &BTreeMap<EntityId, usize>,
    eid: EntityId,
    clock: f64,
    step_epsilon: f64,
) -> bool {
    if let Some(index) = doing.get(&eid) {
        if decisions[*index].end_or_inf() > clock + step_epsilon {
            return true;
        }
    }
    doing.values().any(|index| {
        decisions[*index].target_id() == Some(eid)
            && decisions[*index].end_or_inf() > clock + step_epsilon
    })
}

/// One interval of an agent's own timeline, annotated with the other-entity
/// behaviors active during the overlap. Terminal markers carry a manual label
/// instead of a record.
#[derive(Debug, Clone)]
pub struct ExemplarNode {
    pub record: Option<DecisionRecord>,
    pub manual_label: Option<String>,
    pub start: f64,
    pub end: f64,
    pub overlaps: BTreeMap<EntityId, DecisionRecord>,
}

impl ExemplarNode {
    pub fn from_record(record: &DecisionRecord) -> Self {
        Self {
            start: record.start,
            end: record.end_or_inf(),
            record: Some(record.clone()),
            manual_label: None,
            overlaps: BTreeMap::new(),
        }
    }

    pub fn terminal(label: impl Into<String>, clock: f64) -> Self {
        Self {
            record: None,
            manual_label: Some(label.into()),
            start: clock,
            end: clock,
            overlaps: BTreeMap::new(),
        }
    }

    fn add_overlap(&mut self, record: &DecisionRecord) {
        if let Some(owner) = record.behavior.agent_id() {
            self.overlaps.insert(owner, record.clone());
        }
        self.start = self.start.max(record.start);
        self.end = self.end.min(record.end_or_inf());
    }

    /// Canonical key plus the entity-to-role mapping behind it.
    pub fn key(&self) -> (String, BTreeMap<EntityId, String>) {
        let Some(record) = &self.record else {
            let label = self.manual_label.clone().unwrap_or_default();
            return (label, BTreeMap::new());
        };
        let co_active: BTreeMap<EntityId, contracts::BehaviorCall> = self
            .overlaps
            .iter()
            .map(|(owner, overlap)| (*owner, overlap.behavior.clone()))
            .collect();
        let agent = record.behavior.agent_id().unwrap_or(0);
        let (mapping, ordered) = canonical_roles(agent, Some(&record.behavior), &co_active);
        let key = compose_key(
            &record.behavior.generic_sig(&mapping),
            &co_active,
            &mapping,
            &ordered,
        );
        (key, mapping)
    }
}

/// Build the agent's exemplar sequence for one trace: its own records in
/// order, split against every overlapping other-entity record, with a
/// terminal marker carrying the trace's final behavior name. The agent's own
/// kill bookkeeping records are dropped.
pub fn exemplar_sequence(trace: &Trace, agent: EntityId) -> Vec<ExemplarNode> {
    let mut sequence: Vec<ExemplarNode> = trace
        .decisions
        .iter()
        .filter(|record| record.behavior.agent_id() == Some(agent))
        .map(ExemplarNode::from_record)
        .collect();

    for record in &trace.decisions {
        if record.is_event() || record.behavior.agent_id() == Some(agent) {
            continue;
        }
        sequence = sequence
            .into_iter()
            .flat_map(|node| split(node, record))
            .collect();
    }

    if let Some(last) = trace.decisions.last() {
        sequence.push(ExemplarNode::terminal(
            last.behavior.kind.as_str(),
            last.start,
        ));
    }

    sequence.retain(|node| {
        node.record
            .as_ref()
            .map(|record| record.behavior.kind != BehaviorKind::Killed)
            .unwrap_or(true)
    });

    sequence
}

/// Split one node against an overlapping record into up to three pieces:
/// before the overlap, the overlap itself (annotated), and after.
fn split(mut node: ExemplarNode, record: &DecisionRecord) -> Vec<ExemplarNode> {
    if !overlap_entity(&node, record) || !overlap_temporal(&node, record) {
        return vec![node];
    }

    let mut pieces = Vec::new();

    if node.start < record.start {
        let mut before = node.clone();
        before.end = record.start;
        pieces.push(before);
    }

    let after = (node.end > record.end_or_inf()).then(|| {
        let mut after = node.clone();
        after.start = record.end_or_inf();
        after
    });

    node.add_overlap(record);
    pieces.push(node);

    if let Some(after) = after {
        pieces.push(after);
    }
    pieces
}

fn overlap_temporal(node: &ExemplarNode, record: &DecisionRecord) -> bool {
    between(record.start, node.start, node.end) || between(node.start, record.start, record.end_or_inf())
}

fn overlap_entity(node: &ExemplarNode, record: &DecisionRecord) -> bool {
    let Some(own) = &node.record else {
        return false;
    };
    let own_entities = own.behavior.entity_args();
    record
        .behavior
        .entity_args()
        .iter()
        .any(|eid| own_entities.contains(eid))
}

/// Half-open interval membership: "ends exactly at" does not overlap.
fn between(value: f64, low: f64, high: f64) -> bool {
    value >= low && value < high
}
