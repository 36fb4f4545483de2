//! Canonical, entity-identity-independent state signatures.
//!
//! A signature captures "what is happening now" around one agent: its own
//! behavior plus every other open behavior that overlaps its participants.
//! Entity ids are rewritten to role labels so the resulting key is comparable
//! across traces with different concrete entities. Training keys and runtime
//! keys are produced by the same traversal so they can never drift apart.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use contracts::{BehaviorCall, DecisionRecord, DecisionStatus, EntityId, WorldSnapshot};

pub const IDLE_KEY: &str = "idle";
pub const DEAD_KEY: &str = "dead";

#[derive(Debug, Clone, PartialEq)]
pub enum AgentBehavior {
    Dead,
    Idle,
    Active(BehaviorCall),
}

impl AgentBehavior {
    pub fn call(&self) -> Option<&BehaviorCall> {
        match self {
            Self::Active(call) => Some(call),
            _ => None,
        }
    }

    fn generic_sig(&self, mapping: &BTreeMap<EntityId, String>) -> String {
        match self {
            Self::Dead => DEAD_KEY.to_string(),
            Self::Idle => IDLE_KEY.to_string(),
            Self::Active(call) => call.generic_sig(mapping),
        }
    }
}

/// Role assignment for one moment: entity ids to canonical labels, plus the
/// traversal order the labels were assigned in.
pub fn canonical_roles(
    agent: EntityId,
    agent_call: Option<&BehaviorCall>,
    co_active: &BTreeMap<EntityId, BehaviorCall>,
) -> (BTreeMap<EntityId, String>, Vec<EntityId>) {
    let mut mapping = BTreeMap::new();
    mapping.insert(agent, "agent".to_string());

    if let Some(call) = agent_call {
        for (name, eid) in call.labeled_entities() {
            mapping.entry(eid).or_insert_with(|| name.to_string());
        }
    }

    let ordered = ordered_entities(agent, agent_call, co_active);

    let mut next = 1;
    for eid in &ordered {
        if !mapping.contains_key(eid) {
            mapping.insert(*eid, format!("entity{next}"));
            next += 1;
        }
    }

    (mapping, ordered)
}

/// All entities besides the agent, in argument-appearance order: breadth-first
/// from the agent behavior's arguments, expanding each reached entity's own
/// co-active behavior, then any co-active owners never reached that way.
fn ordered_entities(
    agent: EntityId,
    agent_call: Option<&BehaviorCall>,
    co_active: &BTreeMap<EntityId, BehaviorCall>,
) -> Vec<EntityId> {
    let mut out = Vec::new();
    let mut done = BTreeSet::new();
    done.insert(agent);

    if let Some(call) = agent_call {
        let mut queue = VecDeque::new();
        for eid in call.entity_args() {
            if done.insert(eid) {
                queue.push_back(eid);
            }
        }
        while let Some(next_eid) = queue.pop_front() {
            out.push(next_eid);
            if let Some(behavior) = co_active.get(&next_eid) {
                for eid in behavior.entity_args() {
                    if done.insert(eid) {
                        queue.push_back(eid);
                    }
                }
            }
        }
    }

    for eid in co_active.keys() {
        if !done.contains(eid) {
            out.push(*eid);
        }
    }

    out
}

pub fn compose_key(
    base: &str,
    co_active: &BTreeMap<EntityId, BehaviorCall>,
    mapping: &BTreeMap<EntityId, String>,
    ordered: &[EntityId],
) -> String {
    let mut key = base.to_string();
    for eid in ordered {
        if let Some(behavior) = co_active.get(eid) {
            key.push('-');
            key.push_str(&behavior.generic_sig(mapping));
        }
    }
    key
}

#[derive(Debug, Clone)]
pub struct StateSignature {
    pub agent: EntityId,
    pub behavior: AgentBehavior,
    pub co_active: BTreeMap<EntityId, BehaviorCall>,
    mapping: BTreeMap<EntityId, String>,
    ordered: Vec<EntityId>,
}

impl StateSignature {
    /// Canonicalize the moment described by a snapshot and the currently open
    /// decision records.
    pub fn bind(agent: EntityId, snapshot: &WorldSnapshot, decisions: &[DecisionRecord]) -> Self {
        if snapshot.entity(agent).is_none() {
            return Self::assemble(agent, AgentBehavior::Dead, BTreeMap::new());
        }

        let agent_record = decisions
            .iter()
            .find(|record| record.is_open() && record.behavior.agent_id() == Some(agent));

        let behavior = match agent_record {
            Some(record) if record.status == DecisionStatus::Running => {
                AgentBehavior::Active(record.behavior.clone())
            }
            _ => AgentBehavior::Idle,
        };

        let active: BTreeSet<EntityId> = match behavior.call() {
            Some(call) => call.entity_args().into_iter().collect(),
            None => BTreeSet::from([agent]),
        };

        let mut co_active = BTreeMap::new();
        for record in decisions {
            if !record.is_open() {
                continue;
            }
            let Some(owner) = record.behavior.agent_id() else {
                continue;
            };
            if owner == agent {
                continue;
            }
            if record
                .behavior
                .entity_args()
                .iter()
                .any(|eid| active.contains(eid))
            {
                co_active.insert(owner, record.behavior.clone());
            }
        }

        Self::assemble(agent, behavior, co_active)
    }

    fn assemble(
        agent: EntityId,
        behavior: AgentBehavior,
        co_active: BTreeMap<EntityId, BehaviorCall>,
    ) -> Self {
        let (mapping, ordered) = canonical_roles(agent, behavior.call(), &co_active);
        Self {
            agent,
            behavior,
            co_active,
            mapping,
            ordered,
        }
    }

    /// Canonical node key: the relabeled agent behavior followed by the
    /// relabeled co-active behaviors in traversal order.
    pub fn key(&self) -> String {
        compose_key(
            &self.behavior.generic_sig(&self.mapping),
            &self.co_active,
            &self.mapping,
            &self.ordered,
        )
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.behavior, AgentBehavior::Idle)
    }

    /// Entity-id to role-label mapping used to build the key.
    pub fn roles(&self) -> &BTreeMap<EntityId, String> {
        &self.mapping
    }

    /// Role-label to entity-id view.
    pub fn bound_entities(&self) -> BTreeMap<String, EntityId> {
        self.mapping
            .iter()
            .map(|(eid, role)| (role.clone(), *eid))
            .collect()
    }

    /// Hypothetical signature for "what if the agent switched to this
    /// behavior instead": co-active behaviors that no longer share an entity
    /// with the new call drop out.
    pub fn update_agent_behavior(&self, call: BehaviorCall) -> Self {
        let entities: BTreeSet<EntityId> = call.entity_args().into_iter().collect();
        let co_active = self
            .co_active
            .iter()
            .filter(|(_, behavior)| {
                behavior
                    .entity_args()
                    .iter()
                    .any(|eid| entities.contains(eid))
            })
            .map(|(owner, behavior)| (*owner, behavior.clone()))
            .collect();
        Self::assemble(self.agent, AgentBehavior::Active(call), co_active)
    }

    /// The concrete behavior this signature stands for, ready to start.
    pub fn instantiate(&self) -> Option<BehaviorCall> {
        self.behavior.call().cloned()
    }

    fn relabeled_co_active(&self) -> BTreeSet<String> {
        self.co_active
            .values()
            .map(|behavior| behavior.generic_sig(&self.mapping))
            .collect()
    }
}

impl PartialEq for StateSignature {
    fn eq(&self, other: &Self) -> bool {
        self.behavior.generic_sig(&self.mapping) == other.behavior.generic_sig(&other.mapping)
            && self.relabeled_co_active() == other.relabeled_co_active()
    }
}
