//! v1 cross-boundary contracts for traces, kind catalogs, learner
//! configuration, and the model API.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION_V1: &str = "1.0";

pub type EntityId = u64;
pub type KindId = u32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArgSlot {
    Entity,
    ItemKind,
    Quantity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    Gather,
    Attack,
    Flee,
    SetTrap,
    Lure,
    Patrol,
    Leashing,
    Move,
    Stunned,
    Craft,
    Eat,
    Eating,
    Healing,
    Drink,
    Killed,
    Dehydrated,
    Done,
    Timeout,
}

impl BehaviorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gather => "gather",
            Self::Attack => "attack",
            Self::Flee => "flee",
            Self::SetTrap => "set",
            Self::Lure => "lure",
            Self::Patrol => "patrol",
            Self::Leashing => "leashing",
            Self::Move => "move",
            Self::Stunned => "stunned",
            Self::Craft => "craft",
            Self::Eat => "eat",
            Self::Eating => "eating",
            Self::Healing => "healing",
            Self::Drink => "drink",
            Self::Killed => "killed",
            Self::Dehydrated => "dehydrated",
            Self::Done => "done",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "gather" => Some(Self::Gather),
            "attack" => Some(Self::Attack),
            "flee" => Some(Self::Flee),
            "set" => Some(Self::SetTrap),
            "lure" => Some(Self::Lure),
            "patrol" => Some(Self::Patrol),
            "leashing" => Some(Self::Leashing),
            "move" => Some(Self::Move),
            "stunned" => Some(Self::Stunned),
            "craft" => Some(Self::Craft),
            "eat" => Some(Self::Eat),
            "eating" => Some(Self::Eating),
            "healing" => Some(Self::Healing),
            "drink" => Some(Self::Drink),
            "killed" => Some(Self::Killed),
            "dehydrated" => Some(Self::Dehydrated),
            "done" => Some(Self::Done),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Ordered argument schema; the first entity slot is always the acting
    /// agent for behaviors that have one.
    pub fn params(self) -> &'static [(ArgSlot, &'static str)] {
        match self {
            Self::Gather | Self::Attack | Self::Flee | Self::Lure | Self::Killed => {
                &[(ArgSlot::Entity, "agent"), (ArgSlot::Entity, "target")]
            }
            Self::SetTrap => &[(ArgSlot::Entity, "agent"), (ArgSlot::Entity, "item_type")],
            Self::Patrol | Self::Leashing | Self::Move | Self::Stunned | Self::Dehydrated => {
                &[(ArgSlot::Entity, "agent")]
            }
            Self::Craft | Self::Eat | Self::Eating | Self::Healing | Self::Drink => {
                &[(ArgSlot::Entity, "agent"), (ArgSlot::ItemKind, "item_type")]
            }
            Self::Done | Self::Timeout => &[],
        }
    }

    /// Concrete target entities this behavior could be started against right
    /// now, bounded by the agent's awareness radius.
    pub fn target_candidates(
        self,
        agent: EntityId,
        snapshot: &WorldSnapshot,
        catalog: &KindCatalog,
    ) -> Vec<EntityId> {
        let Some(agent_state) = snapshot.entities.get(&agent) else {
            return Vec::new();
        };
        let radius = catalog.awareness_of(agent_state.kind).unwrap_or(0.0);

        snapshot
            .entities
            .iter()
            .filter(|(eid, state)| {
                **eid != agent
                    && agent_state.distance_to(state) <= radius
                    && match self {
                        Self::Gather => catalog.is_gatherable(state.kind),
                        Self::Attack | Self::Flee | Self::Lure => catalog.is_combatant(state.kind),
                        _ => false,
                    }
            })
            .map(|(eid, _)| *eid)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "slot", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Entity(EntityId),
    Item(KindId),
    Amount(f64),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "{id}"),
            Self::Item(kind) => write!(f, "{kind}"),
            Self::Amount(amount) => write!(f, "{amount}"),
        }
    }
}

/// One behavior instance: a kind plus its ordered argument values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BehaviorCall {
    pub kind: BehaviorKind,
    pub args: Vec<ArgValue>,
}

impl BehaviorCall {
    pub fn new(kind: BehaviorKind, args: Vec<ArgValue>) -> Self {
        Self { kind, args }
    }

    pub fn targeted(kind: BehaviorKind, agent: EntityId, target: EntityId) -> Self {
        Self::new(kind, vec![ArgValue::Entity(agent), ArgValue::Entity(target)])
    }

    pub fn solo(kind: BehaviorKind, agent: EntityId) -> Self {
        Self::new(kind, vec![ArgValue::Entity(agent)])
    }

    pub fn marker(kind: BehaviorKind) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Concrete signature string, e.g. `(gather 3 17)`.
    pub fn sig(&self) -> String {
        if self.args.is_empty() {
            return format!("({})", self.kind.as_str());
        }
        let values = self
            .args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        format!("({} {})", self.kind.as_str(), values)
    }

    /// Signature with entity ids replaced by role labels. Unmapped entities
    /// fall back to their declared parameter name; item kinds and amounts
    /// stay concrete.
    pub fn generic_sig(&self, mapping: &BTreeMap<EntityId, String>) -> String {
        if self.args.is_empty() {
            return format!("({})", self.kind.as_str());
        }
        let params = self.kind.params();
        let values = self
            .args
            .iter()
            .enumerate()
            .map(|(position, arg)| match arg {
                ArgValue::Entity(id) => mapping.get(id).cloned().unwrap_or_else(|| {
                    params
                        .get(position)
                        .map(|(_, name)| (*name).to_string())
                        .unwrap_or_else(|| arg.to_string())
                }),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        format!("({} {})", self.kind.as_str(), values)
    }

    /// Declared-name to entity-id pairs, in declaration order.
    pub fn labeled_entities(&self) -> Vec<(&'static str, EntityId)> {
        self.kind
            .params()
            .iter()
            .zip(self.args.iter())
            .filter_map(|((slot, name), arg)| match (slot, arg) {
                (ArgSlot::Entity, ArgValue::Entity(id)) => Some((*name, *id)),
                _ => None,
            })
            .collect()
    }

    pub fn entity_args(&self) -> Vec<EntityId> {
        self.labeled_entities().iter().map(|(_, id)| *id).collect()
    }

    pub fn arg_entity(&self, name: &str) -> Option<EntityId> {
        self.labeled_entities()
            .iter()
            .find(|(label, _)| *label == name)
            .map(|(_, id)| *id)
    }

    pub fn agent_id(&self) -> Option<EntityId> {
        self.arg_entity("agent")
    }

    pub fn target_id(&self) -> Option<EntityId> {
        self.arg_entity("target")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Running,
    Success,
    Failure,
    Interrupted,
}

/// One behavior execution span. Created when a behavior starts, closed when
/// it ends; immutable afterwards. A record without an owning agent is a
/// non-behavioral event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub behavior: BehaviorCall,
    pub agent: Option<EntityId>,
    pub start: f64,
    pub end: Option<f64>,
    pub status: DecisionStatus,
}

impl DecisionRecord {
    pub fn open(behavior: BehaviorCall, agent: Option<EntityId>, start: f64) -> Self {
        Self {
            behavior,
            agent,
            start,
            end: None,
            status: DecisionStatus::Running,
        }
    }

    pub fn closed(
        behavior: BehaviorCall,
        agent: Option<EntityId>,
        start: f64,
        end: f64,
        status: DecisionStatus,
    ) -> Self {
        Self {
            behavior,
            agent,
            start,
            end: Some(end),
            status,
        }
    }

    /// Instantaneous bookkeeping event; start and end coincide.
    pub fn event(behavior: BehaviorCall, agent: Option<EntityId>, clock: f64) -> Self {
        Self::closed(behavior, agent, clock, clock, DecisionStatus::Success)
    }

    pub fn is_event(&self) -> bool {
        self.agent.is_none()
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn instantaneous(&self) -> bool {
        self.end == Some(self.start)
    }

    pub fn duration(&self) -> f64 {
        self.end.map(|end| end - self.start).unwrap_or(0.0)
    }

    /// Open records are treated as extending indefinitely.
    pub fn end_or_inf(&self) -> f64 {
        self.end.unwrap_or(f64::INFINITY)
    }

    pub fn acting_agent(&self) -> Option<EntityId> {
        self.behavior.agent_id().or(self.agent)
    }

    pub fn target_id(&self) -> Option<EntityId> {
        self.behavior.target_id()
    }
}

impl fmt::Display for DecisionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(
                f,
                "[{:.2}-{:.2}] {} :{:?}",
                self.start,
                end,
                self.behavior.sig(),
                self.status
            ),
            None => write!(
                f,
                "[{:.2}-] {} :{:?}",
                self.start,
                self.behavior.sig(),
                self.status
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub kind: KindId,
    pub x: f64,
    pub y: f64,
    pub hp: f64,
}

impl EntityState {
    pub fn distance_to(&self, other: &EntityState) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    pub items: BTreeMap<KindId, u32>,
}

impl Inventory {
    pub fn amount(&self, item: KindId) -> u32 {
        self.items.get(&item).copied().unwrap_or(0)
    }

    /// Positive per-item deltas relative to a prior inventory.
    pub fn gain(&self, prior: &Inventory) -> Vec<(KindId, u32)> {
        self.items
            .iter()
            .filter_map(|(item, count)| {
                let before = prior.amount(*item);
                (*count > before).then(|| (*item, count - before))
            })
            .collect()
    }
}

/// A copy of all entity and inventory state at one clock value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub clock: f64,
    pub entities: BTreeMap<EntityId, EntityState>,
    pub inventories: BTreeMap<EntityId, Inventory>,
}

impl WorldSnapshot {
    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn inventory(&self, id: EntityId) -> Option<&Inventory> {
        self.inventories.get(&id)
    }
}

/// One recorded run: ordered decision records plus periodic snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub schema_version: String,
    pub trace_id: String,
    pub decisions: Vec<DecisionRecord>,
    pub snapshots: Vec<WorldSnapshot>,
}

impl Trace {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            trace_id: trace_id.into(),
            decisions: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Nearest snapshot at or after the requested clock.
    pub fn state_at(&self, clock: f64) -> Option<&WorldSnapshot> {
        self.snapshots.iter().find(|snap| snap.clock >= clock)
    }

    /// Entities of the catalog's agent kind that act in this trace.
    pub fn agent_ids(&self, catalog: &KindCatalog) -> BTreeSet<EntityId> {
        self.decisions
            .iter()
            .filter_map(|record| {
                let acting = record.behavior.agent_id()?;
                let state = self.state_at(record.start)?;
                let entity = state.entity(acting)?;
                (entity.kind == catalog.agent_kind).then_some(acting)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CombatProfile {
    pub max_hp: f64,
    pub swing: f64,
    pub damage_min: f64,
    pub damage_max: f64,
    pub reach: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatherProfile {
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KindProfile {
    pub name: String,
    #[serde(default)]
    pub movement_speed: Option<f64>,
    #[serde(default)]
    pub attack_charge_speed: Option<f64>,
    #[serde(default)]
    pub awareness: Option<f64>,
    #[serde(default)]
    pub combat: Option<CombatProfile>,
    #[serde(default)]
    pub gather: Option<GatherProfile>,
}

/// Static per-kind traits of the simulated world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KindCatalog {
    pub schema_version: String,
    pub agent_kind: KindId,
    pub profiles: BTreeMap<KindId, KindProfile>,
}

impl KindCatalog {
    pub fn profile(&self, kind: KindId) -> Option<&KindProfile> {
        self.profiles.get(&kind)
    }

    pub fn is_combatant(&self, kind: KindId) -> bool {
        self.profile(kind).is_some_and(|p| p.combat.is_some())
    }

    pub fn is_gatherable(&self, kind: KindId) -> bool {
        self.profile(kind).is_some_and(|p| p.gather.is_some())
    }

    pub fn awareness_of(&self, kind: KindId) -> Option<f64> {
        self.profile(kind).and_then(|p| p.awareness)
    }

    pub fn default_catalog() -> Self {
        fn mobile(
            name: &str,
            movement: f64,
            charge: f64,
            awareness: f64,
            combat: CombatProfile,
        ) -> KindProfile {
            KindProfile {
                name: name.to_string(),
                movement_speed: Some(movement),
                attack_charge_speed: Some(charge),
                awareness: Some(awareness),
                combat: Some(combat),
                gather: None,
            }
        }

        fn node(name: &str, duration: f64) -> KindProfile {
            KindProfile {
                name: name.to_string(),
                movement_speed: None,
                attack_charge_speed: None,
                awareness: None,
                combat: None,
                gather: Some(GatherProfile { duration }),
            }
        }

        let mut profiles = BTreeMap::new();
        profiles.insert(
            1,
            mobile(
                "agent",
                250.0,
                300.0,
                512.0,
                CombatProfile {
                    max_hp: 4.0,
                    swing: 0.5,
                    damage_min: 0.25,
                    damage_max: 0.25,
                    reach: 0.0,
                },
            ),
        );
        profiles.insert(
            2,
            mobile(
                "angry squirrel",
                120.0,
                400.0,
                100.0,
                CombatProfile {
                    max_hp: 1.0,
                    swing: 0.3,
                    damage_min: 0.1,
                    damage_max: 0.2,
                    reach: 0.0,
                },
            ),
        );
        profiles.insert(
            3,
            mobile(
                "wolf",
                100.0,
                350.0,
                100.0,
                CombatProfile {
                    max_hp: 4.0,
                    swing: 0.4,
                    damage_min: 0.4,
                    damage_max: 1.0,
                    reach: 0.0,
                },
            ),
        );
        profiles.insert(
            4,
            mobile(
                "bear",
                80.0,
                300.0,
                100.0,
                CombatProfile {
                    max_hp: 8.0,
                    swing: 0.5,
                    damage_min: 1.0,
                    damage_max: 2.0,
                    reach: 0.0,
                },
            ),
        );
        profiles.insert(1000, node("tree", 1.0));
        profiles.insert(1001, node("rock", 2.0));
        profiles.insert(1004, node("bush", 1.0));
        profiles.insert(1005, node("pond", 1.0));
        profiles.insert(1006, node("herb bush", 1.0));
        profiles.insert(1007, node("coconut tree", 2.0));

        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            agent_kind: 1,
            profiles,
        }
    }
}

/// Goal families the evaluator prices observed effects against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Goal {
    HasItem { item: KindId, count: u32, value: f64 },
}

/// Explicit learner configuration, passed in rather than ambient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnerConfig {
    pub schema_version: String,
    #[serde(default = "default_min_support")]
    pub min_support: usize,
    #[serde(default = "default_validation_folds")]
    pub validation_folds: usize,
    #[serde(default = "default_step_epsilon")]
    pub step_epsilon: f64,
    #[serde(default = "default_dread_factor")]
    pub dread_factor: f64,
    #[serde(default = "default_obtain_reward_hint")]
    pub obtain_reward_hint: f64,
    #[serde(default = "default_risk_bin_width")]
    pub risk_bin_width: f64,
    #[serde(default = "default_min_cost")]
    pub min_cost: f64,
}

fn default_min_support() -> usize {
    10
}

fn default_validation_folds() -> usize {
    10
}

fn default_step_epsilon() -> f64 {
    0.01
}

fn default_dread_factor() -> f64 {
    0.5
}

fn default_obtain_reward_hint() -> f64 {
    0.33
}

fn default_risk_bin_width() -> f64 {
    0.33
}

fn default_min_cost() -> f64 {
    0.01
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            min_support: default_min_support(),
            validation_folds: default_validation_folds(),
            step_epsilon: default_step_epsilon(),
            dread_factor: default_dread_factor(),
            obtain_reward_hint: default_obtain_reward_hint(),
            risk_bin_width: default_risk_bin_width(),
            min_cost: default_min_cost(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ModelNotFound,
    NodeNotFound,
    InvalidQuery,
    InvalidRequest,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub schema_version: String,
    pub query_type: String,
    pub model_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSummary {
    pub model_id: String,
    pub schema_version: String,
    pub node_count: usize,
    pub trained_at: String,
}

/// Body for the candidate-ranking endpoint: a live moment plus the goals to
/// price rewards against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankRequest {
    pub schema_version: String,
    pub agent: EntityId,
    pub snapshot: WorldSnapshot,
    #[serde(default)]
    pub open_decisions: Vec<DecisionRecord>,
    #[serde(default)]
    pub goals: Vec<Goal>,
}
