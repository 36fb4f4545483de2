//! Qualitative state deltas (effects) and their incremental partition into
//! outcomes.
//!
//! Effects compare by kind and type, never by magnitude: obtaining 3 wood and
//! obtaining 5 wood are "alike". An outcome is a set of effects observed to
//! occur together; feeding new effect sets through `update_outcomes` refines
//! the partition by intersection splits until every outcome is a stable,
//! pairwise-disjoint cell.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use contracts::{EntityId, Goal, KindCatalog, KindId, WorldSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    Obtain { item: KindId, count: u32 },
    Died { role: String },
}

impl Effect {
    /// Same kind and same type/role; counts are ignored.
    pub fn alike(&self, other: &Effect) -> bool {
        match (self, other) {
            (Self::Obtain { item: a, .. }, Self::Obtain { item: b, .. }) => a == b,
            (Self::Died { role: a }, Self::Died { role: b }) => a == b,
            _ => false,
        }
    }

    /// Goal-specific value of this effect; only item goals price anything.
    pub fn value_for(&self, goal: &Goal) -> f64 {
        match (self, goal) {
            (
                Self::Obtain { item, count },
                Goal::HasItem {
                    item: wanted,
                    count: wanted_count,
                    value,
                },
            ) if item == wanted => {
                let fraction = f64::from(*count) / f64::from((*wanted_count).max(1));
                value * fraction.min(1.0)
            }
            _ => 0.0,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Obtain { item, count } => write!(f, "(obtain {item} {count})"),
            Self::Died { role } => write!(f, "(died {role})"),
        }
    }
}

/// Derive qualitative effects between two snapshots: positive inventory
/// deltas for entities present in both, and deaths of combat-capable
/// entities that disappeared.
pub fn generate_effects(
    catalog: &KindCatalog,
    before: &WorldSnapshot,
    after: &WorldSnapshot,
) -> Vec<Effect> {
    let mut effects = Vec::new();

    for (eid, prior) in &before.inventories {
        if let Some(current) = after.inventory(*eid) {
            for (item, count) in current.gain(prior) {
                effects.push(Effect::Obtain { item, count });
            }
        }
    }

    for (eid, entity) in &before.entities {
        if catalog.is_combatant(entity.kind) && after.entity(*eid).is_none() {
            effects.push(Effect::Died {
                role: eid.to_string(),
            });
        }
    }

    effects
}

/// Rewrite concrete entity ids inside effects to role labels so they stay
/// comparable across exemplars with different participants.
pub fn substitute_effects(effects: &mut [Effect], mapping: &BTreeMap<EntityId, String>) {
    for effect in effects {
        if let Effect::Died { role } = effect {
            if let Some(label) = role.parse::<EntityId>().ok().and_then(|id| mapping.get(&id)) {
                *role = label.clone();
            }
        }
    }
}

/// Partition `a ∪ b` by the alike relation: effects of `a` with an alike
/// match in `b`, then each side's leftovers.
pub fn outcome_intersection(a: &[Effect], b: &[Effect]) -> (Vec<Effect>, Vec<Effect>, Vec<Effect>) {
    let mut its = Vec::new();
    let mut lhs = Vec::new();
    let mut rhs = Vec::new();

    for effect in a {
        if b.iter().any(|other| effect.alike(other)) {
            its.push(effect.clone());
        } else {
            lhs.push(effect.clone());
        }
    }

    for effect in b {
        if !its.iter().any(|kept| effect.alike(kept)) {
            rhs.push(effect.clone());
        }
    }

    (its, lhs, rhs)
}

/// True when every effect of `outcome` has an alike match in `effects`.
pub fn effects_subsume(effects: &[Effect], outcome: &[Effect]) -> bool {
    outcome
        .iter()
        .all(|effect| effects.iter().any(|candidate| candidate.alike(effect)))
}

/// One partition cell: effects observed to co-occur exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub effects: Vec<Effect>,
}

impl Outcome {
    pub fn new(effects: Vec<Effect>) -> Self {
        Self { effects }
    }

    /// Absorb a new effect set. Returns whether the set intersected this
    /// outcome, the split-off part of this outcome's old membership, and the
    /// part of the new set still unabsorbed.
    pub fn update(&mut self, new_effects: Vec<Effect>) -> (bool, Vec<Effect>, Vec<Effect>) {
        let (its, lhs, rhs) = outcome_intersection(&self.effects, &new_effects);

        if its.is_empty() {
            // no intersection, the exemplar does not belong here
            return (false, Vec::new(), new_effects);
        }

        if lhs.is_empty() && rhs.is_empty() {
            // identical sets, nothing to change
            return (true, Vec::new(), Vec::new());
        }

        self.effects = its;
        (true, lhs, rhs)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .effects
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(","))
    }
}

/// Loop a new effect set against the partition until fully absorbed.
/// Absorption order is list order: each round scans outcomes from the front,
/// the first alike-match wins, and leftovers re-enter from the front.
pub fn update_outcomes(outcomes: &mut Vec<Outcome>, new_effects: Vec<Effect>) {
    if new_effects.is_empty() {
        return;
    }

    let mut pending = new_effects;
    loop {
        let mut matched = false;
        let mut split_old = Vec::new();
        for outcome in outcomes.iter_mut() {
            let (hit, lhs, rhs) = outcome.update(pending.clone());
            if hit {
                matched = true;
                split_old = lhs;
                pending = rhs;
                break;
            }
        }

        if !matched {
            outcomes.push(Outcome::new(pending));
            break;
        }

        if !split_old.is_empty() {
            outcomes.push(Outcome::new(split_old));
        }

        if pending.is_empty() {
            break;
        }
    }

    debug_assert!(
        partition_is_disjoint(outcomes),
        "outcome partition lost alike-disjointness"
    );
}

/// Every pair of outcomes shares no alike effects.
pub fn partition_is_disjoint(outcomes: &[Outcome]) -> bool {
    for (i, a) in outcomes.iter().enumerate() {
        for b in outcomes.iter().skip(i + 1) {
            let (its, _, _) = outcome_intersection(&a.effects, &b.effects);
            if !its.is_empty() {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{EntityState, Inventory};

    fn obtain(item: KindId, count: u32) -> Effect {
        Effect::Obtain { item, count }
    }

    fn died(role: &str) -> Effect {
        Effect::Died {
            role: role.to_string(),
        }
    }

    #[test]
    fn alike_ignores_counts() {
        assert!(obtain(2000, 3).alike(&obtain(2000, 5)));
        assert!(!obtain(2000, 3).alike(&obtain(2001, 3)));
        assert!(died("target").alike(&died("target")));
        assert!(!died("target").alike(&obtain(2000, 1)));
    }

    #[test]
    fn intersection_partitions_both_sets() {
        let a = vec![obtain(2000, 2), obtain(2002, 1)];
        let b = vec![obtain(2000, 5), died("target")];
        let (its, lhs, rhs) = outcome_intersection(&a, &b);
        assert_eq!(its, vec![obtain(2000, 2)]);
        assert_eq!(lhs, vec![obtain(2002, 1)]);
        assert_eq!(rhs, vec![died("target")]);
    }

    #[test]
    fn first_exemplar_creates_single_outcome() {
        let mut outcomes = Vec::new();
        update_outcomes(&mut outcomes, vec![obtain(2000, 3)]);
        assert_eq!(outcomes.len(), 1);

        // a different count is alike, so no new outcome appears
        update_outcomes(&mut outcomes, vec![obtain(2000, 5)]);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].effects, vec![obtain(2000, 3)]);
    }

    #[test]
    fn update_is_idempotent() {
        let mut outcomes = vec![Outcome::new(vec![obtain(2000, 2), obtain(2002, 1)])];
        update_outcomes(&mut outcomes, vec![obtain(2000, 2), obtain(2002, 1)]);
        let snapshot = outcomes.clone();
        update_outcomes(&mut outcomes, vec![obtain(2000, 2), obtain(2002, 1)]);
        assert_eq!(outcomes, snapshot);
    }

    #[test]
    fn partial_overlap_splits_outcome() {
        let mut outcomes = vec![Outcome::new(vec![obtain(2000, 2), obtain(2002, 1)])];
        update_outcomes(&mut outcomes, vec![obtain(2000, 4), died("target")]);

        // shrink to the intersection, split off both leftovers
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].effects, vec![obtain(2000, 2)]);
        assert!(partition_is_disjoint(&outcomes));
    }

    #[test]
    fn partition_split_prefers_earlier_outcome() {
        // effects straddling two disjoint outcomes are absorbed in list
        // order: the first outcome claims its share, the remainder flows on
        let mut outcomes = vec![
            Outcome::new(vec![obtain(2000, 1)]),
            Outcome::new(vec![obtain(2001, 1)]),
        ];
        update_outcomes(&mut outcomes, vec![obtain(2000, 2), obtain(2001, 2)]);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].effects, vec![obtain(2000, 1)]);
        assert_eq!(outcomes[1].effects, vec![obtain(2001, 1)]);
        assert!(partition_is_disjoint(&outcomes));
    }

    #[test]
    fn subsume_ignores_magnitudes() {
        let observed = vec![obtain(2000, 9), died("target")];
        assert!(effects_subsume(&observed, &[obtain(2000, 1)]));
        assert!(effects_subsume(&observed, &[died("target"), obtain(2000, 2)]));
        assert!(!effects_subsume(&observed, &[obtain(2001, 1)]));
    }

    #[test]
    fn generated_effects_cover_gains_and_deaths() {
        let catalog = KindCatalog::default_catalog();
        let mut before = WorldSnapshot {
            clock: 0.0,
            entities: std::collections::BTreeMap::new(),
            inventories: std::collections::BTreeMap::new(),
        };
        before.entities.insert(
            1,
            EntityState {
                kind: 1,
                x: 0.0,
                y: 0.0,
                hp: 4.0,
            },
        );
        before.entities.insert(
            9,
            EntityState {
                kind: 3,
                x: 5.0,
                y: 0.0,
                hp: 1.0,
            },
        );
        before.inventories.insert(1, Inventory::default());

        let mut after = before.clone();
        after.clock = 2.0;
        after.entities.remove(&9);
        after
            .inventories
            .insert(1, Inventory {
                items: std::collections::BTreeMap::from([(2000, 3)]),
            });

        let mut effects = generate_effects(&catalog, &before, &after);
        assert_eq!(
            effects,
            vec![obtain(2000, 3), died("9")]
        );

        let mapping = BTreeMap::from([(9, "target".to_string())]);
        substitute_effects(&mut effects, &mapping);
        assert_eq!(effects[1], died("target"));
    }
}
