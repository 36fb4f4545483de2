//! Feature-vector generation for predictor training and runtime estimation.
//!
//! A feature row maps named variables to values for one moment: per-role
//! entity attributes plus pairwise distances between roles. Variable naming
//! is a function of the canonical role order, so rows built at training time
//! and rows built at decision time line up by construction.

use std::collections::{BTreeMap, BTreeSet};

use contracts::{EntityId, KindCatalog, WorldSnapshot};

/// Canonical role ordering: the agent first, then the behavior's declared
/// argument roles alphabetically, then numbered entity roles by index.
pub fn order_roles(roles: &BTreeMap<String, EntityId>) -> Vec<(String, EntityId)> {
    let mut ordered: Vec<(String, EntityId)> = roles
        .iter()
        .map(|(role, eid)| (role.clone(), *eid))
        .collect();
    ordered.sort_by_key(|(role, _)| role_rank(role));
    ordered
}

fn role_rank(role: &str) -> (u8, u32, String) {
    if role == "agent" {
        return (0, 0, String::new());
    }
    if let Some(index) = role
        .strip_prefix("entity")
        .and_then(|rest| rest.parse::<u32>().ok())
    {
        return (2, index, String::new());
    }
    (1, 0, role.to_string())
}

/// Build one feature row for the given role bindings, or `None` when a bound
/// entity is absent from the snapshot (a malformed moment the caller skips).
pub fn feature_row(
    snapshot: &WorldSnapshot,
    roles: &BTreeMap<String, EntityId>,
    catalog: &KindCatalog,
) -> Option<BTreeMap<String, f64>> {
    let ordered = order_roles(roles);
    let mut row = BTreeMap::new();
    let mut states = Vec::with_capacity(ordered.len());

    for (role, eid) in &ordered {
        let entity = snapshot.entity(*eid)?;
        states.push((role.clone(), *entity));

        row.insert(format!("{role}.kind"), f64::from(entity.kind));
        row.insert(format!("{role}.hp"), entity.hp);

        if let Some(profile) = catalog.profile(entity.kind) {
            if let Some(speed) = profile.movement_speed {
                row.insert(format!("{role}.move_speed"), speed);
            }
            if let Some(charge) = profile.attack_charge_speed {
                row.insert(format!("{role}.charge_speed"), charge);
            }
            if let Some(awareness) = profile.awareness {
                row.insert(format!("{role}.awareness"), awareness);
            }
            if let Some(combat) = &profile.combat {
                row.insert(format!("{role}.max_hp"), combat.max_hp);
                row.insert(format!("{role}.swing"), combat.swing);
                row.insert(format!("{role}.dmg_min"), combat.damage_min);
                row.insert(format!("{role}.dmg_max"), combat.damage_max);
            }
            if let Some(gather) = &profile.gather {
                row.insert(format!("{role}.gather_time"), gather.duration);
            }
        }
    }

    for (i, (role_a, state_a)) in states.iter().enumerate() {
        for (role_b, state_b) in states.iter().skip(i + 1) {
            row.insert(
                format!("reln-{role_a}-{role_b}.dist"),
                state_a.distance_to(state_b),
            );
        }
    }

    Some(row)
}

/// Categorical variables are excluded from linear fitting.
pub fn is_continuous(variable: &str) -> bool {
    !variable.ends_with(".kind")
}

/// Named rows aligned to one shared variable list (the sorted union of all
/// observed variables); missing values fill with zero.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub variables: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureTable {
    pub fn from_rows(rows: &[BTreeMap<String, f64>]) -> Self {
        let variables: Vec<String> = rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let aligned = rows
            .iter()
            .map(|row| {
                variables
                    .iter()
                    .map(|variable| row.get(variable).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();
        Self {
            variables,
            rows: aligned,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Every way of binding the given role labels to distinct combat-capable
/// entities, excluding already-bound ids. Deliberately uncapped; candidate
/// counts are the caller's concern.
pub fn combo_bindings(
    labels: &[String],
    snapshot: &WorldSnapshot,
    catalog: &KindCatalog,
    exclude: &BTreeSet<EntityId>,
) -> Vec<BTreeMap<String, EntityId>> {
    let Some((first, rest)) = labels.split_first() else {
        return vec![BTreeMap::new()];
    };

    let mut bindings = Vec::new();
    for (eid, entity) in &snapshot.entities {
        if exclude.contains(eid) || !catalog.is_combatant(entity.kind) {
            continue;
        }
        let mut nested_exclude = exclude.clone();
        nested_exclude.insert(*eid);
        for tail in combo_bindings(rest, snapshot, catalog, &nested_exclude) {
            let mut binding = BTreeMap::new();
            binding.insert(first.clone(), *eid);
            binding.extend(tail);
            bindings.push(binding);
        }
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{EntityState, Inventory};

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
            9,
            EntityState {
                kind: 3,
                x: 3.0,
                y: 4.0,
                hp: 2.0,
            },
        );
        entities.insert(
            20,
            EntityState {
                kind: 1000,
                x: 1.0,
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

    #[test]
    fn row_contains_role_attrs_and_pair_distances() {
        let catalog = KindCatalog::default_catalog();
        let roles = BTreeMap::from([
            ("agent".to_string(), 1_u64),
            ("target".to_string(), 9_u64),
        ]);
        let row = feature_row(&snapshot(), &roles, &catalog).expect("row");

        assert_eq!(row.get("agent.kind"), Some(&1.0));
        assert_eq!(row.get("agent.max_hp"), Some(&4.0));
        assert_eq!(row.get("target.hp"), Some(&2.0));
        assert_eq!(row.get("reln-agent-target.dist"), Some(&5.0));
    }

    #[test]
    fn pair_naming_is_stable_across_role_sets() {
        let catalog = KindCatalog::default_catalog();
        let narrow = BTreeMap::from([
            ("agent".to_string(), 1_u64),
            ("target".to_string(), 9_u64),
        ]);
        let wide = BTreeMap::from([
            ("agent".to_string(), 1_u64),
            ("target".to_string(), 9_u64),
            ("entity1".to_string(), 20_u64),
        ]);
        let narrow_row = feature_row(&snapshot(), &narrow, &catalog).expect("row");
        let wide_row = feature_row(&snapshot(), &wide, &catalog).expect("row");
        assert_eq!(
            narrow_row.get("reln-agent-target.dist"),
            wide_row.get("reln-agent-target.dist")
        );
    }

    #[test]
    fn missing_entity_yields_no_row() {
        let catalog = KindCatalog::default_catalog();
        let roles = BTreeMap::from([("agent".to_string(), 77_u64)]);
        assert!(feature_row(&snapshot(), &roles, &catalog).is_none());
    }

    #[test]
    fn table_aligns_ragged_rows_with_zero_fill() {
        let rows = vec![
            BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 2.0)]),
            BTreeMap::from([("b".to_string(), 3.0), ("c".to_string(), 4.0)]),
        ];
        let table = FeatureTable::from_rows(&rows);
        assert_eq!(table.variables, vec!["a", "b", "c"]);
        assert_eq!(table.rows[0], vec![1.0, 2.0, 0.0]);
        assert_eq!(table.rows[1], vec![0.0, 3.0, 4.0]);
    }

    #[test]
    fn bindings_enumerate_distinct_combatants_only() {
        let catalog = KindCatalog::default_catalog();
        let labels = vec!["entity1".to_string()];
        let bindings = combo_bindings(&labels, &snapshot(), &catalog, &BTreeSet::from([1]));
        // the tree is not combat-capable, the agent is excluded
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].get("entity1"), Some(&9));
    }
}
