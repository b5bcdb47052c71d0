//! LD-006: Plan generation — diff the desired collection structure against
//! the fetched remote state.
//!
//! Pure: same inputs, same ordered action list. Output order is
//! creates, adds, removes, deletes; ties broken by collection name then
//! recipe id. A recipe is never removed from a managed collection unless it
//! has a placement elsewhere in the target (or is managed-origin).

use super::rules::NamingRules;
use super::types::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Name → collection, first by id on name collisions.
fn index_by_name(current: &RemoteState) -> BTreeMap<&str, &RemoteCollection> {
    let mut index: BTreeMap<&str, &RemoteCollection> = BTreeMap::new();
    for c in current.collections.values() {
        index.entry(c.name.as_str()).or_insert(c);
    }
    index
}

/// Collections shadowed by an earlier one with the same name, keyed
/// `"<name> [<id>]"`.
fn shadowed_duplicates(
    current: &RemoteState,
    index: &BTreeMap<&str, &RemoteCollection>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for c in current.collections.values() {
        let Some(kept) = index.get(c.name.as_str()) else {
            continue;
        };
        if kept.id == c.id {
            continue;
        }
        warn!(
            name = %c.name,
            kept = %kept.id,
            ignored = %c.id,
            "duplicate collection name; planning against the first"
        );
        out.insert(
            format!("{} [{}]", c.name, c.id),
            format!("duplicate name, planned against collection {}", kept.id),
        );
    }
    out
}

/// Desired structure plus the number of recipes kept in place.
///
/// Classified recipes go to their canonical collection. Recipes with no
/// usable target (unclassified, or target unavailable this run) stay in the
/// managed collections they already occupy. Managed-origin recipes get no
/// placement at all.
pub fn build_target(
    current: &RemoteState,
    classifications: &BTreeMap<String, Classification>,
    rules: &NamingRules,
    managed_origin: &BTreeSet<String>,
) -> (CollectionTarget, u32) {
    let mut target = CollectionTarget::default();
    let mut placed: BTreeSet<&str> = BTreeSet::new();

    for (recipe_id, c) in classifications {
        if managed_origin.contains(recipe_id) {
            continue;
        }
        let Some(name) = rules.target_name(c) else {
            continue;
        };
        if current.is_unavailable(&name) {
            debug!(recipe = %recipe_id, collection = %name, "target unavailable, keeping recipe in place");
            continue;
        }
        target.insert(&name, recipe_id);
        placed.insert(recipe_id);
    }

    let mut retained: BTreeSet<&str> = BTreeSet::new();
    for c in index_by_name(current).values() {
        if !rules.is_managed(c) || rules.is_protected(&c.name) {
            continue;
        }
        for r in &c.members {
            if !placed.contains(r.as_str()) && !managed_origin.contains(r) {
                target.insert(&c.name, r);
                retained.insert(r);
            }
        }
    }

    (target, retained.len() as u32)
}

/// Generate the ordered action list that moves `current` to the target
/// implied by `classifications`.
pub fn plan(
    current: &RemoteState,
    classifications: &BTreeMap<String, Classification>,
    rules: &NamingRules,
    managed_origin: &BTreeSet<String>,
) -> Plan {
    let by_name = index_by_name(current);
    let mut actions = Vec::new();

    // Managed-origin recipes leave every user collection, whatever their
    // classification.
    if !managed_origin.is_empty() {
        for c in by_name.values() {
            if rules.is_managed(c) || rules.is_protected(&c.name) {
                continue;
            }
            for r in c.members.intersection(managed_origin) {
                actions.push(Action::RemoveRecipeFromCollection {
                    recipe_id: r.clone(),
                    collection: c.name.clone(),
                    collection_id: c.id.clone(),
                });
            }
        }
    }

    let (target, retained_recipes) = build_target(current, classifications, rules, managed_origin);

    for (name, recipes) in &target.collections {
        if current.is_unavailable(name) {
            continue;
        }
        match by_name.get(name.as_str()) {
            None => {
                actions.push(Action::CreateCollection { name: name.clone() });
                for r in recipes {
                    actions.push(Action::AddRecipeToCollection {
                        recipe_id: r.clone(),
                        collection: name.clone(),
                    });
                }
            }
            Some(existing) => {
                for r in recipes.difference(&existing.members) {
                    actions.push(Action::AddRecipeToCollection {
                        recipe_id: r.clone(),
                        collection: name.clone(),
                    });
                }
            }
        }
    }

    let empty = BTreeSet::new();
    for c in by_name.values() {
        if !rules.is_managed(c) || rules.is_protected(&c.name) {
            continue;
        }
        let wanted = target.members(&c.name).unwrap_or(&empty);
        for r in c.members.difference(wanted) {
            actions.push(Action::RemoveRecipeFromCollection {
                recipe_id: r.clone(),
                collection: c.name.clone(),
                collection_id: c.id.clone(),
            });
        }
        if !target.contains_collection(&c.name) {
            actions.push(Action::DeleteCollection {
                collection: c.name.clone(),
                collection_id: c.id.clone(),
            });
        }
    }

    for (name, reason) in &current.unavailable {
        warn!(collection = %name, reason = %reason, "collection unavailable, left out of this plan");
    }

    actions.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    actions.dedup();

    let mut skipped_collections = current.unavailable.clone();
    skipped_collections.extend(shadowed_duplicates(current, &by_name));

    let count = |kind: ActionKind| actions.iter().filter(|a| a.kind() == kind).count() as u32;
    let plan = Plan {
        to_create: count(ActionKind::Create),
        to_add: count(ActionKind::Add),
        to_remove: count(ActionKind::Remove),
        to_delete: count(ActionKind::Delete),
        skipped_collections,
        retained_recipes,
        actions,
    };
    debug!(
        create = plan.to_create,
        add = plan.to_add,
        remove = plan.to_remove,
        delete = plan.to_delete,
        retained = plan.retained_recipes,
        "plan computed"
    );
    plan
}

/// Apply actions to a copy of the state, as the platform would. Created
/// collections get placeholder ids.
pub fn simulate(current: &RemoteState, actions: &[Action]) -> RemoteState {
    let mut next = current.clone();
    for action in actions {
        match action {
            Action::CreateCollection { name } => {
                if next.by_name(name).is_none() {
                    let id = format!("planned:{}", name);
                    next.collections.insert(
                        id.clone(),
                        RemoteCollection {
                            id,
                            name: name.clone(),
                            managed: false,
                            members: BTreeSet::new(),
                        },
                    );
                }
            }
            Action::AddRecipeToCollection {
                recipe_id,
                collection,
            } => {
                let id = next.by_name(collection).map(|c| c.id.clone());
                if let Some(c) = id.and_then(|id| next.collections.get_mut(&id)) {
                    c.members.insert(recipe_id.clone());
                }
            }
            Action::RemoveRecipeFromCollection {
                recipe_id,
                collection_id,
                ..
            } => {
                if let Some(c) = next.collections.get_mut(collection_id) {
                    c.members.remove(recipe_id);
                }
            }
            Action::DeleteCollection { collection_id, .. } => {
                next.collections.remove(collection_id);
            }
        }
    }
    next
}

/// Per-collection member counts before and after a plan (`None` = absent).
pub fn membership_delta(
    current: &RemoteState,
    actions: &[Action],
) -> BTreeMap<String, (Option<usize>, Option<usize>)> {
    let before = current.member_counts();
    let after = simulate(current, actions).member_counts();
    let mut names: BTreeSet<&String> = before.keys().collect();
    names.extend(after.keys());
    names
        .into_iter()
        .map(|n| (n.clone(), (before.get(n).copied(), after.get(n).copied())))
        .filter(|(_, (b, a))| b != a)
        .collect()
}
