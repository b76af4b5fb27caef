//! Difference between the applied and the new concept applications.
//!
//! Applications are matched by key. An application is recreated when its
//! definition changed, when something it depends on is recreated, or when
//! its dependencies changed. Recreation spreads through dependents in the old
//! graph (they cannot outlive the dropped object) and in the new graph (they
//! must be created after it) until both sets are stable.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use crate::application::{ConceptApplication, ConceptApplicationKey, NewConceptApplication};
use crate::error::{GeneratorError, Result};
use crate::graph::{include_dependents, removable_leaves, topological_sort};

/// Ordered changes that bring the database from the applied model to the new
/// one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationPlan {
    /// Applications to remove, dependents before their dependencies.
    pub removed: Vec<ConceptApplication>,
    /// Applications to create, dependencies before their dependents, with
    /// final ids and creation order.
    pub inserted: Vec<ConceptApplication>,
    /// Applications kept in the database, as `(new, old)` pairs.
    pub unchanged: Vec<(ConceptApplication, ConceptApplication)>,
}

impl MigrationPlan {
    /// Computes the plan from the applied applications and the new ones.
    pub fn compute(old: &[ConceptApplication], new: &[NewConceptApplication]) -> Result<Self> {
        let old_by_key = index_old(old)?;
        let new_by_key = index_new(new)?;
        let old_edges = old_edges(old)?;
        let new_edges = new_edges(new, &new_by_key)?;

        let mut old_sorted: Vec<&ConceptApplication> = old.iter().collect();
        old_sorted.sort_by_key(|a| a.creation_order);
        let mut old_keys: Vec<ConceptApplicationKey> =
            old_sorted.iter().map(|a| a.key()).collect();
        topological_sort(&mut old_keys, &old_edges)?;
        let mut new_keys: Vec<ConceptApplicationKey> =
            new.iter().map(NewConceptApplication::key).collect();
        topological_sort(&mut new_keys, &new_edges)?;

        let (removed_keys, inserted_keys) =
            changed_keys(&old_keys, &new_keys, &old_by_key, &new_by_key, &old_edges, &new_edges);

        let leaves = removable_leaves(&removed_keys, &old_edges);
        if leaves.len() != removed_keys.len() {
            return Err(GeneratorError::InvalidState(format!(
                "{} of {} removed applications still have remaining dependents",
                removed_keys.len() - leaves.len(),
                removed_keys.len()
            )));
        }

        let removed_set: HashSet<&ConceptApplicationKey> = removed_keys.iter().collect();
        let inserted_set: HashSet<&ConceptApplicationKey> = inserted_keys.iter().collect();

        let mut ids: HashMap<&ConceptApplicationKey, Uuid> = HashMap::new();
        for key in &new_keys {
            let application = new_by_key[key];
            // Recreated applications keep their id unless their definition changed.
            let id = match old_by_key.get(key) {
                Some(applied)
                    if !inserted_set.contains(key) || application.same_definition(applied) =>
                {
                    applied.id
                }
                _ => application.id,
            };
            ids.insert(key, id);
        }
        let resolve = |application: &NewConceptApplication| -> Vec<Uuid> {
            application
                .depends_on
                .iter()
                .filter_map(|key| ids.get(key).copied())
                .collect()
        };

        let removed: Vec<ConceptApplication> = old_keys
            .iter()
            .rev()
            .filter(|key| removed_set.contains(key))
            .map(|key| old_by_key[key].clone())
            .collect();

        let mut creation_order = old.iter().map(|a| a.creation_order).max().unwrap_or(0);
        let mut inserted = Vec::with_capacity(inserted_keys.len());
        let mut unchanged = Vec::new();
        for key in &new_keys {
            let application = new_by_key[key];
            if inserted_set.contains(key) {
                creation_order += 1;
                inserted.push(ConceptApplication {
                    id: ids[key],
                    concept_info_type_name: application.concept_info_type_name.clone(),
                    concept_info_key: application.concept_info_key.clone(),
                    implementation_type_name: application.implementation_type_name.clone(),
                    create_query: application.create_query.clone(),
                    remove_query: application.remove_query.clone(),
                    depends_on: resolve(application),
                    creation_order,
                    applied_at: None,
                });
            } else {
                let applied = old_by_key[key];
                let kept = ConceptApplication {
                    concept_info_type_name: application.concept_info_type_name.clone(),
                    remove_query: application.remove_query.clone(),
                    depends_on: resolve(application),
                    ..applied.clone()
                };
                unchanged.push((kept, applied.clone()));
            }
        }

        debug!(
            removed = removed.len(),
            inserted = inserted.len(),
            unchanged = unchanged.len(),
            "Computed migration plan"
        );
        Ok(Self {
            removed,
            inserted,
            unchanged,
        })
    }

    /// Returns whether the plan changes no database object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.inserted.is_empty()
    }
}

fn index_old(
    old: &[ConceptApplication],
) -> Result<HashMap<ConceptApplicationKey, &ConceptApplication>> {
    let mut by_key: HashMap<ConceptApplicationKey, &ConceptApplication> = HashMap::new();
    for application in old {
        if let Some(first) = by_key.insert(application.key(), application) {
            return Err(GeneratorError::DuplicateApplication {
                key: application.key().to_string(),
                first_id: first.id,
                second_id: application.id,
            });
        }
    }
    Ok(by_key)
}

fn index_new(
    new: &[NewConceptApplication],
) -> Result<HashMap<ConceptApplicationKey, &NewConceptApplication>> {
    let mut by_key: HashMap<ConceptApplicationKey, &NewConceptApplication> = HashMap::new();
    for application in new {
        if let Some(first) = by_key.insert(application.key(), application) {
            return Err(GeneratorError::DuplicateApplication {
                key: application.key().to_string(),
                first_id: first.id,
                second_id: application.id,
            });
        }
    }
    Ok(by_key)
}

fn old_edges(
    old: &[ConceptApplication],
) -> Result<Vec<(ConceptApplicationKey, ConceptApplicationKey)>> {
    let by_id: HashMap<Uuid, &ConceptApplication> = old.iter().map(|a| (a.id, a)).collect();
    let mut edges = Vec::new();
    for application in old {
        for depends_on_id in &application.depends_on {
            let Some(depends_on) = by_id.get(depends_on_id) else {
                return Err(GeneratorError::DanglingDependency {
                    dependent_id: application.id,
                    depends_on_id: *depends_on_id,
                });
            };
            edges.push((depends_on.key(), application.key()));
        }
    }
    Ok(edges)
}

fn new_edges(
    new: &[NewConceptApplication],
    by_key: &HashMap<ConceptApplicationKey, &NewConceptApplication>,
) -> Result<Vec<(ConceptApplicationKey, ConceptApplicationKey)>> {
    let mut edges = Vec::new();
    for application in new {
        for depends_on in &application.depends_on {
            if !by_key.contains_key(depends_on) {
                return Err(GeneratorError::InvalidModel(format!(
                    "'{}' depends on unknown concept application '{depends_on}'",
                    application.key()
                )));
            }
            edges.push((depends_on.clone(), application.key()));
        }
    }
    Ok(edges)
}

/// Returns the keys to remove (old keys) and to insert (new keys).
fn changed_keys(
    old_keys: &[ConceptApplicationKey],
    new_keys: &[ConceptApplicationKey],
    old_by_key: &HashMap<ConceptApplicationKey, &ConceptApplication>,
    new_by_key: &HashMap<ConceptApplicationKey, &NewConceptApplication>,
    old_edges: &[(ConceptApplicationKey, ConceptApplicationKey)],
    new_edges: &[(ConceptApplicationKey, ConceptApplicationKey)],
) -> (Vec<ConceptApplicationKey>, Vec<ConceptApplicationKey>) {
    let mut removed = KeySet::default();
    let mut inserted = KeySet::default();

    let mut old_dependencies_of: HashMap<_, HashSet<_>> = HashMap::with_capacity(old_keys.len());
    for (depends_on, dependent) in old_edges {
        old_dependencies_of
            .entry(dependent)
            .or_default()
            .insert(depends_on);
    }
    let no_dependencies: HashSet<&ConceptApplicationKey> = HashSet::new();

    for key in old_keys {
        if !new_by_key.contains_key(key) {
            removed.push(key);
        }
    }
    for key in new_keys {
        let application = new_by_key[key];
        let Some(applied) = old_by_key.get(key) else {
            inserted.push(key);
            continue;
        };
        if !application.same_definition(applied) {
            removed.push(key);
            inserted.push(key);
            continue;
        }

        let old_dependencies = old_dependencies_of.get(key).unwrap_or(&no_dependencies);
        let new_dependencies: HashSet<&ConceptApplicationKey> =
            application.depends_on.iter().collect();
        if *old_dependencies != new_dependencies {
            removed.push(key);
            inserted.push(key);
            for dropped in old_dependencies.difference(&new_dependencies) {
                removed.push(dropped);
            }
            for added in new_dependencies.difference(old_dependencies) {
                inserted.push(added);
            }
        }
    }

    loop {
        let before = (removed.len(), inserted.len());

        include_dependents(&mut removed.keys, old_edges);
        removed.sync();
        for key in removed.keys.clone() {
            if new_by_key.contains_key(&key) {
                inserted.push(&key);
            }
        }

        include_dependents(&mut inserted.keys, new_edges);
        inserted.sync();
        for key in inserted.keys.clone() {
            if old_by_key.contains_key(&key) {
                removed.push(&key);
            }
        }

        if (removed.len(), inserted.len()) == before {
            break;
        }
    }

    (removed.keys, inserted.keys)
}

#[derive(Default)]
struct KeySet {
    keys: Vec<ConceptApplicationKey>,
    members: HashSet<ConceptApplicationKey>,
}

impl KeySet {
    fn push(&mut self, key: &ConceptApplicationKey) {
        if self.members.insert(key.clone()) {
            self.keys.push(key.clone());
        }
    }

    fn sync(&mut self) {
        self.members.extend(self.keys.iter().cloned());
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptId;

    const IMPLEMENTATION: &str = "Test, Version=1";

    fn key(name: &str) -> ConceptApplicationKey {
        ConceptApplicationKey::new(name, IMPLEMENTATION)
    }

    /// Builds applied applications from `(name, create_query, depends_on)`.
    fn old(specs: &[(&str, &str, &[&str])]) -> Vec<ConceptApplication> {
        let ids: HashMap<&str, Uuid> = specs.iter().map(|(n, _, _)| (*n, Uuid::new_v4())).collect();
        specs
            .iter()
            .enumerate()
            .map(|(i, (name, create, deps))| ConceptApplication {
                id: ids[name],
                concept_info_type_name: "Test".into(),
                concept_info_key: (*name).into(),
                implementation_type_name: IMPLEMENTATION.into(),
                create_query: (*create).into(),
                remove_query: format!("drop-{create}"),
                depends_on: deps.iter().map(|d| ids[d]).collect(),
                creation_order: i64::try_from(i).unwrap() + 1,
                applied_at: None,
            })
            .collect()
    }

    fn new(specs: &[(&str, &str, &[&str])]) -> Vec<NewConceptApplication> {
        specs
            .iter()
            .enumerate()
            .map(|(i, (name, create, deps))| NewConceptApplication {
                id: Uuid::new_v4(),
                concept: ConceptId(i),
                concept_info_type_name: "Test".into(),
                concept_info_key: (*name).into(),
                implementation_type_name: IMPLEMENTATION.into(),
                create_query: (*create).into(),
                remove_query: format!("drop-{create}"),
                depends_on: deps.iter().map(|d| key(d)).collect(),
            })
            .collect()
    }

    fn names(applications: &[ConceptApplication]) -> Vec<&str> {
        applications
            .iter()
            .map(|a| a.concept_info_key.as_str())
            .collect()
    }

    #[test]
    fn test_unchanged_model_is_empty() {
        let old = old(&[("A", "sqlA", &[]), ("B", "sqlB", &["A"])]);
        let new = new(&[("A", "sqlA", &[]), ("B", "sqlB", &["A"])]);

        let plan = MigrationPlan::compute(&old, &new).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged.len(), 2);
        assert_eq!(plan.unchanged[1].0.id, old[1].id);
        assert_eq!(plan.unchanged[1].0.depends_on, vec![old[0].id]);
    }

    #[test]
    fn test_changed_application_is_recreated() {
        let old = old(&[("A", "sqlA1", &[]), ("B", "sqlB", &[])]);
        let new = new(&[("A", "sqlA2", &[]), ("B", "sqlB", &[])]);

        let plan = MigrationPlan::compute(&old, &new).unwrap();
        assert_eq!(names(&plan.removed), vec!["A"]);
        assert_eq!(names(&plan.inserted), vec!["A"]);
        assert_ne!(plan.inserted[0].id, old[0].id);
        assert_eq!(plan.inserted[0].creation_order, 3);
        assert_eq!(plan.unchanged.len(), 1);
    }

    #[test]
    fn test_dependents_are_recreated() {
        let old = old(&[("A", "sqlA1", &[]), ("B", "sqlB", &["A"]), ("C", "sqlC", &["B"])]);
        let new = new(&[("A", "sqlA2", &[]), ("B", "sqlB", &["A"]), ("C", "sqlC", &["B"])]);

        let plan = MigrationPlan::compute(&old, &new).unwrap();
        assert_eq!(names(&plan.removed), vec!["C", "B", "A"]);
        assert_eq!(names(&plan.inserted), vec!["A", "B", "C"]);

        // Unchanged definitions keep their ids; dependencies point at the new A.
        assert_eq!(plan.inserted[1].id, old[1].id);
        assert_eq!(plan.inserted[1].depends_on, vec![plan.inserted[0].id]);
        assert!(plan.unchanged.is_empty());
    }

    #[test]
    fn test_added_and_removed_dependency_refreshes_both_ends() {
        let old = old(&[("A", "sqlA", &[]), ("B", "sqlB", &[]), ("C", "sqlC", &["A"])]);
        let new = new(&[("A", "sqlA", &[]), ("B", "sqlB", &[]), ("C", "sqlC", &["B"])]);

        let plan = MigrationPlan::compute(&old, &new).unwrap();
        let mut removed = names(&plan.removed);
        removed.sort_unstable();
        assert_eq!(removed, vec!["A", "B", "C"]);
        assert_eq!(names(&plan.inserted), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_new_dependent_on_existing_application() {
        let old = old(&[("A", "sqlA", &[])]);
        let new = new(&[("A", "sqlA", &[]), ("B", "sqlB", &["A"])]);

        let plan = MigrationPlan::compute(&old, &new).unwrap();
        assert!(plan.removed.is_empty());
        assert_eq!(names(&plan.inserted), vec!["B"]);
        assert_eq!(plan.inserted[0].depends_on, vec![old[0].id]);
    }

    #[test]
    fn test_removed_application() {
        let old = old(&[("A", "sqlA", &[]), ("B", "sqlB", &[])]);
        let new = new(&[("B", "sqlB", &[])]);

        let plan = MigrationPlan::compute(&old, &new).unwrap();
        assert_eq!(names(&plan.removed), vec!["A"]);
        assert!(plan.inserted.is_empty());
    }

    #[test]
    fn test_insertion_order_is_stable() {
        let new = new(&[("C", "c", &[]), ("A", "a", &["B"]), ("B", "b", &[]), ("D", "d", &[])]);

        let plan = MigrationPlan::compute(&[], &new).unwrap();
        assert_eq!(names(&plan.inserted), vec!["C", "B", "A", "D"]);
        let orders: Vec<i64> = plan.inserted.iter().map(|a| a.creation_order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let new = new(&[("A", "a", &["C"]), ("B", "b", &["A"]), ("C", "c", &["B"])]);

        match MigrationPlan::compute(&[], &new) {
            Err(GeneratorError::CircularDependency { nodes }) => {
                for name in ["A", "B", "C"] {
                    assert!(nodes.contains(&key(name).to_string()), "{nodes:?}");
                }
            }
            other => panic!("Expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_large_unchanged_model() {
        let names: Vec<String> = (0..5000).map(|i| format!("N{i}")).collect();
        let deps: Vec<Vec<&str>> = (0..names.len())
            .map(|i| (i.saturating_sub(3)..i).map(|d| names[d].as_str()).collect())
            .collect();
        let specs: Vec<(&str, &str, &[&str])> = names
            .iter()
            .zip(&deps)
            .map(|(name, deps)| (name.as_str(), "sql", deps.as_slice()))
            .collect();
        let old = old(&specs);
        let new = new(&specs);

        let plan = MigrationPlan::compute(&old, &new).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged.len(), 5000);

        // Changing the root recreates the whole chain in dependency order.
        let mut changed = specs.clone();
        changed[0].1 = "sql2";
        let plan = MigrationPlan::compute(&old, &self::new(&changed)).unwrap();
        assert_eq!(plan.removed.len(), 5000);
        assert_eq!(plan.inserted.first().map(|a| a.concept_info_key.as_str()), Some("N0"));
        assert_eq!(plan.removed.first().map(|a| a.concept_info_key.as_str()), Some("N4999"));
    }

    #[test]
    fn test_dangling_old_dependency() {
        let mut old = old(&[("A", "sqlA", &[])]);
        old[0].depends_on.push(Uuid::new_v4());

        assert!(matches!(
            MigrationPlan::compute(&old, &[]),
            Err(GeneratorError::DanglingDependency { .. })
        ));
    }
}
