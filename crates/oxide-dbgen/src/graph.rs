//! Dependency graph utilities.
//!
//! Every function here takes dependencies as `(depends_on, dependent)` pairs:
//! the first element must exist before the second one can be created.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use crate::error::{GeneratorError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Sorts `list` so that every dependency comes before its dependents.
///
/// Dependencies that reference nodes outside of `list` are ignored, so a
/// subset of a larger graph can be sorted with the full edge list. Nodes
/// without an ordering constraint between them keep their relative input
/// order. Duplicate nodes in `list` are collapsed to their first occurrence.
///
/// Returns [`GeneratorError::CircularDependency`] listing every node on the
/// first detected cycle.
pub fn topological_sort<T>(list: &mut Vec<T>, dependencies: &[(T, T)]) -> Result<()>
where
    T: Eq + Hash + Clone + Display,
{
    let sorted = sorted_copy(list, dependencies)?;
    *list = sorted;
    Ok(())
}

fn sorted_copy<T>(list: &[T], dependencies: &[(T, T)]) -> Result<Vec<T>>
where
    T: Eq + Hash + Clone + Display,
{
    let members: HashSet<&T> = list.iter().collect();
    let mut depends_on: HashMap<&T, Vec<&T>> = HashMap::new();
    for (dependency, dependent) in dependencies {
        if members.contains(dependency) && members.contains(dependent) {
            depends_on.entry(dependent).or_default().push(dependency);
        }
    }

    let mut visits: HashMap<&T, Visit> = HashMap::with_capacity(list.len());
    let mut sorted = Vec::with_capacity(list.len());
    for node in list {
        visit(node, &depends_on, &mut visits, &mut sorted)?;
    }
    Ok(sorted)
}

/// Depth-first post-order walk from `root` with an explicit stack, so the
/// depth of a dependency chain is bounded by memory rather than the call
/// stack.
fn visit<'a, T>(
    root: &'a T,
    depends_on: &HashMap<&'a T, Vec<&'a T>>,
    visits: &mut HashMap<&'a T, Visit>,
    sorted: &mut Vec<T>,
) -> Result<()>
where
    T: Eq + Hash + Clone + Display,
{
    if visits.contains_key(root) {
        return Ok(());
    }

    // Nodes on the current path with the index of their next dependency.
    let mut path: Vec<(&'a T, usize)> = vec![(root, 0)];
    visits.insert(root, Visit::InProgress);
    while let Some((node, next)) = path.last_mut() {
        let dependencies = depends_on.get(*node).map_or(&[][..], Vec::as_slice);
        let Some(&dependency) = dependencies.get(*next) else {
            let node = *node;
            path.pop();
            visits.insert(node, Visit::Done);
            sorted.push(node.clone());
            continue;
        };
        *next += 1;

        match visits.get(dependency) {
            Some(Visit::Done) => {}
            Some(Visit::InProgress) => {
                let start = path.iter().position(|(n, _)| *n == dependency).unwrap_or(0);
                let mut nodes: Vec<String> =
                    path[start..].iter().map(|(n, _)| n.to_string()).collect();
                nodes.push(dependency.to_string());
                return Err(GeneratorError::CircularDependency { nodes });
            }
            None => {
                visits.insert(dependency, Visit::InProgress);
                path.push((dependency, 0));
            }
        }
    }
    Ok(())
}

/// Computes the transitive closure of a direct relation set.
///
/// The result is deduplicated and grouped by source in order of first
/// appearance. Cycles terminate; a node on a cycle (or with a self-loop)
/// relates to itself.
#[must_use]
pub fn indirect_relations<T>(relations: &[(T, T)]) -> Vec<(T, T)>
where
    T: Eq + Hash + Clone,
{
    let mut sources: Vec<&T> = Vec::new();
    let mut successors: HashMap<&T, Vec<&T>> = HashMap::new();
    for (from, to) in relations {
        if !successors.contains_key(from) {
            sources.push(from);
        }
        let next = successors.entry(from).or_default();
        if !next.contains(&to) {
            next.push(to);
        }
    }

    let mut result = Vec::new();
    for source in sources {
        let mut reached: HashSet<&T> = HashSet::new();
        let mut queue: VecDeque<&T> = successors[source].iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if !reached.insert(node) {
                continue;
            }
            result.push((source.clone(), node.clone()));
            if let Some(next) = successors.get(node) {
                queue.extend(next.iter().copied());
            }
        }
    }
    result
}

/// Extends `list` with every node that directly or transitively depends on a
/// node already in it. New nodes are appended in discovery order.
pub fn include_dependents<T>(list: &mut Vec<T>, dependencies: &[(T, T)])
where
    T: Eq + Hash + Clone,
{
    let mut dependents: HashMap<&T, Vec<&T>> = HashMap::new();
    for (dependency, dependent) in dependencies {
        dependents.entry(dependency).or_default().push(dependent);
    }

    let mut included: HashSet<T> = list.iter().cloned().collect();
    let mut queue: VecDeque<T> = list.iter().cloned().collect();
    while let Some(node) = queue.pop_front() {
        let Some(next) = dependents.get(&node) else {
            continue;
        };
        for dependent in next {
            if included.insert((*dependent).clone()) {
                list.push((*dependent).clone());
                queue.push_back((*dependent).clone());
            }
        }
    }
}

/// Returns the candidates that can be removed together without leaving a
/// remaining node that depends on a removed one.
///
/// A candidate is excluded when any node outside the removable set depends on
/// it; exclusions repeat until the set is stable. Input order is preserved.
#[must_use]
pub fn removable_leaves<T>(candidates: &[T], dependencies: &[(T, T)]) -> Vec<T>
where
    T: Eq + Hash + Clone,
{
    let mut dependents: HashMap<&T, Vec<&T>> = HashMap::new();
    for (dependency, dependent) in dependencies {
        dependents.entry(dependency).or_default().push(dependent);
    }

    let mut removable: HashSet<&T> = candidates.iter().collect();
    loop {
        let blocked: Vec<&T> = removable
            .iter()
            .filter(|node| {
                dependents
                    .get(*node)
                    .is_some_and(|next| next.iter().any(|d| !removable.contains(d)))
            })
            .copied()
            .collect();
        if blocked.is_empty() {
            break;
        }
        for node in blocked {
            removable.remove(node);
        }
    }

    candidates
        .iter()
        .filter(|c| removable.contains(c))
        .cloned()
        .collect()
}
