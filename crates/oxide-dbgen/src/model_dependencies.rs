//! Dependencies between new concept applications.
//!
//! Application dependencies come from two sources:
//! - concept references: an application of concept A depends on every
//!   application of each concept A references. A referenced concept without
//!   applications is bridged to its own references.
//! - extra dependencies declared by plugins, resolved the same way.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::application::NewConceptApplication;
use crate::concept::{ConceptId, ConceptModel};
use crate::error::Result;
use crate::plugins::ExtraDependency;

/// Resolves concept-level dependencies to application-level ones.
#[derive(Debug)]
pub struct DatabaseModelDependencies<'a> {
    model: &'a ConceptModel,
    applications_by_concept: HashMap<ConceptId, Vec<usize>>,
}

impl<'a> DatabaseModelDependencies<'a> {
    /// Indexes `applications` by the concept they were generated from.
    #[must_use]
    pub fn new(model: &'a ConceptModel, applications: &[NewConceptApplication]) -> Self {
        let mut applications_by_concept: HashMap<ConceptId, Vec<usize>> = HashMap::new();
        for (index, application) in applications.iter().enumerate() {
            applications_by_concept
                .entry(application.concept)
                .or_default()
                .push(index);
        }
        Self {
            model,
            applications_by_concept,
        }
    }

    /// Returns `(depends_on, dependent)` pairs of application indexes,
    /// deduplicated, in model order.
    pub fn dependencies(&self, extra: &[ExtraDependency]) -> Result<Vec<(usize, usize)>> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut add = |depends_on: usize, dependent: usize| {
            if depends_on != dependent && seen.insert((depends_on, dependent)) {
                result.push((depends_on, dependent));
            }
        };

        for (concept, _) in self.model.iter() {
            let Some(dependents) = self.applications_by_concept.get(&concept) else {
                continue;
            };
            for target in self.implemented_dependencies(concept)? {
                for &depends_on in &self.applications_by_concept[&target] {
                    for &dependent in dependents {
                        add(depends_on, dependent);
                    }
                }
            }
        }

        for dependency in extra {
            if dependency.depends_on == dependency.dependent {
                continue;
            }
            let Some(dependents) = self.applications_by_concept.get(&dependency.dependent) else {
                continue;
            };
            for target in self.resolve(dependency.depends_on)? {
                for &depends_on in &self.applications_by_concept[&target] {
                    for &dependent in dependents {
                        add(depends_on, dependent);
                    }
                }
            }
        }

        Ok(result)
    }

    /// Returns the concepts with applications that `concept` depends on,
    /// looking through referenced concepts that have no applications.
    pub fn implemented_dependencies(&self, concept: ConceptId) -> Result<Vec<ConceptId>> {
        let mut result = Vec::new();
        let mut visited = HashSet::from([concept]);
        let mut queue: VecDeque<ConceptId> = self.model.dependencies(concept)?.into();
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            if self.applications_by_concept.contains_key(&current) {
                result.push(current);
            } else {
                queue.extend(self.model.dependencies(current)?);
            }
        }
        Ok(result)
    }

    fn resolve(&self, concept: ConceptId) -> Result<Vec<ConceptId>> {
        if self.applications_by_concept.contains_key(&concept) {
            Ok(vec![concept])
        } else {
            self.implemented_dependencies(concept)
        }
    }
}
