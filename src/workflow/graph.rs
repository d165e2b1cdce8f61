//! Dependency Graph
//!
//! Turns a workflow into an executable schedule:
//! - Edge construction from explicit `depends_on` lists
//! - Rejection of unknown references, duplicates and cycles
//! - Ready-set ("frontier") computation while a run progresses
//! - Level layering for plan previews
//!
//! Sub-steps of a parallel group are nodes of their own so later steps can
//! depend on them, but they are owned by their group: the scheduler never
//! hands them out individually, and the run loop marks them executed once
//! the group returns.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::debug;
use thiserror::Error;

use super::model::{Step, Workflow};

/// Runtime scheduling errors. Both indicate a bug in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("step '{0}' does not exist in the dependency graph")]
    UnknownStep(String),

    #[error("step '{0}' has already been marked executed")]
    AlreadyExecuted(String),
}

/// A structural problem found while building the graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyIssue {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    #[error("step '{step}' depends on '{sibling}' in the same parallel group")]
    SiblingDependency { step: String, sibling: String },

    #[error("cyclic dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Executable schedule for one workflow.
///
/// The graph tracks three sets while a run progresses:
/// - steps handed out by [`ready_steps`](Self::ready_steps) but not finished
/// - steps marked executed
/// - everything else (pending)
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Step definitions by id
    steps: HashMap<String, Step>,
    /// Top-level ids in declaration order
    order: Vec<String>,
    /// step -> prerequisites
    deps: HashMap<String, BTreeSet<String>>,
    /// step -> steps waiting on it
    dependents: HashMap<String, BTreeSet<String>>,
    /// sub-step -> owning group
    owner: HashMap<String, String>,
    dispatched: HashSet<String>,
    executed: HashSet<String>,
}

impl DependencyGraph {
    /// Builds and validates the graph for a workflow.
    ///
    /// # Returns
    ///
    /// * `Ok(DependencyGraph)` - The graph is acyclic and fully resolved
    /// * `Err(issues)` - Every structural problem found; nothing may run
    pub fn build(workflow: &Workflow) -> Result<Self, Vec<DependencyIssue>> {
        let mut issues = Vec::new();
        let mut graph = Self {
            steps: HashMap::new(),
            order: Vec::new(),
            deps: HashMap::new(),
            dependents: HashMap::new(),
            owner: HashMap::new(),
            dispatched: HashSet::new(),
            executed: HashSet::new(),
        };

        // Register nodes
        for step in &workflow.steps {
            if !graph.insert_node(step, None) {
                issues.push(DependencyIssue::DuplicateStep(step.id.clone()));
                continue;
            }
            graph.order.push(step.id.clone());
            for sub in &step.parallel {
                if !graph.insert_node(sub, Some(&step.id)) {
                    issues.push(DependencyIssue::DuplicateStep(sub.id.clone()));
                }
            }
        }

        // Register edges
        for step in &workflow.steps {
            for dep in &step.depends_on {
                graph.add_edge(&step.id, dep, &mut issues);
            }

            let siblings: HashSet<&str> = step.parallel.iter().map(|s| s.id.as_str()).collect();
            for sub in &step.parallel {
                // A sub-step finishes together with its group
                graph.add_edge(&sub.id, &step.id, &mut issues);

                for dep in &sub.depends_on {
                    if siblings.contains(dep.as_str()) {
                        issues.push(DependencyIssue::SiblingDependency {
                            step: sub.id.clone(),
                            sibling: dep.clone(),
                        });
                    } else {
                        // The group cannot start before any member's prerequisites
                        graph.add_edge(&step.id, dep, &mut issues);
                    }
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            issues.push(DependencyIssue::Cycle(cycle));
        }

        if issues.is_empty() {
            debug!(
                "Dependency graph built: {} nodes, {} top-level",
                graph.size(),
                graph.order.len()
            );
            Ok(graph)
        } else {
            Err(issues)
        }
    }

    /// Registers a node; returns false if the id is already taken.
    fn insert_node(&mut self, step: &Step, owner: Option<&str>) -> bool {
        if self.steps.contains_key(&step.id) {
            return false;
        }
        self.steps.insert(step.id.clone(), step.clone());
        self.deps.entry(step.id.clone()).or_default();
        self.dependents.entry(step.id.clone()).or_default();
        if let Some(group) = owner {
            self.owner.insert(step.id.clone(), group.to_string());
        }
        true
    }

    fn add_edge(&mut self, step: &str, dependency: &str, issues: &mut Vec<DependencyIssue>) {
        if !self.steps.contains_key(dependency) {
            issues.push(DependencyIssue::MissingDependency {
                step: step.to_string(),
                dependency: dependency.to_string(),
            });
            return;
        }
        self.deps
            .entry(step.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.dependents
            .entry(dependency.to_string())
            .or_default()
            .insert(step.to_string());
    }

    /// Depth-first search for a cycle, returning its path if one exists.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| n == node).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(node.to_string(), Mark::Visiting);
            path.push(node.to_string());
            if let Some(deps) = graph.deps.get(node) {
                for dep in deps {
                    if let Some(cycle) = visit(graph, dep, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(node.to_string(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        let mut ids: Vec<&String> = self.steps.keys().collect();
        ids.sort();
        for id in ids {
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, id, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Returns the top-level steps whose prerequisites are all executed.
    ///
    /// Each step is handed out at most once: returned ids move into the
    /// dispatched set until [`mark_executed`](Self::mark_executed) is called.
    /// Results follow declaration order.
    pub fn ready_steps(&mut self) -> Vec<String> {
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| !self.executed.contains(*id) && !self.dispatched.contains(*id))
            .filter(|id| {
                self.deps
                    .get(*id)
                    .map_or(true, |deps| deps.iter().all(|d| self.executed.contains(d)))
            })
            .cloned()
            .collect();

        self.dispatched.extend(ready.iter().cloned());
        ready
    }

    /// Records that a step reached a terminal status.
    ///
    /// # Errors
    ///
    /// Fails if the step is unknown or was already marked.
    pub fn mark_executed(&mut self, step_id: &str) -> Result<(), GraphError> {
        if !self.steps.contains_key(step_id) {
            return Err(GraphError::UnknownStep(step_id.to_string()));
        }
        if !self.executed.insert(step_id.to_string()) {
            return Err(GraphError::AlreadyExecuted(step_id.to_string()));
        }
        self.dispatched.remove(step_id);
        Ok(())
    }

    /// Total number of nodes, sub-steps included.
    pub fn size(&self) -> usize {
        self.steps.len()
    }

    /// Number of nodes marked executed.
    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }

    /// Returns true once every node has been marked executed.
    pub fn is_complete(&self) -> bool {
        self.executed.len() == self.steps.len()
    }

    pub fn is_executed(&self, step_id: &str) -> bool {
        self.executed.contains(step_id)
    }

    /// Looks up a step definition.
    pub fn get_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    /// Top-level step ids that have not been marked executed, in order.
    pub fn pending_top_level(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !self.executed.contains(*id))
            .cloned()
            .collect()
    }

    /// Direct prerequisites of a step, sorted.
    pub fn dependencies(&self, step_id: &str) -> Vec<String> {
        self.deps
            .get(step_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Steps that directly wait on this one, sorted.
    pub fn dependents(&self, step_id: &str) -> Vec<String> {
        self.dependents
            .get(step_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Group that owns a sub-step, if any.
    pub fn group_of(&self, step_id: &str) -> Option<&str> {
        self.owner.get(step_id).map(String::as_str)
    }

    /// Groups top-level steps into levels that could run together.
    ///
    /// Uses Kahn's algorithm over top-level steps; a dependency on a sub-step
    /// counts as a dependency on its group. Each level is sorted.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let resolve = |id: &String| -> String {
            self.owner.get(id).cloned().unwrap_or_else(|| id.clone())
        };

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut forward: HashMap<String, BTreeSet<String>> = HashMap::new();
        for id in &self.order {
            let prereqs: BTreeSet<String> = self
                .deps
                .get(id)
                .map(|d| d.iter().map(resolve).filter(|p| p != id).collect())
                .unwrap_or_default();
            in_degree.insert(id.as_str(), prereqs.len());
            for p in prereqs {
                forward.entry(p).or_default().insert(id.clone());
            }
        }

        let mut levels = Vec::new();
        let mut queue: VecDeque<String> = {
            let mut roots: Vec<String> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| id.to_string())
                .collect();
            roots.sort();
            roots.into()
        };

        while !queue.is_empty() {
            let level: Vec<String> = queue.drain(..).collect();
            let mut next = Vec::new();
            for id in &level {
                if let Some(children) = forward.get(id) {
                    for child in children {
                        if let Some(d) = in_degree.get_mut(child.as_str()) {
                            *d -= 1;
                            if *d == 0 {
                                next.push(child.clone());
                            }
                        }
                    }
                }
            }
            next.sort();
            queue.extend(next);
            levels.push(level);
        }

        levels
    }
}
