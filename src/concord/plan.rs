//! The terminal plan artifact.
//!
//! Every completed negotiation produces a [`Plan`]: human-readable summary
//! text, optionally accompanied by a [`StructuredPlan`] — participants, a task
//! DAG, and explicit topology edges.  The structured form is additive: a
//! center that only emits text is valid, and a structured plan that fails
//! validation (cycle, dangling prerequisite) is dropped with a warning rather
//! than failing the session.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;

/// Lifecycle state of one plan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

/// One participant appearing in the structured plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanParticipant {
    pub agent_id: String,
    pub display_name: String,
    pub role_in_plan: String,
}

/// One task in the plan's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub assignee_id: String,
    /// Ids of tasks that must complete before this one may start.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

/// An explicit dependency edge between two tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEdge {
    pub from: String,
    pub to: String,
}

/// The edge list view of the task graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanTopology {
    #[serde(default)]
    pub edges: Vec<PlanEdge>,
}

/// The optional structured form of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredPlan {
    pub summary: String,
    #[serde(default)]
    pub participants: Vec<PlanParticipant>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub topology: PlanTopology,
}

/// Why a structured plan was rejected.
#[derive(Debug, Clone)]
pub enum PlanValidationError {
    /// A prerequisite names a task id that does not exist in this plan.
    DanglingPrerequisite { task: String, missing: String },
    /// A topology edge endpoint names a task id that does not exist.
    DanglingEdge { from: String, to: String },
    /// The dependency graph (prerequisites plus topology edges) has a cycle
    /// reachable from the named task.
    CycleDetected { task: String },
    /// Two tasks share an id.
    DuplicateTaskId { task: String },
}

impl fmt::Display for PlanValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanValidationError::DanglingPrerequisite { task, missing } => write!(
                f,
                "Task '{}' requires unknown prerequisite '{}'",
                task, missing
            ),
            PlanValidationError::DanglingEdge { from, to } => {
                write!(f, "Topology edge {} -> {} references an unknown task", from, to)
            }
            PlanValidationError::CycleDetected { task } => {
                write!(f, "Task graph has a cycle through '{}'", task)
            }
            PlanValidationError::DuplicateTaskId { task } => {
                write!(f, "Duplicate task id '{}'", task)
            }
        }
    }
}

impl Error for PlanValidationError {}

impl StructuredPlan {
    /// Check the §3 invariants: unique task ids, every prerequisite and edge
    /// endpoint resolves, and the combined dependency graph is acyclic.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanValidationError::DuplicateTaskId {
                    task: task.id.clone(),
                });
            }
        }

        for task in &self.tasks {
            for prereq in &task.prerequisites {
                if !ids.contains(prereq.as_str()) {
                    return Err(PlanValidationError::DanglingPrerequisite {
                        task: task.id.clone(),
                        missing: prereq.clone(),
                    });
                }
            }
        }

        for edge in &self.topology.edges {
            if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
                return Err(PlanValidationError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
        }

        // Dependency adjacency: prerequisite -> task, plus explicit edges.
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            for prereq in &task.prerequisites {
                dependents
                    .entry(prereq.as_str())
                    .or_insert_with(Vec::new)
                    .push(task.id.as_str());
            }
        }
        for edge in &self.topology.edges {
            dependents
                .entry(edge.from.as_str())
                .or_insert_with(Vec::new)
                .push(edge.to.as_str());
        }

        // Iterative DFS with colors: 0 unvisited, 1 on stack, 2 done.
        let mut color: HashMap<&str, u8> = HashMap::new();
        for task in &self.tasks {
            if color.get(task.id.as_str()).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(task.id.as_str(), 0)];
            color.insert(task.id.as_str(), 1);
            while let Some((node, next_child)) = stack.pop() {
                let children = dependents.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
                if next_child < children.len() {
                    stack.push((node, next_child + 1));
                    let child = children[next_child];
                    match color.get(child).copied().unwrap_or(0) {
                        0 => {
                            color.insert(child, 1);
                            stack.push((child, 0));
                        }
                        1 => {
                            return Err(PlanValidationError::CycleDetected {
                                task: child.to_string(),
                            });
                        }
                        _ => {}
                    }
                } else {
                    color.insert(node, 2);
                }
            }
        }

        Ok(())
    }
}

/// The terminal artifact of a negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Human-readable plan (or rejection) text.  Always present.
    pub text: String,
    /// Validated structured form, when the center supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredPlan>,
    /// `false` when the center rejected the negotiation (no viable plan).
    pub viable: bool,
}

impl Plan {
    /// A viable plan from summary text alone.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
            viable: true,
        }
    }

    /// The negative artifact produced by the `reject` tool.
    pub fn rejection(reason: impl Into<String>) -> Self {
        Self {
            text: reason.into(),
            structured: None,
            viable: false,
        }
    }

    /// Attach a structured form (assumed already validated).
    pub fn with_structured(mut self, structured: StructuredPlan) -> Self {
        self.structured = Some(structured);
        self
    }
}
