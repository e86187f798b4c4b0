use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::task::{Task, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Suspended,
    /// Owning context is gone but records persist; eligible for cleanup.
    Zombie,
    Completed,
    Deleted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Active => "active",
            JobState::Suspended => "suspended",
            JobState::Zombie => "zombie",
            JobState::Completed => "completed",
            JobState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// A submitted workflow instance: an ordered set of tasks plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Owning user; scope for bulk suspend/resume/delete operations.
    pub user: String,
    pub state: JobState,
    pub tasks: Vec<Task>,
    /// Reason recorded when the job was last suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(user: impl Into<String>, mut tasks: Vec<Task>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        for task in &mut tasks {
            task.job_id = id.clone();
        }
        let now = Utc::now();
        Self {
            id,
            user: user.into(),
            state: JobState::Active,
            tasks,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a job with a fixed id, e.g. when loading from the store.
    pub fn with_id(id: impl Into<String>, user: impl Into<String>, mut tasks: Vec<Task>) -> Self {
        let id = id.into();
        for task in &mut tasks {
            task.job_id = id.clone();
        }
        let now = Utc::now();
        Self {
            id,
            user: user.into(),
            state: JobState::Active,
            tasks,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn completed_task_ids(&self) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Tasks whose dependencies are satisfied and that have not started yet.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let done = self.completed_task_ids();
        self.tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Init | TaskState::Pending))
            .filter(|t| t.is_ready(&done))
            .collect()
    }

    pub fn all_tasks_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Completed)
    }

    pub fn has_failed_task(&self) -> bool {
        self.tasks.iter().any(|t| t.state == TaskState::Fail)
    }

    /// Ids of this task and everything that transitively depends on it, in
    /// task order. Used by recompute to invalidate downstream results.
    pub fn downstream_of(&self, task_id: &str) -> Vec<String> {
        let mut affected: HashSet<String> = HashSet::new();
        affected.insert(task_id.to_string());
        // Tasks are ordered, so one forward pass closes the set.
        loop {
            let before = affected.len();
            for task in &self.tasks {
                if task.depends_on.iter().any(|d| affected.contains(d)) {
                    affected.insert(task.id.clone());
                }
            }
            if affected.len() == before {
                break;
            }
        }
        self.tasks
            .iter()
            .filter(|t| affected.contains(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Per-state task counts for the status surface.
    pub fn task_state_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for task in &self.tasks {
            *counts.entry(task.state.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
