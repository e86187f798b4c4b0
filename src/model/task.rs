use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::io::IoDescriptor;
use crate::model::partition::PartInfo;
use crate::model::workunit::Workunit;

/// Resolved command for a task, as produced by the workflow-description
/// processor. The scheduler never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
            env: HashMap::new(),
        }
    }

    /// Convenience for tests and simple tasks: run a line through the shell.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("/bin/sh", vec!["-c".to_string(), line.into()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Init,
    Pending,
    Queued,
    InProgress,
    Suspend,
    Completed,
    Fail,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Fail)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Init => "init",
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::InProgress => "in-progress",
            TaskState::Suspend => "suspend",
            TaskState::Completed => "completed",
            TaskState::Fail => "fail",
        };
        write!(f, "{s}")
    }
}

/// One step of a job's workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Job-scoped task id.
    pub id: String,
    pub job_id: String,
    /// Ids of upstream tasks that must complete before this one is enqueued.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub cmd: Command,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<IoDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<IoDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predata: Vec<IoDescriptor>,
    /// Number of parallel workunits; 1 means a single unpartitioned unit.
    pub total_work: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartInfo>,
    pub state: TaskState,
    /// Workunits of this task not yet in a terminal state. Maintained by the
    /// work queue as units finish; 0 with state in-progress means completed.
    pub remaining_work: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_attr: HashMap<String, String>,
}

impl Task {
    pub fn new(job_id: impl Into<String>, id: impl Into<String>, cmd: Command) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            depends_on: Vec::new(),
            cmd,
            inputs: Vec::new(),
            outputs: Vec::new(),
            predata: Vec::new(),
            total_work: 1,
            partition: None,
            state: TaskState::Init,
            remaining_work: 0,
            user_attr: HashMap::new(),
        }
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    pub fn with_input(mut self, io: IoDescriptor) -> Self {
        self.inputs.push(io);
        self
    }

    pub fn with_output(mut self, io: IoDescriptor) -> Self {
        self.outputs.push(io);
        self
    }

    pub fn with_predata(mut self, io: IoDescriptor) -> Self {
        self.predata.push(io);
        self
    }

    pub fn with_total_work(mut self, total_work: u32, partition: PartInfo) -> Self {
        self.total_work = total_work.max(1);
        self.partition = Some(partition);
        self
    }

    /// True when every dependency appears in `completed`.
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.depends_on.iter().all(|d| completed.contains(d))
    }

    /// Ranks of the workunits this task expands into: the single rank-0
    /// primary unit when unpartitioned, else 1..=total_work.
    pub fn ranks(&self) -> Vec<u32> {
        if self.total_work <= 1 {
            vec![0]
        } else {
            (1..=self.total_work).collect()
        }
    }

    /// Expand this task into its workunits, all in init state.
    pub fn expand(&self) -> Vec<Workunit> {
        self.ranks().iter().map(|&r| Workunit::new(self, r)).collect()
    }
}
