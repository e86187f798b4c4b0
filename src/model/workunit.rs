use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::model::io::IoDescriptor;
use crate::model::partition::{part_range, PartInfo};
use crate::model::task::{Command, Task};

/// Workunit state machine.
///
/// The server's authoritative machine runs init -> queued -> reserved ->
/// checkout -> {done | fail | failed-permanent | discarded}, with suspend
/// reachable from any non-terminal state. Prepared, computed and proxyqueued
/// are client-local states reported by the executing worker and never set by
/// the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkState {
    Init,
    Queued,
    Reserved,
    Checkout,
    Suspend,
    FailedPermanent,
    Done,
    #[serde(rename = "fail")]
    Fail,
    Prepared,
    Computed,
    Discarded,
    Proxyqueued,
}

impl WorkState {
    /// Terminal states are removed from the queue and never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkState::Done | WorkState::FailedPermanent | WorkState::Discarded
        )
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkState::Init => "init",
            WorkState::Queued => "queued",
            WorkState::Reserved => "reserved",
            WorkState::Checkout => "checkout",
            WorkState::Suspend => "suspend",
            WorkState::FailedPermanent => "failed-permanent",
            WorkState::Done => "done",
            WorkState::Fail => "fail",
            WorkState::Prepared => "prepared",
            WorkState::Computed => "computed",
            WorkState::Discarded => "discarded",
            WorkState::Proxyqueued => "proxyqueued",
        };
        write!(f, "{s}")
    }
}

/// Composite workunit identifier: {job, task, rank}. Globally unique and
/// stable for the life of the workunit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkunitId {
    pub job_id: String,
    pub task_id: String,
    pub rank: u32,
}

impl WorkunitId {
    pub fn new(job_id: impl Into<String>, task_id: impl Into<String>, rank: u32) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            rank,
        }
    }

    /// Base64 form used by the data-token protocol.
    pub fn encode(&self) -> String {
        BASE64.encode(self.to_string())
    }

    /// Parse the base64 form. Job ids contain no underscores and the rank is
    /// the trailing component, so the task id may itself contain underscores.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| SchedulerError::BadDataToken(format!("invalid base64: {e}")))?;
        let raw = String::from_utf8(raw)
            .map_err(|_| SchedulerError::BadDataToken("id is not utf-8".to_string()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (job_id, rest) = raw
            .split_once('_')
            .ok_or_else(|| SchedulerError::BadDataToken(format!("malformed id: {raw}")))?;
        let (task_id, rank) = rest
            .rsplit_once('_')
            .ok_or_else(|| SchedulerError::BadDataToken(format!("malformed id: {raw}")))?;
        let rank = rank
            .parse::<u32>()
            .map_err(|_| SchedulerError::BadDataToken(format!("bad rank in id: {raw}")))?;
        Ok(Self::new(job_id, task_id, rank))
    }
}

impl fmt::Display for WorkunitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.job_id, self.task_id, self.rank)
    }
}

/// The atomic schedulable unit: one task executed by one rank.
///
/// Rank 0 is the non-partitioned primary unit; ranks 1..total_work each own a
/// contiguous slice of the task's indexed input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workunit {
    pub id: WorkunitId,
    pub cmd: Command,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<IoDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<IoDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predata: Vec<IoDescriptor>,
    pub total_work: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartInfo>,
    pub state: WorkState,
    /// Retryable failure count.
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_time: Option<DateTime<Utc>>,
    /// Current lease holder. Cleared whenever the unit leaves checkout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_attr: HashMap<String, String>,
    /// Short-lived data-access token handed to the lease holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_token: Option<String>,
    /// Process instance that issued the current lease. A notice arriving for
    /// a lease from another process instance is stale and dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_token: Option<Uuid>,
}

impl Workunit {
    pub fn new(task: &Task, rank: u32) -> Self {
        Self {
            id: WorkunitId::new(task.job_id.clone(), task.id.clone(), rank),
            cmd: task.cmd.clone(),
            inputs: task.inputs.clone(),
            outputs: task.outputs.clone(),
            predata: task.predata.clone(),
            total_work: task.total_work,
            partition: task.partition.clone(),
            state: WorkState::Init,
            failed: 0,
            checkout_time: None,
            reserved_time: None,
            client: None,
            exit_status: None,
            notes: Vec::new(),
            user_attr: task.user_attr.clone(),
            data_token: None,
            server_token: None,
        }
    }

    /// Apply a state transition. Suspending requires a non-empty reason,
    /// which is recorded as a note. Leaving checkout for any reason clears
    /// the lease holder and the issuing instance token.
    pub fn set_state(&mut self, new_state: WorkState, reason: Option<&str>) -> Result<()> {
        if new_state == WorkState::Suspend {
            match reason {
                Some(r) if !r.is_empty() => self.add_note(r),
                _ => return Err(SchedulerError::MissingSuspendReason),
            }
        }
        self.state = new_state;
        if new_state != WorkState::Checkout {
            self.client = None;
            self.server_token = None;
        }
        Ok(())
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Notes joined with `###`, deduplicated preserving first-seen order.
    pub fn notes_joined(&self) -> String {
        let mut seen = std::collections::HashSet::new();
        let uniq: Vec<&str> = self
            .notes
            .iter()
            .map(String::as_str)
            .filter(|n| seen.insert(*n))
            .collect();
        uniq.join("###")
    }

    /// Working directory for this unit, derived deterministically from the
    /// identifier: the job id shards into a three-level tree, then
    /// `<jobid>_<sanitized task name>_<rank>`.
    pub fn work_dir(&self, work_root: &Path) -> PathBuf {
        let jid = &self.id.job_id;
        let task_name = sanitize_task_name(&self.id.task_id);
        let leaf = format!("{}_{}_{}", jid, task_name, self.id.rank);
        if jid.len() >= 6 {
            work_root
                .join(&jid[0..2])
                .join(&jid[2..4])
                .join(&jid[4..6])
                .join(leaf)
        } else {
            work_root.join(leaf)
        }
    }

    /// Partition range string for this rank; empty for rank 0.
    pub fn part(&self) -> String {
        match (&self.partition, self.id.rank) {
            (Some(part), rank) if rank > 0 => part_range(part.total_index, self.total_work, rank),
            _ => String::new(),
        }
    }

    /// Remote index type used to address partitions.
    pub fn index_type(&self) -> &str {
        self.partition.as_ref().map(|p| p.index.as_str()).unwrap_or("")
    }
}

/// Strip a leading `<jobid>/` scope from the task id and map every character
/// outside `[0-9A-Za-z_-]` to `_` so the name is filesystem safe.
fn sanitize_task_name(task_id: &str) -> String {
    let name = match task_id.split_once('/') {
        Some((_, rest)) => rest,
        None => task_id,
    };
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
