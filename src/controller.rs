use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::lock::NamedRwLock;
use crate::model::{Job, JobState, TaskState, WorkState, Workunit, WorkunitId};
use crate::queue::{NoticeOutcome, WorkQueue};

/// Persistence seam for jobs. The real document store lives behind the
/// excluded REST layer; the scheduler only needs load/save/delete.
pub trait JobStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<Job>>;
    fn save(&self, job: &Job) -> Result<()>;
    fn delete(&self, job_id: &str) -> Result<()>;
}

/// In-memory store used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn load_all(&self) -> Result<Vec<Job>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::Internal("job store lock poisoned".to_string()))?;
        Ok(jobs.values().cloned().collect())
    }

    fn save(&self, job: &Job) -> Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::Internal("job store lock poisoned".to_string()))?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete(&self, job_id: &str) -> Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::Internal("job store lock poisoned".to_string()))?;
        jobs.remove(job_id);
        Ok(())
    }
}

/// A sub-workflow expansion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub job_id: String,
    /// Resolved instance document from the workflow-description processor.
    pub document: serde_json::Value,
}

/// Secondary map of workflow instances, guarded by its own named lock.
/// Acquire the scheduler lock before this one, never the other way around.
pub struct WorkflowInstanceMap {
    inner: NamedRwLock<HashMap<String, WorkflowInstance>>,
}

impl Default for WorkflowInstanceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowInstanceMap {
    pub fn new() -> Self {
        Self {
            inner: NamedRwLock::new("workflow-instances", HashMap::new()),
        }
    }

    pub async fn add(&self, instance: WorkflowInstance) {
        let mut map = self.inner.write("WorkflowInstanceMap/add").await;
        map.insert(instance.id.clone(), instance);
    }

    pub async fn get(&self, id: &str) -> Option<WorkflowInstance> {
        let map = self.inner.read("WorkflowInstanceMap/get").await;
        map.get(id).cloned()
    }

    pub async fn remove_for_job(&self, job_id: &str) {
        let mut map = self.inner.write("WorkflowInstanceMap/remove_for_job").await;
        map.retain(|_, wi| wi.job_id != job_id);
    }
}

/// Expands jobs into tasks, feeds the work queue, and applies
/// suspend/resume/recompute/delete semantics.
pub struct JobController {
    jobs: HashMap<String, Job>,
}

impl Default for JobController {
    fn default() -> Self {
        Self::new()
    }
}

impl JobController {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    pub fn get_job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn active_jobs(&self) -> HashSet<String> {
        self.jobs_in_state(JobState::Active)
    }

    pub fn suspended_jobs(&self) -> HashSet<String> {
        self.jobs_in_state(JobState::Suspended)
    }

    fn jobs_in_state(&self, state: JobState) -> HashSet<String> {
        self.jobs
            .values()
            .filter(|j| j.state == state)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Per-state job counts for the status surface.
    pub fn counts_by_state(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for job in self.jobs.values() {
            *counts.entry(job.state.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Register a submitted job and enqueue its ready tasks.
    pub fn submit(&mut self, queue: &mut WorkQueue, job: Job) -> Result<String> {
        let job_id = job.id.clone();
        tracing::info!(job_id = %job_id, user = %job.user, tasks = job.tasks.len(), "Job submitted");
        self.jobs.insert(job_id.clone(), job);
        self.enqueue_ready_tasks(queue, &job_id)?;
        Ok(job_id)
    }

    /// Enqueue every task of the job whose dependencies are satisfied.
    /// Returns the number of tasks promoted.
    pub fn enqueue_ready_tasks(&mut self, queue: &mut WorkQueue, job_id: &str) -> Result<usize> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if job.state != JobState::Active {
            return Ok(0);
        }
        let ready: Vec<String> = job.ready_tasks().iter().map(|t| t.id.clone()).collect();
        for task_id in &ready {
            let task = job
                .task_mut(task_id)
                .ok_or_else(|| SchedulerError::TaskNotFound(task_id.clone()))?;
            let units = task.expand();
            task.state = TaskState::Queued;
            task.remaining_work = units.len() as u32;
            tracing::info!(job_id, task_id = %task_id, workunits = units.len(), "Task enqueued");
            for work in units {
                queue.enqueue(work)?;
            }
        }
        if !ready.is_empty() {
            job.touch();
        }
        Ok(ready.len())
    }

    /// Task-activation sweep across all active jobs.
    pub fn sweep_ready_tasks(&mut self, queue: &mut WorkQueue) -> usize {
        let job_ids: Vec<String> = self.active_jobs().into_iter().collect();
        let mut promoted = 0;
        for job_id in job_ids {
            // jobs cannot disappear between the collect and here
            promoted += self.enqueue_ready_tasks(queue, &job_id).unwrap_or(0);
        }
        promoted
    }

    /// Mark a task in progress once one of its units has been leased.
    pub fn mark_task_in_progress(&mut self, job_id: &str, task_id: &str) {
        if let Some(task) = self
            .jobs
            .get_mut(job_id)
            .and_then(|j| j.task_mut(task_id))
        {
            if task.state == TaskState::Queued {
                task.state = TaskState::InProgress;
            }
        }
    }

    /// Cascade the result of a processed notice: on unit completion check
    /// task completion, promote newly-eligible tasks, and close out the job;
    /// on policy or permanent failure suspend the job.
    ///
    /// Returns the units discarded by a cascading suspend so the caller can
    /// release their leases.
    pub fn on_notice_outcome(
        &mut self,
        queue: &mut WorkQueue,
        id: &WorkunitId,
        outcome: &NoticeOutcome,
    ) -> Result<Vec<Workunit>> {
        match outcome {
            NoticeOutcome::Done => {
                self.on_workunit_done(queue, id)?;
                Ok(Vec::new())
            }
            NoticeOutcome::Suspended => {
                let reason = format!("workunit {id} reached max failures");
                self.suspend_job(queue, &id.job_id, &reason)
            }
            NoticeOutcome::Permanent => {
                if let Some(task) = self
                    .jobs
                    .get_mut(&id.job_id)
                    .and_then(|j| j.task_mut(&id.task_id))
                {
                    task.state = TaskState::Fail;
                }
                let reason = format!("workunit {id} failed permanently");
                self.suspend_job(queue, &id.job_id, &reason)
            }
            NoticeOutcome::Requeued | NoticeOutcome::Dropped => Ok(Vec::new()),
        }
    }

    fn on_workunit_done(&mut self, queue: &mut WorkQueue, id: &WorkunitId) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&id.job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.job_id.clone()))?;
        let task = job
            .task_mut(&id.task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.task_id.clone()))?;
        task.remaining_work = task.remaining_work.saturating_sub(1);
        if task.remaining_work == 0 {
            task.state = TaskState::Completed;
            tracing::info!(job_id = %id.job_id, task_id = %id.task_id, "Task completed");
        }
        if job.all_tasks_completed() {
            job.state = JobState::Completed;
            job.touch();
            tracing::info!(job_id = %id.job_id, "Job completed");
            return Ok(());
        }
        self.enqueue_ready_tasks(queue, &id.job_id)?;
        Ok(())
    }

    /// Suspend a job: record the reason, discard its live workunits.
    pub fn suspend_job(
        &mut self,
        queue: &mut WorkQueue,
        job_id: &str,
        reason: &str,
    ) -> Result<Vec<Workunit>> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        job.state = JobState::Suspended;
        job.last_failure = Some(reason.to_string());
        job.touch();
        for task in &mut job.tasks {
            if matches!(task.state, TaskState::Queued | TaskState::InProgress) {
                task.state = TaskState::Suspend;
            }
        }
        tracing::warn!(job_id, reason, "Job suspended");
        Ok(queue.discard_job_units(job_id))
    }

    /// Resume a suspended job: suspended and failed tasks go back to pending
    /// and the ready ones are re-enqueued.
    pub fn resume_job(&mut self, queue: &mut WorkQueue, job_id: &str) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if job.state != JobState::Suspended {
            return Err(SchedulerError::Internal(format!(
                "job {job_id} is not suspended (state {})",
                job.state
            )));
        }
        job.state = JobState::Active;
        job.last_failure = None;
        for task in &mut job.tasks {
            if matches!(task.state, TaskState::Suspend | TaskState::Fail) {
                task.state = TaskState::Pending;
                task.remaining_work = 0;
            }
        }
        job.touch();
        tracing::info!(job_id, "Job resumed");
        self.enqueue_ready_tasks(queue, job_id)?;
        Ok(())
    }

    /// Resume every suspended job owned by `user`. Returns the count resumed.
    pub fn resume_jobs_by_user(&mut self, queue: &mut WorkQueue, user: &str) -> usize {
        let ids: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Suspended && j.user == user)
            .map(|j| j.id.clone())
            .collect();
        let mut resumed = 0;
        for id in ids {
            if self.resume_job(queue, &id).is_ok() {
                resumed += 1;
            }
        }
        resumed
    }

    /// Re-expand a job from scratch: discard live units, reset every task,
    /// and enqueue the initial wave again.
    pub fn resubmit_job(&mut self, queue: &mut WorkQueue, job_id: &str) -> Result<Vec<Workunit>> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        let discarded = queue.discard_job_units(job_id);
        for task in &mut job.tasks {
            task.state = TaskState::Init;
            task.remaining_work = 0;
        }
        job.state = JobState::Active;
        job.last_failure = None;
        job.touch();
        tracing::info!(job_id, "Job resubmitted");
        self.enqueue_ready_tasks(queue, job_id)?;
        Ok(discarded)
    }

    /// Invalidate a task and everything downstream of it, then re-enqueue.
    pub fn recompute_job(
        &mut self,
        queue: &mut WorkQueue,
        job_id: &str,
        from_task: &str,
    ) -> Result<Vec<Workunit>> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if job.task(from_task).is_none() {
            return Err(SchedulerError::TaskNotFound(from_task.to_string()));
        }
        let affected = job.downstream_of(from_task);
        let mut discarded = Vec::new();
        for task_id in &affected {
            discarded.extend(queue.discard_task_units(job_id, task_id));
            if let Some(task) = job.task_mut(task_id) {
                task.state = TaskState::Init;
                task.remaining_work = 0;
            }
        }
        job.state = JobState::Active;
        job.touch();
        tracing::info!(job_id, from_task, invalidated = affected.len(), "Job recompute");
        self.enqueue_ready_tasks(queue, job_id)?;
        Ok(discarded)
    }

    /// Delete a job owned by `user`, discarding its live workunits.
    pub fn delete_job(
        &mut self,
        queue: &mut WorkQueue,
        job_id: &str,
        user: &str,
    ) -> Result<Vec<Workunit>> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if job.user != user {
            return Err(SchedulerError::PermissionDenied(format!(
                "job {job_id} is not owned by {user}"
            )));
        }
        let discarded = queue.discard_job_units(job_id);
        self.jobs.remove(job_id);
        tracing::info!(job_id, user, "Job deleted");
        Ok(discarded)
    }

    /// Bulk delete of `user`'s jobs in the given state. Returns job ids
    /// removed plus their discarded units.
    pub fn delete_jobs_in_state(
        &mut self,
        queue: &mut WorkQueue,
        user: &str,
        state: JobState,
    ) -> (Vec<String>, Vec<Workunit>) {
        let ids: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.user == user && j.state == state)
            .map(|j| j.id.clone())
            .collect();
        let mut discarded = Vec::new();
        for id in &ids {
            if let Ok(mut units) = self.delete_job(queue, id, user) {
                discarded.append(&mut units);
            }
        }
        (ids, discarded)
    }

    /// Recovery pass run at process start: re-register persisted jobs and
    /// re-queue the workunits of tasks that were in flight when the previous
    /// process instance died. Nothing stays stranded in checkout or
    /// reserved, and completed tasks are not re-run.
    pub fn recover(&mut self, queue: &mut WorkQueue, jobs: Vec<Job>) -> usize {
        let mut requeued = 0;
        for mut job in jobs {
            if job.state == JobState::Active {
                for task in &mut job.tasks {
                    if matches!(task.state, TaskState::Queued | TaskState::InProgress) {
                        let units = task.expand();
                        task.state = TaskState::Queued;
                        task.remaining_work = units.len() as u32;
                        for work in units {
                            // skip units already re-queued in this pass
                            if queue.contains(&work.id) {
                                continue;
                            }
                            requeued += 1;
                            // enqueue only fails on the suspend path
                            let _ = queue.enqueue(work);
                        }
                    }
                }
            }
            tracing::info!(job_id = %job.id, state = %job.state, "Job recovered");
            self.jobs.insert(job.id.clone(), job);
        }
        requeued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Task};

    fn two_step_job(user: &str) -> Job {
        let t1 = Task::new("", "1", Command::shell("a"));
        let t2 = Task::new("", "2", Command::shell("b")).with_dependency("1");
        Job::new(user, vec![t1, t2])
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(3, 42)
    }

    #[test]
    fn submit_enqueues_only_ready_tasks() {
        let mut ctl = JobController::new();
        let mut q = queue();
        let job_id = ctl.submit(&mut q, two_step_job("alice")).unwrap();

        assert_eq!(q.queued_len(), 1);
        let job = ctl.get_job(&job_id).unwrap();
        assert_eq!(job.task("1").unwrap().state, TaskState::Queued);
        assert_eq!(job.task("2").unwrap().state, TaskState::Init);
    }

    #[test]
    fn done_cascade_promotes_dependents_and_completes_job() {
        let mut ctl = JobController::new();
        let mut q = queue();
        let job_id = ctl.submit(&mut q, two_step_job("alice")).unwrap();

        let id1 = WorkunitId::new(job_id.clone(), "1", 0);
        q.remove(&id1);
        ctl.on_notice_outcome(&mut q, &id1, &NoticeOutcome::Done)
            .unwrap();
        assert_eq!(
            ctl.get_job(&job_id).unwrap().task("1").unwrap().state,
            TaskState::Completed
        );
        // task 2 became eligible and was enqueued
        assert_eq!(q.queued_len(), 1);

        let id2 = WorkunitId::new(job_id.clone(), "2", 0);
        q.remove(&id2);
        ctl.on_notice_outcome(&mut q, &id2, &NoticeOutcome::Done)
            .unwrap();
        assert_eq!(ctl.get_job(&job_id).unwrap().state, JobState::Completed);
    }

    #[test]
    fn suspend_discards_live_units_and_records_reason() {
        let mut ctl = JobController::new();
        let mut q = queue();
        let job_id = ctl.submit(&mut q, two_step_job("alice")).unwrap();

        let discarded = ctl.suspend_job(&mut q, &job_id, "oom").unwrap();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].state, WorkState::Discarded);
        assert_eq!(q.len(), 0);

        let job = ctl.get_job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Suspended);
        assert_eq!(job.last_failure.as_deref(), Some("oom"));
        assert!(ctl.suspended_jobs().contains(&job_id));
    }

    #[test]
    fn resume_requeues_suspended_tasks() {
        let mut ctl = JobController::new();
        let mut q = queue();
        let job_id = ctl.submit(&mut q, two_step_job("alice")).unwrap();
        ctl.suspend_job(&mut q, &job_id, "oom").unwrap();

        ctl.resume_job(&mut q, &job_id).unwrap();
        let job = ctl.get_job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.last_failure, None);
        assert_eq!(q.queued_len(), 1);
    }

    #[test]
    fn resume_all_by_user_scopes_correctly() {
        let mut ctl = JobController::new();
        let mut q = queue();
        let a = ctl.submit(&mut q, two_step_job("alice")).unwrap();
        let b = ctl.submit(&mut q, two_step_job("bob")).unwrap();
        ctl.suspend_job(&mut q, &a, "x").unwrap();
        ctl.suspend_job(&mut q, &b, "x").unwrap();

        assert_eq!(ctl.resume_jobs_by_user(&mut q, "alice"), 1);
        assert_eq!(ctl.get_job(&a).unwrap().state, JobState::Active);
        assert_eq!(ctl.get_job(&b).unwrap().state, JobState::Suspended);
    }

    #[test]
    fn recompute_invalidates_downstream() {
        let mut ctl = JobController::new();
        let mut q = queue();
        let t1 = Task::new("", "1", Command::shell("a"));
        let t2 = Task::new("", "2", Command::shell("b")).with_dependency("1");
        let t3 = Task::new("", "3", Command::shell("c")).with_dependency("2");
        let job_id = ctl.submit(&mut q, Job::new("alice", vec![t1, t2, t3])).unwrap();

        // finish task 1 and 2
        for tid in ["1", "2"] {
            let id = WorkunitId::new(job_id.clone(), tid, 0);
            q.remove(&id);
            ctl.on_notice_outcome(&mut q, &id, &NoticeOutcome::Done)
                .unwrap();
        }

        ctl.recompute_job(&mut q, &job_id, "2").unwrap();
        let job = ctl.get_job(&job_id).unwrap();
        assert_eq!(job.task("1").unwrap().state, TaskState::Completed);
        // task 2 re-enqueued, task 3 reset and waiting on it
        assert_eq!(job.task("2").unwrap().state, TaskState::Queued);
        assert_eq!(job.task("3").unwrap().state, TaskState::Init);
        assert_eq!(q.queued_len(), 1);
    }

    #[test]
    fn delete_checks_ownership() {
        let mut ctl = JobController::new();
        let mut q = queue();
        let job_id = ctl.submit(&mut q, two_step_job("alice")).unwrap();

        let err = ctl.delete_job(&mut q, &job_id, "mallory").unwrap_err();
        assert!(matches!(err, SchedulerError::PermissionDenied(_)));

        ctl.delete_job(&mut q, &job_id, "alice").unwrap();
        assert!(!ctl.is_registered(&job_id));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn recover_requeues_in_flight_tasks() {
        // Build a job as a prior process would have persisted it: task 1
        // completed, task 2 mid-flight.
        let mut job = two_step_job("alice");
        job.task_mut("1").unwrap().state = TaskState::Completed;
        job.task_mut("2").unwrap().state = TaskState::InProgress;
        let job_id = job.id.clone();

        let mut ctl = JobController::new();
        let mut q = queue();
        let requeued = ctl.recover(&mut q, vec![job]);
        assert_eq!(requeued, 1);

        let id2 = WorkunitId::new(job_id.clone(), "2", 0);
        assert_eq!(q.get(&id2).unwrap().state, WorkState::Queued);
        // the completed task is not re-run
        assert!(!q.contains(&WorkunitId::new(job_id, "1", 0)));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryJobStore::new();
        let job = two_step_job("alice");
        let id = job.id.clone();
        store.save(&job).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, id);
        store.delete(&id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn workflow_instance_map() {
        let map = WorkflowInstanceMap::new();
        map.add(WorkflowInstance {
            id: "wi-1".to_string(),
            job_id: "job1".to_string(),
            document: serde_json::json!({"steps": 2}),
        })
        .await;
        assert!(map.get("wi-1").await.is_some());
        map.remove_for_job("job1").await;
        assert!(map.get("wi-1").await.is_none());
    }
}
