use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::model::{WorkState, Workunit, WorkunitId};

/// Worker-submitted completion report for a workunit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub id: WorkunitId,
    pub from_client: String,
    pub status: NoticeStatus,
    pub exit_status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeStatus {
    Done,
    Fail,
}

/// What applying a notice did to the unit; the caller cascades from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// Unit finished; removed from the queue.
    Done,
    /// Retryable failure, re-queued.
    Requeued,
    /// Failure count hit the maximum; unit held in suspend.
    Suspended,
    /// Non-retryable exit code; removed, never re-queued.
    Permanent,
    /// Stale or mismatched report; logged, no state change.
    Dropped,
}

/// Holds workunits by state and serves lease (checkout) requests.
///
/// The queue exclusively owns workunit state transitions. Callers hold the
/// process write lock across checkout's selection+transition phase, which is
/// what guarantees at most one active lease per workunit.
#[derive(Debug)]
pub struct WorkQueue {
    units: HashMap<WorkunitId, Workunit>,
    /// FIFO of queued unit ids. Entries may go stale when a unit is
    /// discarded concurrently; checkout skips them lazily.
    fifo: VecDeque<WorkunitId>,
    max_failures: u32,
    permanent_exit_code: i32,
}

impl WorkQueue {
    pub fn new(max_failures: u32, permanent_exit_code: i32) -> Self {
        Self {
            units: HashMap::new(),
            fifo: VecDeque::new(),
            max_failures,
            permanent_exit_code,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.units
            .values()
            .filter(|w| w.state == WorkState::Queued)
            .count()
    }

    pub fn get(&self, id: &WorkunitId) -> Option<&Workunit> {
        self.units.get(id)
    }

    pub fn contains(&self, id: &WorkunitId) -> bool {
        self.units.contains_key(id)
    }

    /// Add a workunit in queued state.
    pub fn enqueue(&mut self, mut work: Workunit) -> Result<()> {
        work.set_state(WorkState::Queued, None)?;
        tracing::debug!(workunit = %work.id, "Workunit enqueued");
        self.fifo.push_back(work.id.clone());
        self.units.insert(work.id.clone(), work);
        Ok(())
    }

    /// Atomically lease up to `min(slots, max_batch)` queued workunits to
    /// `client_id`: each selected unit passes through reserved into checkout
    /// with the lease holder and checkout time recorded.
    ///
    /// Selection is FIFO; ids whose unit was discarded or re-leased since
    /// being queued are skipped and dropped from the FIFO.
    pub fn checkout(
        &mut self,
        client_id: &str,
        server_token: Uuid,
        slots: usize,
        max_batch: usize,
    ) -> Vec<Workunit> {
        let limit = slots.min(max_batch);
        let mut leased = Vec::new();
        while leased.len() < limit {
            let Some(id) = self.fifo.pop_front() else {
                break;
            };
            let Some(work) = self.units.get_mut(&id) else {
                continue; // stale entry
            };
            if work.state != WorkState::Queued {
                continue;
            }
            let now = Utc::now();
            // The reservation is confirmed immediately here; units stuck in
            // reserved (e.g. a lost response) are swept back to queued.
            work.state = WorkState::Reserved;
            work.reserved_time = Some(now);
            work.state = WorkState::Checkout;
            work.client = Some(client_id.to_string());
            work.checkout_time = Some(now);
            work.server_token = Some(server_token);
            tracing::info!(workunit = %work.id, client_id, "Workunit checked out");
            leased.push(work.clone());
        }
        leased
    }

    /// Return a unit to the queued state, clearing its lease. Used for lease
    /// release, reservation expiry and resume.
    pub fn requeue(&mut self, id: &WorkunitId) -> Result<()> {
        let work = self
            .units
            .get_mut(id)
            .ok_or_else(|| SchedulerError::WorkunitNotFound(id.to_string()))?;
        if work.state.is_terminal() {
            return Err(SchedulerError::invalid_transition(
                id,
                work.state,
                WorkState::Queued,
            ));
        }
        work.set_state(WorkState::Queued, None)?;
        work.reserved_time = None;
        work.checkout_time = None;
        work.data_token = None;
        self.fifo.push_back(id.clone());
        tracing::debug!(workunit = %id, "Workunit re-queued");
        Ok(())
    }

    /// Resume a unit held in suspend, resetting its failure counter.
    pub fn resume(&mut self, id: &WorkunitId) -> Result<()> {
        let work = self
            .units
            .get_mut(id)
            .ok_or_else(|| SchedulerError::WorkunitNotFound(id.to_string()))?;
        if work.state != WorkState::Suspend {
            return Err(SchedulerError::invalid_transition(
                id,
                work.state,
                WorkState::Queued,
            ));
        }
        work.failed = 0;
        work.set_state(WorkState::Queued, None)?;
        self.fifo.push_back(id.clone());
        Ok(())
    }

    /// Apply a worker's completion notice to its workunit.
    ///
    /// Reports for unknown units, units not in checkout, from a client that
    /// does not hold the lease, or against a lease stamped by a different
    /// process instance are stale (late result for a discarded, re-leased or
    /// pre-restart unit) and dropped without a state change.
    pub fn apply_notice(&mut self, notice: &Notice, server_token: Uuid) -> NoticeOutcome {
        let Some(work) = self.units.get_mut(&notice.id) else {
            tracing::warn!(workunit = %notice.id, client = %notice.from_client, "Dropping notice for unknown workunit");
            return NoticeOutcome::Dropped;
        };
        if work.state != WorkState::Checkout
            || work.client.as_deref() != Some(&notice.from_client)
            || work.server_token != Some(server_token)
        {
            tracing::warn!(
                workunit = %notice.id,
                client = %notice.from_client,
                state = %work.state,
                "Dropping stale notice"
            );
            return NoticeOutcome::Dropped;
        }

        work.exit_status = Some(notice.exit_status);
        if let Some(note) = &notice.notes {
            work.add_note(note.clone());
        }

        match notice.status {
            NoticeStatus::Done => {
                // set_state cannot fail outside the suspend path
                let _ = work.set_state(WorkState::Done, None);
                tracing::info!(workunit = %notice.id, "Workunit done");
                self.remove(&notice.id);
                NoticeOutcome::Done
            }
            NoticeStatus::Fail if notice.exit_status == self.permanent_exit_code => {
                let _ = work.set_state(WorkState::FailedPermanent, None);
                tracing::warn!(
                    workunit = %notice.id,
                    exit_status = notice.exit_status,
                    "Workunit failed permanently"
                );
                self.remove(&notice.id);
                NoticeOutcome::Permanent
            }
            NoticeStatus::Fail => {
                work.failed += 1;
                if work.failed >= self.max_failures {
                    let reason = format!("failed {} times, max reached", work.failed);
                    // reason is never empty, so this cannot fail
                    let _ = work.set_state(WorkState::Suspend, Some(&reason));
                    tracing::warn!(workunit = %notice.id, failed = work.failed, "Workunit suspended");
                    NoticeOutcome::Suspended
                } else {
                    let _ = work.set_state(WorkState::Queued, None);
                    work.checkout_time = None;
                    self.fifo.push_back(notice.id.clone());
                    tracing::info!(
                        workunit = %notice.id,
                        failed = work.failed,
                        "Workunit failed, re-queued"
                    );
                    NoticeOutcome::Requeued
                }
            }
        }
    }

    /// Attach a freshly minted data-access token to a unit.
    pub fn set_data_token(&mut self, id: &WorkunitId, token: String) -> Result<()> {
        let work = self
            .units
            .get_mut(id)
            .ok_or_else(|| SchedulerError::WorkunitNotFound(id.to_string()))?;
        work.data_token = Some(token);
        Ok(())
    }

    /// Remove a unit from the queue entirely.
    pub fn remove(&mut self, id: &WorkunitId) -> Option<Workunit> {
        self.units.remove(id)
    }

    /// Discard every non-terminal unit of the given task, removing them from
    /// the queue. Returns the removed units so the caller can release any
    /// leases recorded in the client registry.
    pub fn discard_task_units(&mut self, job_id: &str, task_id: &str) -> Vec<Workunit> {
        let ids: Vec<WorkunitId> = self
            .units
            .values()
            .filter(|w| w.id.job_id == job_id && w.id.task_id == task_id)
            .map(|w| w.id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(mut work) = self.units.remove(&id) {
                work.state = WorkState::Discarded;
                removed.push(work);
            }
        }
        removed
    }

    /// Discard every unit of the given job. See `discard_task_units`.
    pub fn discard_job_units(&mut self, job_id: &str) -> Vec<Workunit> {
        let ids: Vec<WorkunitId> = self
            .units
            .values()
            .filter(|w| w.id.job_id == job_id)
            .map(|w| w.id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(mut work) = self.units.remove(&id) {
                work.state = WorkState::Discarded;
                removed.push(work);
            }
        }
        removed
    }

    /// Re-queue reservations that were never confirmed within the window.
    pub fn sweep_reservations(
        &mut self,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
    ) -> Vec<WorkunitId> {
        let expired: Vec<WorkunitId> = self
            .units
            .values()
            .filter(|w| w.state == WorkState::Reserved)
            .filter(|w| match w.reserved_time {
                Some(t) => (now - t).to_std().unwrap_or_default() > timeout,
                None => true,
            })
            .map(|w| w.id.clone())
            .collect();
        for id in &expired {
            tracing::warn!(workunit = %id, "Reservation expired, re-queueing");
            // cannot fail: reserved units are non-terminal and in the map
            let _ = self.requeue(id);
        }
        expired
    }

    /// List units, optionally filtered by state and/or lease holder.
    pub fn list(&self, state: Option<WorkState>, client: Option<&str>) -> Vec<&Workunit> {
        let mut units: Vec<&Workunit> = self
            .units
            .values()
            .filter(|w| state.map_or(true, |s| w.state == s))
            .filter(|w| client.map_or(true, |c| w.client.as_deref() == Some(c)))
            .collect();
        units.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
        units
    }

    /// Per-state unit counts for the status surface.
    pub fn counts_by_state(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for work in self.units.values() {
            *counts.entry(work.state.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Task};

    fn queue() -> WorkQueue {
        WorkQueue::new(3, 42)
    }

    fn unit(job: &str, task: &str, rank: u32) -> Workunit {
        let t = Task::new(job, task, Command::shell("true"));
        Workunit::new(&t, rank)
    }

    fn checked_out(
        q: &mut WorkQueue,
        job: &str,
        task: &str,
        client: &str,
        token: Uuid,
    ) -> WorkunitId {
        q.enqueue(unit(job, task, 0)).unwrap();
        let leased = q.checkout(client, token, 1, 10);
        leased[0].id.clone()
    }

    #[test]
    fn checkout_is_fifo_and_bounded() {
        let mut q = queue();
        for i in 0..5 {
            q.enqueue(unit("job1", &i.to_string(), 0)).unwrap();
        }
        let leased = q.checkout("c1", Uuid::new_v4(), 3, 10);
        assert_eq!(leased.len(), 3);
        assert_eq!(leased[0].id.task_id, "0");
        assert_eq!(leased[2].id.task_id, "2");
        for work in &leased {
            assert_eq!(work.state, WorkState::Checkout);
            assert_eq!(work.client.as_deref(), Some("c1"));
            assert!(work.checkout_time.is_some());
        }
        assert_eq!(q.queued_len(), 2);
    }

    #[test]
    fn checkout_respects_max_batch() {
        let mut q = queue();
        for i in 0..5 {
            q.enqueue(unit("job1", &i.to_string(), 0)).unwrap();
        }
        assert_eq!(q.checkout("c1", Uuid::new_v4(), 100, 2).len(), 2);
    }

    #[test]
    fn checkout_skips_discarded_units() {
        let mut q = queue();
        q.enqueue(unit("job1", "1", 0)).unwrap();
        q.enqueue(unit("job1", "2", 0)).unwrap();
        q.discard_task_units("job1", "1");
        let leased = q.checkout("c1", Uuid::new_v4(), 10, 10);
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id.task_id, "2");
    }

    #[test]
    fn requeue_clears_lease() {
        let mut q = queue();
        let id = checked_out(&mut q, "job1", "1", "c1", Uuid::new_v4());
        q.requeue(&id).unwrap();
        let work = q.get(&id).unwrap();
        assert_eq!(work.state, WorkState::Queued);
        assert_eq!(work.client, None);
        assert_eq!(work.checkout_time, None);
        // and it can be leased again
        assert_eq!(q.checkout("c2", Uuid::new_v4(), 1, 1).len(), 1);
    }

    #[test]
    fn notice_done_removes_unit() {
        let mut q = queue();
        let token = Uuid::new_v4();
        let id = checked_out(&mut q, "job1", "1", "c1", token);
        let outcome = q.apply_notice(
            &Notice {
                id: id.clone(),
                from_client: "c1".to_string(),
                status: NoticeStatus::Done,
                exit_status: 0,
                compute_time: None,
                notes: None,
            },
            token,
        );
        assert_eq!(outcome, NoticeOutcome::Done);
        assert!(!q.contains(&id));
    }

    #[test]
    fn notice_fail_requeues_until_max() {
        let mut q = queue();
        let token = Uuid::new_v4();
        let id = checked_out(&mut q, "job1", "1", "c1", token);
        let fail = |client: &str, id: &WorkunitId| Notice {
            id: id.clone(),
            from_client: client.to_string(),
            status: NoticeStatus::Fail,
            exit_status: 1,
            compute_time: None,
            notes: Some("segfault".to_string()),
        };

        assert_eq!(
            q.apply_notice(&fail("c1", &id), token),
            NoticeOutcome::Requeued
        );
        q.checkout("c1", token, 1, 1);
        assert_eq!(
            q.apply_notice(&fail("c1", &id), token),
            NoticeOutcome::Requeued
        );
        q.checkout("c1", token, 1, 1);
        assert_eq!(
            q.apply_notice(&fail("c1", &id), token),
            NoticeOutcome::Suspended
        );

        let work = q.get(&id).unwrap();
        assert_eq!(work.state, WorkState::Suspend);
        assert_eq!(work.failed, 3);
        // suspended units stay queryable with their failure notes
        assert!(work.notes_joined().contains("segfault"));
    }

    #[test]
    fn notice_permanent_exit_code() {
        let mut q = queue();
        let token = Uuid::new_v4();
        let id = checked_out(&mut q, "job1", "1", "c1", token);
        let outcome = q.apply_notice(
            &Notice {
                id: id.clone(),
                from_client: "c1".to_string(),
                status: NoticeStatus::Fail,
                exit_status: 42,
                compute_time: None,
                notes: None,
            },
            token,
        );
        assert_eq!(outcome, NoticeOutcome::Permanent);
        assert!(!q.contains(&id));
    }

    #[test]
    fn stale_notices_are_dropped() {
        let mut q = queue();
        let token = Uuid::new_v4();
        let id = checked_out(&mut q, "job1", "1", "c1", token);
        let done = |client: &str, id: &WorkunitId| Notice {
            id: id.clone(),
            from_client: client.to_string(),
            status: NoticeStatus::Done,
            exit_status: 0,
            compute_time: None,
            notes: None,
        };

        // wrong client
        let outcome = q.apply_notice(&done("c2", &id), token);
        assert_eq!(outcome, NoticeOutcome::Dropped);
        assert_eq!(q.get(&id).unwrap().state, WorkState::Checkout);

        // lease stamped by a different process instance
        let outcome = q.apply_notice(&done("c1", &id), Uuid::new_v4());
        assert_eq!(outcome, NoticeOutcome::Dropped);
        assert_eq!(q.get(&id).unwrap().state, WorkState::Checkout);
        assert_eq!(q.get(&id).unwrap().client.as_deref(), Some("c1"));

        // unknown unit
        let outcome = q.apply_notice(&done("c1", &WorkunitId::new("nope", "1", 0)), token);
        assert_eq!(outcome, NoticeOutcome::Dropped);

        // the real holder reporting through the issuing instance still lands
        let outcome = q.apply_notice(&done("c1", &id), token);
        assert_eq!(outcome, NoticeOutcome::Done);
    }

    #[test]
    fn resume_resets_failures() {
        let mut q = queue();
        let token = Uuid::new_v4();
        let id = checked_out(&mut q, "job1", "1", "c1", token);
        for _ in 0..3 {
            q.apply_notice(
                &Notice {
                    id: id.clone(),
                    from_client: "c1".to_string(),
                    status: NoticeStatus::Fail,
                    exit_status: 1,
                    compute_time: None,
                    notes: Some("oom".to_string()),
                },
                token,
            );
            q.checkout("c1", token, 1, 1);
        }
        assert_eq!(q.get(&id).unwrap().state, WorkState::Suspend);

        q.resume(&id).unwrap();
        let work = q.get(&id).unwrap();
        assert_eq!(work.state, WorkState::Queued);
        assert_eq!(work.failed, 0);
    }

    #[test]
    fn counts_by_state() {
        let mut q = queue();
        q.enqueue(unit("job1", "1", 0)).unwrap();
        q.enqueue(unit("job1", "2", 0)).unwrap();
        q.checkout("c1", Uuid::new_v4(), 1, 1);
        let counts = q.counts_by_state();
        assert_eq!(counts.get("queued"), Some(&1));
        assert_eq!(counts.get("checkout"), Some(&1));
    }
}
