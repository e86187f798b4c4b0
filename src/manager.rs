use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::controller::{JobController, JobStore, WorkflowInstanceMap};
use crate::error::{Result, SchedulerError};
use crate::lock::NamedRwLock;
use crate::model::{Job, JobState, WorkState, Workunit, WorkunitId};
use crate::queue::{Notice, NoticeOutcome, WorkQueue};
use crate::registry::{Client, ClientRegistry, HeartbeatReply};

const NOTICE_CHANNEL_CAPACITY: usize = 1024;

/// Everything the scheduler mutates, guarded by one named lock so that every
/// request sees a consistent view of clients, units and jobs.
pub struct SchedulerState {
    pub registry: ClientRegistry,
    pub queue: WorkQueue,
    pub controller: JobController,
    pub queue_suspended: bool,
}

/// Facade over the whole scheduler: client fleet, work queue and job
/// controller behind a single lock, plus the background maintenance loops.
///
/// Notices are not applied inline; they go through an mpsc channel and a
/// single consumer task, so results from hundreds of workers serialize
/// without each worker request contending on the write lock.
pub struct ResourceManager {
    config: SchedulerConfig,
    /// Identity of this process instance. Stamped onto every lease so that
    /// leases handed out by a previous instance can be recognized and
    /// dropped after a restart.
    server_token: Uuid,
    state: NamedRwLock<SchedulerState>,
    store: Arc<dyn JobStore>,
    pub workflow_instances: WorkflowInstanceMap,
    notice_tx: mpsc::Sender<Notice>,
    notice_rx: Mutex<Option<mpsc::Receiver<Notice>>>,
}

impl ResourceManager {
    pub fn new(config: SchedulerConfig, store: Arc<dyn JobStore>) -> Self {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
        let state = SchedulerState {
            registry: ClientRegistry::new(
                config.client_groups.clone(),
                config.client_heartbeat_timeout,
            ),
            queue: WorkQueue::new(config.max_work_failures, config.permanent_exit_code),
            controller: JobController::new(),
            queue_suspended: false,
        };
        Self {
            config,
            server_token: Uuid::new_v4(),
            state: NamedRwLock::new("scheduler", state),
            store,
            workflow_instances: WorkflowInstanceMap::new(),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
        }
    }

    pub fn server_token(&self) -> Uuid {
        self.server_token
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Recovery pass run once at startup, before serving requests: reload
    /// persisted jobs and re-queue the units of tasks that were in flight
    /// when the previous instance died.
    pub async fn recover(&self) -> Result<usize> {
        let jobs = self.store.load_all()?;
        let mut state = self.state.write("ResourceManager/recover").await;
        let state = &mut *state;
        let requeued = state.controller.recover(&mut state.queue, jobs);
        tracing::info!(requeued, "Recovery complete");
        Ok(requeued)
    }

    // client fleet

    pub async fn register_client(
        &self,
        group_token: &str,
        user: &str,
        name: &str,
    ) -> Result<Client> {
        let mut state = self.state.write("ResourceManager/register_client").await;
        state.registry.register(group_token, user, name)
    }

    pub async fn client_heartbeat(
        &self,
        client_id: &str,
        group_token: &str,
        sub_clients: Option<u32>,
    ) -> Result<HeartbeatReply> {
        let mut state = self.state.write("ResourceManager/client_heartbeat").await;
        state.registry.heartbeat(client_id, group_token, sub_clients)
    }

    pub async fn get_client(&self, client_id: &str) -> Option<Client> {
        let state = self.state.read("ResourceManager/get_client").await;
        state.registry.get(client_id).cloned()
    }

    pub async fn list_clients(&self) -> Vec<Client> {
        let state = self.state.read("ResourceManager/list_clients").await;
        state.registry.all().into_iter().cloned().collect()
    }

    pub async fn clients_by_user(&self, user: &str) -> Vec<Client> {
        let state = self.state.read("ResourceManager/clients_by_user").await;
        state.registry.by_user(user).into_iter().cloned().collect()
    }

    pub async fn update_sub_clients(&self, client_id: &str, count: u32) -> Result<()> {
        let mut state = self.state.write("ResourceManager/update_sub_clients").await;
        state.registry.update_sub_clients(client_id, count)
    }

    /// Suspend one client; its leased units go back to the queue.
    pub async fn suspend_client(&self, client_id: &str, reason: &str) -> Result<usize> {
        let mut state = self.state.write("ResourceManager/suspend_client").await;
        let state = &mut *state;
        let released = state.registry.suspend(client_id, reason)?;
        Ok(requeue_released(&mut state.queue, released))
    }

    pub async fn suspend_all_clients(&self, reason: &str) -> usize {
        let mut state = self.state.write("ResourceManager/suspend_all_clients").await;
        let state = &mut *state;
        let (suspended, released) = state.registry.suspend_all(reason);
        requeue_released(&mut state.queue, released);
        suspended
    }

    pub async fn suspend_clients_by_user(&self, user: &str, reason: &str) -> usize {
        let mut state = self
            .state
            .write("ResourceManager/suspend_clients_by_user")
            .await;
        let state = &mut *state;
        let (suspended, released) = state.registry.suspend_by_user(user, reason);
        requeue_released(&mut state.queue, released);
        suspended
    }

    pub async fn resume_client(&self, client_id: &str) -> Result<()> {
        let mut state = self.state.write("ResourceManager/resume_client").await;
        state.registry.resume(client_id)
    }

    pub async fn resume_all_clients(&self) -> usize {
        let mut state = self.state.write("ResourceManager/resume_all_clients").await;
        state.registry.resume_all()
    }

    pub async fn resume_clients_by_user(&self, user: &str) -> usize {
        let mut state = self
            .state
            .write("ResourceManager/resume_clients_by_user")
            .await;
        state.registry.resume_by_user(user)
    }

    pub async fn deregister_client(&self, client_id: &str) -> Result<()> {
        let mut state = self.state.write("ResourceManager/deregister_client").await;
        let state = &mut *state;
        let released = state.registry.deregister(client_id)?;
        requeue_released(&mut state.queue, released);
        Ok(())
    }

    // work distribution

    /// Lease up to `slots` workunits to a client. The whole operation is one
    /// critical section: lease assignment, task promotion and the client's
    /// lease record cannot be observed half-done.
    pub async fn checkout_workunits(
        &self,
        client_id: &str,
        group_token: &str,
        slots: usize,
    ) -> Result<Vec<Workunit>> {
        let mut state = self.state.write("ResourceManager/checkout_workunits").await;
        let state = &mut *state;
        if state.queue_suspended {
            return Err(SchedulerError::QueueSuspended);
        }
        let client = state
            .registry
            .get(client_id)
            .ok_or_else(|| SchedulerError::ClientNotFound(client_id.to_string()))?;
        if client.group != group_token {
            return Err(SchedulerError::UnknownClientGroup(group_token.to_string()));
        }
        if client.suspended {
            return Err(SchedulerError::ClientSuspended(client_id.to_string()));
        }

        let leased = state.queue.checkout(
            client_id,
            self.server_token,
            slots,
            self.config.checkout_max_batch,
        );
        for work in &leased {
            state
                .controller
                .mark_task_in_progress(&work.id.job_id, &work.id.task_id);
            state.registry.add_work(client_id, work.id.clone())?;
        }
        Ok(leased)
    }

    /// Hand a work result to the notice consumer. Does not wait for it to be
    /// applied.
    pub async fn submit_notice(&self, notice: Notice) -> Result<()> {
        self.notice_tx
            .send(notice)
            .await
            .map_err(|_| SchedulerError::Internal("notice channel closed".to_string()))
    }

    /// Apply one notice: transition the unit, drop the client's lease record,
    /// cascade task and job effects, persist the job. Late notices from a
    /// prior lease holder or a previous process instance fall out as
    /// `Dropped` inside the queue.
    pub async fn process_notice(&self, notice: &Notice) -> Result<NoticeOutcome> {
        let mut state = self.state.write("ResourceManager/process_notice").await;
        let state = &mut *state;
        let outcome = state.queue.apply_notice(notice, self.server_token);
        if outcome != NoticeOutcome::Dropped {
            state.registry.remove_work(&notice.from_client, &notice.id);
        }
        let discarded = state
            .controller
            .on_notice_outcome(&mut state.queue, &notice.id, &outcome)?;
        for work in &discarded {
            if let Some(client) = &work.client {
                state.registry.remove_work(client, &work.id);
            }
        }
        if let Some(job) = state.controller.get_job(&notice.id.job_id) {
            self.store.save(job)?;
        }
        Ok(outcome)
    }

    // job lifecycle

    pub async fn submit_job(&self, job: Job) -> Result<String> {
        let mut state = self.state.write("ResourceManager/submit_job").await;
        let state = &mut *state;
        let job_id = state.controller.submit(&mut state.queue, job)?;
        self.persist(&state.controller, &job_id)?;
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        let state = self.state.read("ResourceManager/get_job").await;
        state.controller.get_job(job_id).cloned()
    }

    pub async fn suspend_job(&self, job_id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.write("ResourceManager/suspend_job").await;
        let state = &mut *state;
        let discarded = state
            .controller
            .suspend_job(&mut state.queue, job_id, reason)?;
        release_discarded(&mut state.registry, &discarded);
        self.persist(&state.controller, job_id)
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.write("ResourceManager/resume_job").await;
        let state = &mut *state;
        state.controller.resume_job(&mut state.queue, job_id)?;
        self.persist(&state.controller, job_id)
    }

    pub async fn resume_jobs_by_user(&self, user: &str) -> Result<usize> {
        let mut state = self.state.write("ResourceManager/resume_jobs_by_user").await;
        let state = &mut *state;
        let resumed = state.controller.resume_jobs_by_user(&mut state.queue, user);
        for job_id in state.controller.active_jobs() {
            self.persist(&state.controller, &job_id)?;
        }
        Ok(resumed)
    }

    pub async fn resubmit_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.write("ResourceManager/resubmit_job").await;
        let state = &mut *state;
        let discarded = state.controller.resubmit_job(&mut state.queue, job_id)?;
        release_discarded(&mut state.registry, &discarded);
        self.persist(&state.controller, job_id)
    }

    /// Invalidate `from_task` and everything downstream, then re-run.
    pub async fn recompute_job(&self, job_id: &str, from_task: &str) -> Result<()> {
        let mut state = self.state.write("ResourceManager/recompute_job").await;
        let state = &mut *state;
        let discarded = state
            .controller
            .recompute_job(&mut state.queue, job_id, from_task)?;
        release_discarded(&mut state.registry, &discarded);
        self.persist(&state.controller, job_id)
    }

    pub async fn delete_job(&self, job_id: &str, user: &str) -> Result<()> {
        {
            let mut state = self.state.write("ResourceManager/delete_job").await;
            let state = &mut *state;
            let discarded = state.controller.delete_job(&mut state.queue, job_id, user)?;
            release_discarded(&mut state.registry, &discarded);
            self.store.delete(job_id)?;
        }
        // scheduler lock released before taking the instance-map lock
        self.workflow_instances.remove_for_job(job_id).await;
        Ok(())
    }

    pub async fn delete_jobs_in_state(&self, user: &str, job_state: JobState) -> Result<Vec<String>> {
        let deleted = {
            let mut state = self.state.write("ResourceManager/delete_jobs_in_state").await;
            let state = &mut *state;
            let (deleted, discarded) =
                state
                    .controller
                    .delete_jobs_in_state(&mut state.queue, user, job_state);
            release_discarded(&mut state.registry, &discarded);
            for job_id in &deleted {
                self.store.delete(job_id)?;
            }
            deleted
        };
        for job_id in &deleted {
            self.workflow_instances.remove_for_job(job_id).await;
        }
        Ok(deleted)
    }

    // workunit surface

    pub async fn get_workunit(&self, id: &WorkunitId) -> Option<Workunit> {
        let state = self.state.read("ResourceManager/get_workunit").await;
        state.queue.get(id).cloned()
    }

    pub async fn show_workunits(
        &self,
        work_state: Option<WorkState>,
        client: Option<&str>,
    ) -> Vec<Workunit> {
        let state = self.state.read("ResourceManager/show_workunits").await;
        state
            .queue
            .list(work_state, client)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Mint a data-access token for a leased workunit, identified by its
    /// encoded id. The token rides along on every store request the client
    /// makes for this unit.
    pub async fn fetch_data_token(&self, encoded_id: &str, group_token: &str) -> Result<String> {
        if !self.config.client_groups.iter().any(|g| g == group_token) {
            return Err(SchedulerError::UnknownClientGroup(group_token.to_string()));
        }
        let id = WorkunitId::decode(encoded_id)?;
        let mut state = self.state.write("ResourceManager/fetch_data_token").await;
        let token = Uuid::new_v4().to_string();
        state.queue.set_data_token(&id, token.clone())?;
        tracing::debug!(workunit = %id, "Data token issued");
        Ok(token)
    }

    // queue control and status

    pub async fn suspend_queue(&self) {
        let mut state = self.state.write("ResourceManager/suspend_queue").await;
        state.queue_suspended = true;
        tracing::warn!("Work queue suspended, checkout disabled");
    }

    pub async fn resume_queue(&self) {
        let mut state = self.state.write("ResourceManager/resume_queue").await;
        state.queue_suspended = false;
        tracing::info!("Work queue resumed");
    }

    pub async fn queue_status(&self) -> &'static str {
        let state = self.state.read("ResourceManager/queue_status").await;
        if state.queue_suspended {
            "suspended"
        } else {
            "running"
        }
    }

    pub async fn json_status(&self) -> serde_json::Value {
        let state = self.state.read("ResourceManager/json_status").await;
        let (busy, suspended) = client_counts(&state.registry);
        serde_json::json!({
            "queue": {
                "status": if state.queue_suspended { "suspended" } else { "running" },
                "workunits": state.queue.counts_by_state(),
            },
            "jobs": state.controller.counts_by_state(),
            "clients": {
                "registered": state.registry.all().len(),
                "busy": busy,
                "suspended": suspended,
            },
        })
    }

    pub async fn text_status(&self) -> String {
        let state = self.state.read("ResourceManager/text_status").await;
        let mut out = String::new();
        out.push_str(&format!(
            "queue: {}\n",
            if state.queue_suspended { "suspended" } else { "running" }
        ));
        out.push_str(&format!("workunits: {}\n", render_counts(&state.queue.counts_by_state())));
        out.push_str(&format!("jobs: {}\n", render_counts(&state.controller.counts_by_state())));
        let (busy, suspended) = client_counts(&state.registry);
        out.push_str(&format!(
            "clients: registered={} busy={} suspended={}\n",
            state.registry.all().len(),
            busy,
            suspended
        ));
        out
    }

    // background loops

    /// Start the maintenance loops. They run until the token is cancelled:
    /// task activation, client liveness, reservation sweep, and the notice
    /// consumer.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) {
        let rx = self
            .notice_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(rx) = rx {
            tokio::spawn(self.clone().notice_loop(rx, cancel.clone()));
        }
        tokio::spawn(self.clone().task_sweep_loop(cancel.clone()));
        tokio::spawn(self.clone().client_sweep_loop(cancel.clone()));
        tokio::spawn(self.queue_sweep_loop(cancel));
    }

    async fn notice_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Notice>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notice = rx.recv() => {
                    let Some(notice) = notice else { break };
                    if let Err(e) = self.process_notice(&notice).await {
                        tracing::error!(workunit = %notice.id, error = %e, "Notice processing failed");
                    }
                }
            }
        }
        tracing::debug!("Notice loop stopped");
    }

    async fn task_sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.task_sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut state = self.state.write("ResourceManager/task_sweep").await;
                    let state = &mut *state;
                    let promoted = state.controller.sweep_ready_tasks(&mut state.queue);
                    if promoted > 0 {
                        tracing::debug!(promoted, "Task activation sweep");
                    }
                }
            }
        }
    }

    async fn client_sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.client_sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut state = self.state.write("ResourceManager/client_sweep").await;
                    let state = &mut *state;
                    let released = state.registry.expire_stale(Utc::now());
                    let requeued = requeue_released(&mut state.queue, released);
                    if requeued > 0 {
                        tracing::warn!(requeued, "Re-queued workunits of expired clients");
                    }
                }
            }
        }
    }

    async fn queue_sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.queue_sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut state = self.state.write("ResourceManager/queue_sweep").await;
                    let expired = state
                        .queue
                        .sweep_reservations(Utc::now(), self.config.reservation_timeout);
                    if !expired.is_empty() {
                        tracing::warn!(expired = expired.len(), "Re-queued expired reservations");
                    }
                }
            }
        }
    }

    fn persist(&self, controller: &JobController, job_id: &str) -> Result<()> {
        match controller.get_job(job_id) {
            Some(job) => self.store.save(job),
            None => Ok(()),
        }
    }
}

/// Put released leases back in the queue. Units that already reached a
/// terminal state or were discarded are skipped.
fn requeue_released(queue: &mut WorkQueue, released: Vec<WorkunitId>) -> usize {
    let mut requeued = 0;
    for id in released {
        match queue.requeue(&id) {
            Ok(()) => requeued += 1,
            Err(e) => tracing::debug!(workunit = %id, error = %e, "Released unit not re-queued"),
        }
    }
    requeued
}

fn release_discarded(registry: &mut ClientRegistry, discarded: &[Workunit]) {
    for work in discarded {
        if let Some(client) = &work.client {
            registry.remove_work(client, &work.id);
        }
    }
}

fn client_counts(registry: &ClientRegistry) -> (usize, usize) {
    let mut busy = 0;
    let mut suspended = 0;
    for client in registry.all() {
        if client.suspended {
            suspended += 1;
        } else if !client.current_work.is_empty() {
            busy += 1;
        }
    }
    (busy, suspended)
}

fn render_counts(counts: &HashMap<String, usize>) -> String {
    let mut keys: Vec<&String> = counts.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{}={}", k, counts[*k]))
        .collect::<Vec<_>>()
        .join(" ")
}
