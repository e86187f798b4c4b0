use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::model::WorkunitId;

/// A registered worker client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub group: String,
    pub user: String,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_reason: Option<String>,
    /// Slot count for multi-slot workers, updated via heartbeat.
    pub sub_clients: u32,
    /// Workunits currently leased to this client.
    pub current_work: HashSet<WorkunitId>,
}

impl Client {
    fn new(name: String, group: String, user: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            group,
            user,
            last_heartbeat: now,
            registered_at: now,
            suspended: false,
            suspend_reason: None,
            sub_clients: 0,
            current_work: HashSet::new(),
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Reply to a successful heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReply {
    /// Workunit ids the server believes the client holds. The client drops
    /// anything not in this list (it was re-queued or discarded).
    pub current_work: Vec<String>,
}

/// Tracks registered worker clients, their liveness and suspension.
///
/// Suspending a client releases its leases: the registry returns the ids so
/// the caller can re-queue them under the same write lock. This is what makes
/// worker crashes non-fatal to job progress.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
    groups: Vec<String>,
    heartbeat_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(groups: Vec<String>, heartbeat_timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            groups,
            heartbeat_timeout,
        }
    }

    /// Register a new client after validating its group token.
    pub fn register(
        &mut self,
        group_token: &str,
        user: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Client> {
        if !self.groups.iter().any(|g| g == group_token) {
            return Err(SchedulerError::UnknownClientGroup(group_token.to_string()));
        }
        let client = Client::new(name.into(), group_token.to_string(), user.into());
        tracing::info!(client_id = %client.id, group = %client.group, "Client registered");
        self.clients.insert(client.id.clone(), client.clone());
        Ok(client)
    }

    /// Refresh liveness. Fails for unknown or suspended clients; optionally
    /// updates the sub-client count.
    pub fn heartbeat(
        &mut self,
        client_id: &str,
        group_token: &str,
        sub_clients: Option<u32>,
    ) -> Result<HeartbeatReply> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SchedulerError::ClientNotFound(client_id.to_string()))?;
        if client.group != group_token {
            return Err(SchedulerError::UnknownClientGroup(group_token.to_string()));
        }
        if client.suspended {
            return Err(SchedulerError::ClientSuspended(client_id.to_string()));
        }
        client.last_heartbeat = Utc::now();
        if let Some(n) = sub_clients {
            client.sub_clients = n;
        }
        Ok(HeartbeatReply {
            current_work: client.current_work.iter().map(|w| w.to_string()).collect(),
        })
    }

    pub fn get(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    pub fn all(&self) -> Vec<&Client> {
        self.clients.values().collect()
    }

    pub fn by_user(&self, user: &str) -> Vec<&Client> {
        self.clients.values().filter(|c| c.user == user).collect()
    }

    pub fn update_sub_clients(&mut self, client_id: &str, count: u32) -> Result<()> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SchedulerError::ClientNotFound(client_id.to_string()))?;
        client.sub_clients = count;
        Ok(())
    }

    /// Record a new lease on the client.
    pub fn add_work(&mut self, client_id: &str, id: WorkunitId) -> Result<()> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SchedulerError::ClientNotFound(client_id.to_string()))?;
        client.current_work.insert(id);
        Ok(())
    }

    /// Drop a lease record, e.g. after a completion notice. Unknown clients
    /// are ignored; the unit transition already happened.
    pub fn remove_work(&mut self, client_id: &str, id: &WorkunitId) {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.current_work.remove(id);
        }
    }

    /// Suspend one client and release its leases. A suspended client holds
    /// no active lease, so the returned ids must be re-queued by the caller.
    pub fn suspend(&mut self, client_id: &str, reason: &str) -> Result<Vec<WorkunitId>> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SchedulerError::ClientNotFound(client_id.to_string()))?;
        client.suspended = true;
        client.suspend_reason = Some(reason.to_string());
        let released: Vec<WorkunitId> = client.current_work.drain().collect();
        tracing::info!(
            client_id,
            reason,
            released = released.len(),
            "Client suspended"
        );
        Ok(released)
    }

    pub fn suspend_all(&mut self, reason: &str) -> (usize, Vec<WorkunitId>) {
        let ids: Vec<String> = self
            .clients
            .values()
            .filter(|c| !c.suspended)
            .map(|c| c.id.clone())
            .collect();
        self.suspend_many(&ids, reason)
    }

    pub fn suspend_by_user(&mut self, user: &str, reason: &str) -> (usize, Vec<WorkunitId>) {
        let ids: Vec<String> = self
            .clients
            .values()
            .filter(|c| !c.suspended && c.user == user)
            .map(|c| c.id.clone())
            .collect();
        self.suspend_many(&ids, reason)
    }

    fn suspend_many(&mut self, ids: &[String], reason: &str) -> (usize, Vec<WorkunitId>) {
        let mut released = Vec::new();
        for id in ids {
            if let Ok(mut work) = self.suspend(id, reason) {
                released.append(&mut work);
            }
        }
        (ids.len(), released)
    }

    pub fn resume(&mut self, client_id: &str) -> Result<()> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SchedulerError::ClientNotFound(client_id.to_string()))?;
        client.suspended = false;
        client.suspend_reason = None;
        client.last_heartbeat = Utc::now();
        tracing::info!(client_id, "Client resumed");
        Ok(())
    }

    pub fn resume_all(&mut self) -> usize {
        self.resume_where(|_| true)
    }

    pub fn resume_by_user(&mut self, user: &str) -> usize {
        self.resume_where(|c| c.user == user)
    }

    fn resume_where(&mut self, pred: impl Fn(&Client) -> bool) -> usize {
        let ids: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.suspended && pred(c))
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            // resume() only fails for unknown ids, which cannot happen here
            let _ = self.resume(id);
        }
        ids.len()
    }

    /// Remove a client entirely, releasing its leases.
    pub fn deregister(&mut self, client_id: &str) -> Result<Vec<WorkunitId>> {
        let mut client = self
            .clients
            .remove(client_id)
            .ok_or_else(|| SchedulerError::ClientNotFound(client_id.to_string()))?;
        Ok(client.current_work.drain().collect())
    }

    /// Liveness sweep: suspend every client whose heartbeat has expired and
    /// collect the leases to release.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<WorkunitId> {
        let stale: Vec<String> = self
            .clients
            .values()
            .filter(|c| !c.suspended && c.heartbeat_age(now) > self.heartbeat_timeout)
            .map(|c| c.id.clone())
            .collect();
        let mut released = Vec::new();
        for id in &stale {
            tracing::warn!(client_id = %id, "Client heartbeat expired");
            if let Ok(mut work) = self.suspend(id, "heartbeat expired") {
                released.append(&mut work);
            }
        }
        released
    }
}
