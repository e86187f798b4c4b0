use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the local file cache in front of the remote object store.
///
/// Cached files are keyed by remote node id and sharded into a three-level
/// directory tree derived from the id's first six characters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable the cache. When disabled, all input staging goes to the network.
    pub enabled: bool,
    /// Root directory for cached files.
    pub data_root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_root: PathBuf::from("/var/lib/taskmill/data"),
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Root directory for workunit working directories.
    pub work_root: PathBuf,
    /// Cache settings used by the data mover.
    pub cache: CacheConfig,
    /// Client group tokens accepted at registration.
    pub client_groups: Vec<String>,
    /// Failure count at which a workunit is suspended instead of retried.
    pub max_work_failures: u32,
    /// Exit code that marks a workunit failed-permanent. The sentinel is
    /// owned by the task's own program, so it stays configurable.
    pub permanent_exit_code: i32,
    /// Heartbeat age after which a client is suspended and its leases released.
    pub client_heartbeat_timeout: Duration,
    /// Age after which an unconfirmed reservation reverts to queued.
    pub reservation_timeout: Duration,
    /// Hard cap on workunits returned by a single checkout.
    pub checkout_max_batch: usize,
    /// Fixed wait before the single upload retry.
    pub upload_retry_backoff: Duration,
    /// Remote store request timeout.
    pub store_timeout: Duration,
    /// Interval of the task-activation sweep.
    pub task_sweep_interval: Duration,
    /// Interval of the client-liveness sweep.
    pub client_sweep_interval: Duration,
    /// Interval of the queue-bookkeeping sweep.
    pub queue_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("/var/lib/taskmill/work"),
            cache: CacheConfig::default(),
            client_groups: vec!["default".to_string()],
            max_work_failures: 3,
            permanent_exit_code: 42,
            client_heartbeat_timeout: Duration::from_secs(300),
            reservation_timeout: Duration::from_secs(60),
            checkout_max_batch: 32,
            upload_retry_backoff: Duration::from_secs(3),
            store_timeout: Duration::from_secs(60),
            task_sweep_interval: Duration::from_secs(5),
            client_sweep_interval: Duration::from_secs(30),
            queue_sweep_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, data_root: impl Into<PathBuf>) -> Self {
        self.cache = CacheConfig {
            enabled: true,
            data_root: data_root.into(),
        };
        self
    }

    pub fn with_client_group(mut self, group: impl Into<String>) -> Self {
        self.client_groups.push(group.into());
        self
    }

    pub fn with_max_work_failures(mut self, max: u32) -> Self {
        self.max_work_failures = max;
        self
    }

    pub fn with_permanent_exit_code(mut self, code: i32) -> Self {
        self.permanent_exit_code = code;
        self
    }
}
