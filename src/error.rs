use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Workunit not found: {0}")]
    WorkunitNotFound(String),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Client {0} is suspended")]
    ClientSuspended(String),

    #[error("Unknown client group: {0}")]
    UnknownClientGroup(String),

    #[error("Queue is suspended")]
    QueueSuspended,

    #[error("Invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Suspend requires a non-empty reason")]
    MissingSuspendReason,

    #[error("Transfer failed for {id} (file {file}, target {target}): {message}")]
    Transfer {
        id: String,
        file: String,
        target: String,
        message: String,
        /// Bytes the data phase had already moved when it aborted.
        bytes_moved: u64,
    },

    #[error("Data integrity error for {id}: {message}")]
    DataIntegrity {
        id: String,
        message: String,
        /// Bytes the data phase had already moved when it aborted.
        bytes_moved: u64,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Bad data token request: {0}")]
    BadDataToken(String),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

// Convenience constructors for variants that carry transfer context.
impl SchedulerError {
    pub fn transfer(
        id: impl Into<String>,
        file: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transfer {
            id: id.into(),
            file: file.into(),
            target: target.into(),
            message: message.into(),
            bytes_moved: 0,
        }
    }

    pub fn data_integrity(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            id: id.into(),
            message: message.into(),
            bytes_moved: 0,
        }
    }

    pub fn invalid_transition(
        id: impl std::fmt::Display,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Record the bytes a data phase had moved before this error aborted it.
    /// No-op for variants outside the data phase.
    pub fn with_bytes_moved(mut self, bytes: u64) -> Self {
        match &mut self {
            Self::Transfer { bytes_moved, .. } | Self::DataIntegrity { bytes_moved, .. } => {
                *bytes_moved = bytes;
            }
            _ => {}
        }
        self
    }

    /// Bytes moved before the data phase aborted, zero for other variants.
    pub fn bytes_moved(&self) -> u64 {
        match self {
            Self::Transfer { bytes_moved, .. } | Self::DataIntegrity { bytes_moved, .. } => {
                *bytes_moved
            }
            _ => 0,
        }
    }

    /// True for errors worth one more attempt against the remote store.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Store(_) | Self::Io(_))
    }
}
