use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Store Error - {0}")]
    Store(String),

    #[error("Optimistic Lock Error - {0}")]
    OptimisticLock(String),

    #[error("Integrity Error - {0}")]
    Integrity(String),

    /// Rows read back after an insert do not match what was written.
    #[error("Insert/Select Mismatch Error - expected {expected} tasks, selected {selected}")]
    InsertSelectMismatch { expected: usize, selected: usize },

    #[error("Unconstrained Filter Error - {0}")]
    UnconstrainedFilter(String),

    #[error("Search Error - {0}")]
    Search(String),

    #[error("Cluster Lock Error - {0}")]
    ClusterLock(String),

    #[error("Node Not Found Error - {0}")]
    NodeNotFound(String),

    #[error("Null Cluster State Error - {0}")]
    NullClusterState(String),

    #[error("Permission Denied Error - {0}")]
    PermissionDenied(String),

    #[error("Config Error - {0}")]
    ParseConfig(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Join Error - {0}")]
    Join(String),}

impl Error {
    /// Node directory errors that mean "cluster state unknown right now". Liveness sweeps skip on
    /// these instead of failing.
    pub fn is_node_state_unknown(&self) -> bool {
        matches!(self, Error::NodeNotFound(_) | Error::NullClusterState(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Join(value.to_string())
    }
}
