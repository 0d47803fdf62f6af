//! Error types for failover orchestration

use thiserror::Error;

/// Result type for failover operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the failover pipeline and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// An agent failed its pre-flight health check
    #[error("agent {endpoint} is not healthy: {status}")]
    AgentUnhealthy { endpoint: String, status: String },

    /// The cluster-wide failover lock could not be acquired in time
    #[error("failed to acquire failover lock")]
    LockUnavailable,

    /// One or more agents failed to pause their PgBouncer
    #[error("failed to pause pgbouncers")]
    PauseFailed,

    /// One or more agents failed to resume their PgBouncer
    #[error("failed to resume pgbouncers")]
    ResumeFailed,

    /// stolonctl failed to mark the keeper as failed
    #[error("failed to run stolonctl failkeeper: {0}")]
    FailkeeperFailed(String),

    /// The cluster did not report a healthy new master in time
    #[error("timed out waiting for successful recovery")]
    RecoveryTimeout,

    /// The cluster snapshot is corrupt or not yet initialised
    #[error("invalid clusterdata: {0}")]
    InvalidClusterdata(String),

    /// PgBouncer admin command failed
    #[error("pgbouncer admin error: {0}")]
    PgBouncer(String),

    /// Forward progress was cancelled by the operator
    #[error("operation aborted")]
    Aborted,

    /// A bounded operation exceeded its deadline
    #[error("{0} timed out")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
