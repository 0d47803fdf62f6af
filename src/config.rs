//! Configuration for the failover orchestrator and the PgBouncer agent

use std::time::Duration;

/// Per-step deadlines and cluster addressing for one failover run.
///
/// The options are immutable for the duration of a run. `pause_expiry` is the
/// hard bound on the client-visible outage window: agents resume themselves
/// once it elapses, so every step after `pause` must finish well inside it.
#[derive(Debug, Clone)]
pub struct FailoverOptions {
    /// etcd key holding the stolon cluster snapshot.
    pub clusterdata_key: String,

    /// Deadline for each agent's pre-flight health check.
    pub health_check_timeout: Duration,

    /// Deadline for acquiring (and releasing) the failover lock.
    pub lock_timeout: Duration,

    /// How long an agent may block waiting for PgBouncer to quiesce.
    pub pause_timeout: Duration,

    /// How long an agent stays paused before resuming itself.
    pub pause_expiry: Duration,

    /// Deadline for each agent's resume call.
    pub resume_timeout: Duration,

    /// Deadline for the stolonctl subprocess.
    pub stolonctl_timeout: Duration,
}

impl FailoverOptions {
    /// Create options for the given clusterdata key with default deadlines.
    pub fn new(clusterdata_key: impl Into<String>) -> Self {
        Self {
            clusterdata_key: clusterdata_key.into(),
            health_check_timeout: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(5),
            pause_timeout: Duration::from_secs(5),
            pause_expiry: Duration::from_secs(25),
            resume_timeout: Duration::from_secs(5),
            stolonctl_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout = timeout;
        self
    }

    pub fn with_pause_expiry(mut self, expiry: Duration) -> Self {
        self.pause_expiry = expiry;
        self
    }

    pub fn with_resume_timeout(mut self, timeout: Duration) -> Self {
        self.resume_timeout = timeout;
        self
    }

    pub fn with_stolonctl_timeout(mut self, timeout: Duration) -> Self {
        self.stolonctl_timeout = timeout;
        self
    }
}

/// Settings for the PgBouncer agent daemon.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Address the agent gRPC service binds to (e.g. "0.0.0.0:8444").
    pub bind_address: String,

    /// Connection string for the PgBouncer admin console (e.g.
    /// "host=127.0.0.1 port=6432 user=pgbouncer dbname=pgbouncer").
    pub admin_dsn: String,
}

impl AgentOptions {
    pub fn new(bind_address: impl Into<String>, admin_dsn: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            admin_dsn: admin_dsn.into(),
        }
    }
}
