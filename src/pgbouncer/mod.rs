//! PgBouncer admin console wrapper
//!
//! PgBouncer is managed through admin commands (`PAUSE;`, `RESUME;`,
//! `SHOW DATABASES;`) issued against its special `pgbouncer` database. The
//! console only understands the simple-query protocol.

use crate::error::{Error, Result};
use slog::{debug, error, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Executes admin commands against one PgBouncer.
#[tonic::async_trait]
pub trait AdminExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<()>;
}

/// Admin-protocol handle on a PgBouncer instance.
pub struct PgBouncer {
    logger: Logger,
    executor: Arc<dyn AdminExecutor>,
}

impl PgBouncer {
    pub fn new(logger: Logger, executor: Arc<dyn AdminExecutor>) -> Self {
        Self { logger, executor }
    }

    /// Stop dispatching server connections. Waits up to `deadline` for
    /// in-flight queries to finish; clients stay connected and queue.
    pub async fn pause(&self, deadline: Duration) -> Result<()> {
        debug!(self.logger, "issuing PAUSE");
        match timeout(deadline, self.executor.execute("PAUSE;")).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("pgbouncer pause".to_string())),
        }
    }

    /// Resume dispatching server connections. Resuming an unpaused pooler
    /// is a no-op.
    pub async fn resume(&self) -> Result<()> {
        debug!(self.logger, "issuing RESUME");
        match self.executor.execute("RESUME;").await {
            Ok(()) => Ok(()),
            // PgBouncer reports an error when there is nothing to resume.
            Err(err) if err.to_string().contains("not paused") => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Verify the admin console answers queries.
    pub async fn health_check(&self) -> Result<()> {
        self.executor.execute("SHOW DATABASES;").await
    }
}

/// Executor over a live admin-console connection.
pub struct AdminConnection {
    client: tokio_postgres::Client,
}

impl AdminConnection {
    /// Connect to the PgBouncer admin database.
    pub async fn connect(logger: Logger, dsn: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, tokio_postgres::NoTls)
            .await
            .map_err(|err| Error::PgBouncer(err.to_string()))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(logger, "pgbouncer admin connection failed"; "error" => %err);
            }
        });

        Ok(Self { client })
    }
}

#[tonic::async_trait]
impl AdminExecutor for AdminConnection {
    async fn execute(&self, command: &str) -> Result<()> {
        self.client
            .simple_query(command)
            .await
            .map(|_| ())
            .map_err(|err| Error::PgBouncer(err.to_string()))
    }
}
