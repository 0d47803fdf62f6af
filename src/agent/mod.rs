//! PgBouncer agent service
//!
//! Runs next to one PgBouncer and exposes the pause/resume/health surface
//! the failover orchestrator drives. A pause always carries an expiry: if
//! the orchestrator never follows up with a resume, the agent resumes its
//! PgBouncer itself rather than leave clients queueing indefinitely.

use crate::error::{Error, Result};
use crate::pgbouncer::PgBouncer;
use crate::proto::agent_server::{Agent, AgentServer};
use crate::proto::health_check_response::Status as HealthStatus;
use crate::proto::{
    ComponentHealth, Empty, HealthCheckResponse, PauseRequest, PauseResponse, ResumeResponse,
};
use slog::{error, info, Logger};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tonic::{transport::Server, Request, Response, Status};

/// Agent gRPC service for one PgBouncer instance.
pub struct AgentService {
    logger: Logger,
    pgbouncer: Arc<PgBouncer>,
    /// Pause generation. Bumped on every resume so a pending expiry timer
    /// from an earlier pause cannot resume a later one.
    generation: Arc<Mutex<u64>>,
}

impl AgentService {
    pub fn new(logger: Logger, pgbouncer: Arc<PgBouncer>) -> Self {
        Self {
            logger,
            pgbouncer,
            generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Serve the agent on the given address until the process exits.
    pub async fn serve(self, address: &str) -> Result<()> {
        let addr = address
            .parse()
            .map_err(|err| Error::Internal(format!("invalid bind address {address}: {err}")))?;

        info!(self.logger, "starting agent server"; "address" => address);

        Server::builder()
            .add_service(AgentServer::new(self))
            .serve(addr)
            .await?;

        Ok(())
    }
}

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn health_check(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let (status, message) = match self.pgbouncer.health_check().await {
            Ok(()) => (HealthStatus::Healthy, String::new()),
            Err(err) => {
                error!(self.logger, "pgbouncer health check failed"; "error" => %err);
                (HealthStatus::Unhealthy, err.to_string())
            }
        };

        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
            components: vec![ComponentHealth {
                name: "pgbouncer".to_string(),
                status: status as i32,
                message,
            }],
        }))
    }

    async fn pause(
        &self,
        request: Request<PauseRequest>,
    ) -> std::result::Result<Response<PauseResponse>, Status> {
        let request = request.into_inner();
        let pause_timeout = Duration::from_millis(request.timeout.max(0) as u64);
        let expiry = Duration::from_millis(request.expiry.max(0) as u64);

        info!(self.logger, "pausing pgbouncer";
            "timeout_ms" => request.timeout, "expiry_ms" => request.expiry);

        self.pgbouncer
            .pause(pause_timeout)
            .await
            .map_err(|err| Status::unavailable(err.to_string()))?;

        let created_at = SystemTime::now();
        let expires_at = created_at + expiry;

        // Self-resume once the expiry elapses, unless a resume (which bumps
        // the generation) lands first.
        let generation = *self.generation.lock().await;
        let guard = self.generation.clone();
        let pgbouncer = self.pgbouncer.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;

            let current = guard.lock().await;
            if *current != generation {
                return;
            }

            info!(logger, "pause expired, resuming pgbouncer");
            if let Err(err) = pgbouncer.resume().await {
                error!(logger, "failed to auto-resume pgbouncer"; "error" => %err);
            }
        });

        Ok(Response::new(PauseResponse {
            created_at: unix_millis(created_at),
            expires_at: unix_millis(expires_at),
        }))
    }

    async fn resume(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<ResumeResponse>, Status> {
        info!(self.logger, "resuming pgbouncer");

        // Invalidate any pending expiry timer before touching PgBouncer.
        *self.generation.lock().await += 1;

        self.pgbouncer
            .resume()
            .await
            .map_err(|err| Status::unavailable(err.to_string()))?;

        Ok(Response::new(ResumeResponse {
            created_at: unix_millis(SystemTime::now()),
        }))
    }
}
