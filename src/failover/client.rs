//! Agent RPC handles

use crate::error::Result;
use crate::proto::agent_client::AgentClient;
use crate::proto::{Empty, HealthCheckResponse, PauseRequest, PauseResponse, ResumeResponse};
use tonic::transport::Channel;

/// One PgBouncer agent as seen by the orchestrator.
#[tonic::async_trait]
pub trait FailoverClient: Send + Sync {
    async fn health_check(&self) -> Result<HealthCheckResponse>;
    async fn pause(&self, request: PauseRequest) -> Result<PauseResponse>;
    async fn resume(&self) -> Result<ResumeResponse>;
}

/// gRPC client for one agent endpoint.
pub struct GrpcFailoverClient {
    client: AgentClient<Channel>,
}

impl GrpcFailoverClient {
    /// Connect to the agent at the given address.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = AgentClient::connect(format!("http://{endpoint}")).await?;
        Ok(Self { client })
    }
}

#[tonic::async_trait]
impl FailoverClient for GrpcFailoverClient {
    async fn health_check(&self) -> Result<HealthCheckResponse> {
        let mut client = self.client.clone();
        Ok(client.health_check(Empty {}).await?.into_inner())
    }

    async fn pause(&self, request: PauseRequest) -> Result<PauseResponse> {
        let mut client = self.client.clone();
        Ok(client.pause(request).await?.into_inner())
    }

    async fn resume(&self) -> Result<ResumeResponse> {
        let mut client = self.client.clone();
        Ok(client.resume(Empty {}).await?.into_inner())
    }
}
