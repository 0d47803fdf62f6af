//! Zero-downtime failover for stolon PostgreSQL clusters fronted by
//! PgBouncer.
//!
//! The orchestrator pauses every PgBouncer so client queries queue instead
//! of failing, asks stolon to fail the current primary keeper, waits until a
//! healthy replacement is elected, then resumes the PgBouncers. The agent
//! runs next to each PgBouncer and exposes the pause/resume/health RPC
//! surface the orchestrator drives.

pub mod agent;
pub mod config;
pub mod error;
pub mod etcd;
pub mod failover;
pub mod pgbouncer;
pub mod pipeline;
pub mod stolon;
pub mod streams;

// Include the generated protobuf code for the agent RPC service
pub mod proto {
    tonic::include_proto!("failover");
}

pub use config::{AgentOptions, FailoverOptions};
pub use error::{Error, Result};
pub use failover::{ClusterStore, Failover, FailoverClient, GrpcFailoverClient};
pub use pipeline::{Pipeline, Step};
