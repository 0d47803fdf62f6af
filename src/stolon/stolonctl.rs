//! stolonctl subprocess wrapper

use crate::error::{Error, Result};
use std::process::Stdio;
use tokio::process::Command;

/// Marks keepers as failed through the external cluster manager.
#[tonic::async_trait]
pub trait KeeperControl: Send + Sync {
    /// Ask the cluster manager to fail the given keeper, triggering the
    /// election of a new primary.
    async fn fail_keeper(&self, keeper_uid: &str) -> Result<()>;
}

/// Invokes the `stolonctl` binary with the cluster coordinates it needs on
/// every call.
#[derive(Debug, Clone)]
pub struct Stolonctl {
    pub cluster_name: String,
    pub store_backend: String,
    pub store_endpoints: String,
}

impl Stolonctl {
    pub fn new(
        cluster_name: impl Into<String>,
        store_backend: impl Into<String>,
        store_endpoints: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            store_backend: store_backend.into(),
            store_endpoints: store_endpoints.into(),
        }
    }
}

#[tonic::async_trait]
impl KeeperControl for Stolonctl {
    async fn fail_keeper(&self, keeper_uid: &str) -> Result<()> {
        let status = Command::new("stolonctl")
            .arg("--cluster-name")
            .arg(&self.cluster_name)
            .arg("--store-backend")
            .arg(&self.store_backend)
            .arg("--store-endpoints")
            .arg(&self.store_endpoints)
            .arg("failkeeper")
            .arg(keeper_uid)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|err| Error::FailkeeperFailed(err.to_string()))?;

        if !status.success() {
            return Err(Error::FailkeeperFailed(format!(
                "stolonctl exited with {status}"
            )));
        }

        Ok(())
    }
}
