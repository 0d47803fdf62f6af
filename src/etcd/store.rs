//! etcd-backed cluster state access

use crate::error::{Error, Result};
use crate::etcd::stream::{stream, StreamOptions};
use crate::failover::ClusterStore;
use crate::streams::KvRecord;
use etcd_client::Client;
use slog::Logger;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Reads and watches the cluster manager's state in etcd.
pub struct EtcdStore {
    logger: Logger,
    client: Client,
    get_timeout: Duration,
}

impl EtcdStore {
    pub fn new(logger: Logger, client: Client) -> Self {
        Self {
            logger,
            client,
            get_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }
}

#[tonic::async_trait]
impl ClusterStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<KvRecord> {
        let mut client = self.client.clone();
        let response = match timeout(self.get_timeout, client.get(key, None)).await {
            Ok(response) => response?,
            Err(_) => return Err(Error::Timeout(format!("get {key}"))),
        };

        let kv = response
            .kvs()
            .first()
            .ok_or_else(|| Error::InvalidClusterdata(format!("no value at {key}")))?;

        Ok(KvRecord {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
            revision: kv.mod_revision(),
        })
    }

    fn watch(&self, token: CancellationToken, options: StreamOptions) -> mpsc::Receiver<KvRecord> {
        stream(self.logger.clone(), self.client.clone(), token, options)
    }
}
