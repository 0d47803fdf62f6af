//! Cluster-wide failover lock
//!
//! Exactly one orchestrator may drive a failover at a time. The lock is a
//! lease-backed key under `{clusterdata_key}/failover`: while we hold it, a
//! keepalive task renews the lease; if the orchestrator dies or is
//! partitioned, the lease expires and the lock releases implicitly.

use crate::error::{Error, Result};
use etcd_client::{Client, LockOptions};
use slog::{debug, Logger};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Exclusive lock guarding the failover pipeline.
#[tonic::async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self) -> Result<()>;
    async fn unlock(&self) -> Result<()>;
}

/// Lease-backed lock held in etcd.
pub struct EtcdLock {
    logger: Logger,
    client: Client,
    name: String,
    lock_timeout: Duration,
    lease_ttl: i64,
    held: Mutex<Option<Held>>,
}

struct Held {
    key: Vec<u8>,
    lease_id: i64,
    keepalive: CancellationToken,
}

impl EtcdLock {
    pub fn new(logger: Logger, client: Client, clusterdata_key: &str, lock_timeout: Duration) -> Self {
        Self {
            logger,
            client,
            name: format!("{clusterdata_key}/failover"),
            lock_timeout,
            lease_ttl: 30,
            held: Mutex::new(None),
        }
    }

    /// Session lease TTL in seconds. Bounds how long a crashed holder keeps
    /// the lock.
    pub fn with_lease_ttl(mut self, seconds: i64) -> Self {
        self.lease_ttl = seconds;
        self
    }
}

#[tonic::async_trait]
impl Locker for EtcdLock {
    async fn lock(&self) -> Result<()> {
        let mut client = self.client.clone();

        let lease = client.lease_grant(self.lease_ttl, None).await?;
        let lease_id = lease.id();
        debug!(self.logger, "granted session lease"; "lease_id" => lease_id);

        let options = LockOptions::new().with_lease(lease_id);
        let response = match timeout(self.lock_timeout, client.lock(self.name.as_str(), Some(options))).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(err.into());
            }
            Err(_) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(Error::LockUnavailable);
            }
        };

        // Keep the session alive for as long as we hold the lock.
        let keepalive = CancellationToken::new();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;
        let renew_interval = Duration::from_secs((self.lease_ttl as u64 / 3).max(1));
        let renew_token = keepalive.clone();
        let renew_logger = self.logger.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(renew_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = renew_token.cancelled() => return,
                    _ = tick.tick() => {
                        if keeper.keep_alive().await.is_err() {
                            debug!(renew_logger, "lease keepalive failed"; "lease_id" => lease_id);
                            return;
                        }
                        let _ = responses.message().await;
                    }
                }
            }
        });

        *self.held.lock().await = Some(Held {
            key: response.key().to_vec(),
            lease_id,
            keepalive,
        });

        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        let Some(held) = self.held.lock().await.take() else {
            return Ok(());
        };

        held.keepalive.cancel();

        let mut client = self.client.clone();
        match timeout(self.lock_timeout, client.unlock(held.key)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                // The lease stops renewing regardless, so the key falls out
                // when it expires.
                let _ = client.lease_revoke(held.lease_id).await;
                return Err(err.into());
            }
            Err(_) => return Err(Error::Timeout("lock release".to_string())),
        }

        let _ = client.lease_revoke(held.lease_id).await;
        Ok(())
    }
}
