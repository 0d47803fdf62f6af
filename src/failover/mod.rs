//! Orchestrated failover of the cluster primary
//!
//! Moving the primary keeper naively closes every in-flight transaction and
//! spikes client error rates. This orchestrator instead pauses all frontend
//! PgBouncers so queries queue instead of failing, asks stolon to fail the
//! current primary, waits for the cluster to elect and report a healthy
//! replacement, then resumes the PgBouncers so queued clients reconnect
//! transparently.

pub mod client;

pub use client::{FailoverClient, GrpcFailoverClient};

use crate::config::FailoverOptions;
use crate::error::{Error, Result};
use crate::etcd::{Locker, StreamOptions};
use crate::pipeline::{Pipeline, Step};
use crate::proto::health_check_response::Status as HealthStatus;
use crate::proto::PauseRequest;
use crate::stolon::{Clusterdata, Db, KeeperControl};
use crate::streams::{revision_filter, KvRecord};
use futures::future::BoxFuture;
use slog::{error, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Snapshot read and watch access to the cluster manager's state.
#[tonic::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read the current value of a key.
    async fn get(&self, key: &str) -> Result<KvRecord>;

    /// Open a revision stream for the given keys. The stream ends when the
    /// token is cancelled.
    fn watch(&self, token: CancellationToken, options: StreamOptions) -> mpsc::Receiver<KvRecord>;
}

/// The failover orchestrator.
pub struct Failover {
    logger: Logger,
    store: Arc<dyn ClusterStore>,
    clients: HashMap<String, Arc<dyn FailoverClient>>,
    stolonctl: Arc<dyn KeeperControl>,
    locker: Arc<dyn Locker>,
    opt: FailoverOptions,
}

impl Failover {
    pub fn new(
        logger: Logger,
        store: Arc<dyn ClusterStore>,
        clients: HashMap<String, Arc<dyn FailoverClient>>,
        stolonctl: Arc<dyn KeeperControl>,
        locker: Arc<dyn Locker>,
        opt: FailoverOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            logger,
            store,
            clients,
            stolonctl,
            locker,
            opt,
        })
    }

    /// Trigger the failover. The run is a pipeline of steps where each step
    /// schedules its deferred action before the primary operation ever takes
    /// place, so partial effect is always cleaned up.
    ///
    /// `exec` cancels forward progress; `defer` governs only the cleanup
    /// drain. They must be independent: an aborted run still resumes the
    /// PgBouncers and releases the lock.
    pub async fn run(self: &Arc<Self>, exec: &CancellationToken, defer: &CancellationToken) -> Result<()> {
        Pipeline::new(vec![
            Step::new("health_check_clients", step(self, |f| async move {
                f.health_check_clients().await
            })),
            Step::new("acquire_lock", step(self, |f| async move {
                f.acquire_lock().await
            }))
            .with_cleanup("release_lock", step(self, |f| async move {
                f.release_lock().await
            })),
            Step::new("pause", step(self, |f| async move { f.pause().await }))
                .with_cleanup("resume", step(self, |f| async move { f.resume().await })),
            Step::new("failkeeper", step(self, |f| async move {
                f.failkeeper().await
            })),
        ])
        .run(&self.logger, exec, defer)
        .await
    }

    /// Verify every agent reports healthy before any state is touched.
    pub(crate) async fn health_check_clients(&self) -> Result<()> {
        info!(self.logger, "health checking all clients"; "event" => "clients.health_check");

        let deadline = self.opt.health_check_timeout;
        self.each_client("clients.health_check", move |endpoint, client| {
            Box::pin(async move {
                let response = match timeout(deadline, client.health_check()).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        return Err(Error::AgentUnhealthy {
                            endpoint,
                            status: err.to_string(),
                        })
                    }
                    Err(_) => {
                        return Err(Error::AgentUnhealthy {
                            endpoint,
                            status: "health check timed out".to_string(),
                        })
                    }
                };

                if response.status() != HealthStatus::Healthy {
                    return Err(Error::AgentUnhealthy {
                        endpoint,
                        status: format!("{:?}", response.status()),
                    });
                }

                Ok(())
            })
        })
        .await
    }

    pub(crate) async fn acquire_lock(&self) -> Result<()> {
        info!(self.logger, "acquiring failover lock in etcd"; "event" => "etcd.lock.acquire");
        self.locker.lock().await
    }

    pub(crate) async fn release_lock(&self) -> Result<()> {
        info!(self.logger, "releasing failover lock in etcd"; "event" => "etcd.lock.release");
        self.locker.unlock().await
    }

    /// Pause every PgBouncer so client queries queue instead of failing.
    pub(crate) async fn pause(&self) -> Result<()> {
        info!(self.logger, "requesting all pgbouncers pause"; "event" => "clients.pgbouncer.pause");

        // Allow an additional second for network round-trip. We should have
        // terminated this request far before this deadline expires.
        let deadline = self.opt.pause_expiry + Duration::from_secs(1);
        let request = PauseRequest {
            timeout: self.opt.pause_timeout.as_millis() as i64,
            expiry: self.opt.pause_expiry.as_millis() as i64,
        };

        self.each_client("clients.pgbouncer.pause", move |_endpoint, client| {
            let request = request.clone();
            Box::pin(async move {
                match timeout(deadline, client.pause(request)).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(Error::Timeout("pause".to_string())),
                }
            })
        })
        .await
        .map_err(|_| Error::PauseFailed)
    }

    /// Resume every PgBouncer. Runs as the deferred counterpart of `pause`,
    /// on success and failure alike.
    pub(crate) async fn resume(&self) -> Result<()> {
        info!(self.logger, "requesting all pgbouncers resume"; "event" => "clients.pgbouncer.resume");

        let deadline = self.opt.resume_timeout;
        self.each_client("clients.pgbouncer.resume", move |_endpoint, client| {
            Box::pin(async move {
                match timeout(deadline, client.resume()).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(Error::Timeout("resume".to_string())),
                }
            })
        })
        .await
        .map_err(|_| Error::ResumeFailed)
    }

    /// Perform an action against all clients in parallel, waiting for every
    /// call to finish. For operations where running time extends the outage
    /// window (such as pause) serial dispatch would accumulate each agent's
    /// wait; parallel dispatch keeps the window to the slowest agent.
    ///
    /// Returns success only when every call succeeded. When several fail,
    /// one of the errors is returned; each is logged against its endpoint.
    pub(crate) async fn each_client<F>(&self, event: &'static str, action: F) -> Result<()>
    where
        F: Fn(String, Arc<dyn FailoverClient>) -> BoxFuture<'static, Result<()>>,
    {
        let logger = self.logger.new(o!("event" => event));

        let mut tasks = Vec::with_capacity(self.clients.len());
        for (endpoint, client) in &self.clients {
            let future = action(endpoint.clone(), Arc::clone(client));
            let logger = logger.clone();
            let endpoint = endpoint.clone();

            tasks.push(tokio::spawn(async move {
                let begin = Instant::now();
                let result = future.await;

                if let Err(err) = &result {
                    error!(logger, "client call failed"; "endpoint" => &endpoint, "error" => %err);
                }
                info!(logger, "client call finished";
                    "endpoint" => &endpoint,
                    "elapsed" => begin.elapsed().as_secs_f64(),
                );

                result
            }));
        }

        let mut outcome = Ok(());
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => outcome = Err(err),
                Err(err) => outcome = Err(Error::Internal(format!("client task failed: {err}"))),
            }
        }

        outcome
    }

    /// Fail the current primary keeper, then wait for the cluster to elect
    /// and report a healthy replacement.
    pub(crate) async fn failkeeper(&self) -> Result<()> {
        let record = self.store.get(&self.opt.clusterdata_key).await?;
        let clusterdata = Clusterdata::parse(&record.value)?;
        let master = clusterdata
            .master()
            .cloned()
            .ok_or_else(|| Error::InvalidClusterdata("could not identify master keeper".to_string()))?;

        info!(self.logger, "failing current master keeper";
            "event" => "stolonctl.failkeeper", "master" => %master);

        match timeout(self.opt.stolonctl_timeout, self.stolonctl.fail_keeper(&master.keeper_uid)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(Error::FailkeeperFailed(
                    "stolonctl timed out".to_string(),
                ))
            }
        }

        // The pause expires on the agents regardless of what the cluster
        // does, so recovery is bounded by the same window.
        match timeout(self.opt.pause_expiry, self.notify_recovered(&master)).await {
            Ok(Ok(new_master)) => {
                info!(self.logger, "cluster successfully recovered"; "master" => %new_master);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::RecoveryTimeout),
        }
    }

    /// Resolve with the new master DB once it is healthy and available for
    /// writes: the master has moved off the old keeper and every synchronous
    /// standby reports healthy.
    pub(crate) async fn notify_recovered(&self, old_master: &Db) -> Result<Db> {
        let logger = self.logger.new(o!("key" => self.opt.clusterdata_key.clone()));
        info!(logger, "waiting for stolon to report master change");

        let token = CancellationToken::new();
        let _stop_watch = token.clone().drop_guard();

        let kvs = self.store.watch(
            token,
            StreamOptions::new(vec![self.opt.clusterdata_key.clone()]),
        );
        let mut kvs = revision_filter(logger.clone(), kvs);

        while let Some(record) = kvs.recv().await {
            if record.key != self.opt.clusterdata_key {
                continue;
            }

            let clusterdata = match Clusterdata::parse(&record.value) {
                Ok(clusterdata) => clusterdata,
                Err(err) => {
                    warn!(logger, "failed to parse clusterdata update"; "error" => %err);
                    continue;
                }
            };

            let Some(master) = clusterdata.master() else {
                warn!(logger, "clusterdata names no master keeper"; "revision" => record.revision);
                continue;
            };

            if master.keeper_uid == old_master.keeper_uid {
                info!(logger, "master has not changed nodes";
                    "event" => "pending_failover", "master" => %master);
                continue;
            }

            if !master.healthy() {
                info!(logger, "new master is unhealthy";
                    "event" => "master.unhealthy", "master" => %master);
                continue;
            }

            let mut any_unhealthy_standbys = false;
            for standby in clusterdata.synchronous_standbys() {
                if !standby.healthy() {
                    info!(logger, "synchronous standby is unhealthy";
                        "event" => "standby.unhealthy", "standby" => %standby);
                    any_unhealthy_standbys = true;
                }
            }

            if any_unhealthy_standbys {
                continue;
            }

            info!(logger, "master is available for writes"; "event" => "healthy", "master" => %master);
            return Ok(master.clone());
        }

        Err(Error::Internal("clusterdata stream closed".to_string()))
    }
}

/// Adapt a method on the shared orchestrator into a pipeline action.
fn step<F, Fut>(failover: &Arc<Failover>, action: F) -> impl Fn() -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<Failover>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let failover = Arc::clone(failover);
    move || action(Arc::clone(&failover))
}
