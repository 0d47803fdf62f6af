use slog::{o, Logger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stolon_pgbouncer::error::{Error, Result};
use stolon_pgbouncer::etcd::{Locker, StreamOptions};
use stolon_pgbouncer::failover::{ClusterStore, Failover, FailoverClient};
use stolon_pgbouncer::proto::health_check_response::Status as HealthStatus;
use stolon_pgbouncer::proto::{HealthCheckResponse, PauseRequest, PauseResponse, ResumeResponse};
use stolon_pgbouncer::stolon::KeeperControl;
use stolon_pgbouncer::streams::KvRecord;
use stolon_pgbouncer::FailoverOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CLUSTERDATA_KEY: &str = "stolon/cluster/main/clusterdata";

type Trace = Arc<Mutex<Vec<String>>>;

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn record(trace: &Trace, entry: impl Into<String>) {
    trace.lock().unwrap().push(entry.into());
}

fn clusterdata_json(master_uid: &str, master_healthy: bool, standbys: &[(&str, bool)]) -> Vec<u8> {
    let standbys: Vec<serde_json::Value> = standbys
        .iter()
        .map(|(uid, healthy)| {
            serde_json::json!({"keeper_uid": uid, "status": {"healthy": healthy}})
        })
        .collect();

    serde_json::json!({
        "cluster": {
            "master": {"keeper_uid": master_uid, "status": {"healthy": master_healthy}},
            "synchronous_standbys": standbys,
        }
    })
    .to_string()
    .into_bytes()
}

fn revision(value: Vec<u8>, revision: i64) -> KvRecord {
    KvRecord {
        key: CLUSTERDATA_KEY.to_string(),
        value,
        revision,
    }
}

struct MockClient {
    endpoint: String,
    trace: Trace,
    healthy: bool,
    fail_pause: bool,
}

impl MockClient {
    fn healthy(endpoint: &str, trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.to_string(),
            trace: trace.clone(),
            healthy: true,
            fail_pause: false,
        })
    }

    fn unhealthy(endpoint: &str, trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.to_string(),
            trace: trace.clone(),
            healthy: false,
            fail_pause: false,
        })
    }

    fn pause_failing(endpoint: &str, trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.to_string(),
            trace: trace.clone(),
            healthy: true,
            fail_pause: true,
        })
    }
}

#[tonic::async_trait]
impl FailoverClient for MockClient {
    async fn health_check(&self) -> Result<HealthCheckResponse> {
        let status = if self.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        Ok(HealthCheckResponse {
            status: status as i32,
            components: vec![],
        })
    }

    async fn pause(&self, _request: PauseRequest) -> Result<PauseResponse> {
        record(&self.trace, format!("pause:{}", self.endpoint));
        if self.fail_pause {
            return Err(Error::PgBouncer("could not acquire console".to_string()));
        }

        Ok(PauseResponse {
            created_at: 0,
            expires_at: 0,
        })
    }

    async fn resume(&self) -> Result<ResumeResponse> {
        record(&self.trace, format!("resume:{}", self.endpoint));
        Ok(ResumeResponse { created_at: 0 })
    }
}

struct MockLocker {
    trace: Trace,
    /// Another session holds the lock; acquisition waits out the deadline
    /// and fails.
    contended: Option<Duration>,
}

#[tonic::async_trait]
impl Locker for MockLocker {
    async fn lock(&self) -> Result<()> {
        if let Some(wait) = self.contended {
            tokio::time::sleep(wait).await;
            return Err(Error::LockUnavailable);
        }

        record(&self.trace, "acquire");
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        record(&self.trace, "release");
        Ok(())
    }
}

struct MockStore {
    initial: Vec<u8>,
    revisions: Vec<KvRecord>,
    observed: Arc<AtomicUsize>,
}

impl MockStore {
    fn new(initial: Vec<u8>, revisions: Vec<KvRecord>) -> Arc<Self> {
        Arc::new(Self {
            initial,
            revisions,
            observed: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[tonic::async_trait]
impl ClusterStore for MockStore {
    async fn get(&self, key: &str) -> Result<KvRecord> {
        Ok(KvRecord {
            key: key.to_string(),
            value: self.initial.clone(),
            revision: 1,
        })
    }

    fn watch(&self, token: CancellationToken, _options: StreamOptions) -> mpsc::Receiver<KvRecord> {
        let (tx, rx) = mpsc::channel(16);
        let revisions = self.revisions.clone();
        let observed = self.observed.clone();

        tokio::spawn(async move {
            for kv in revisions {
                if tx.send(kv).await.is_err() {
                    return;
                }
                observed.fetch_add(1, Ordering::SeqCst);
            }

            // Hold the stream open until the consumer goes away, as a real
            // watch would.
            token.cancelled().await;
        });

        rx
    }
}

enum ControlBehavior {
    Succeed,
    Fail,
    Hang,
}

struct MockControl {
    trace: Trace,
    behavior: ControlBehavior,
}

#[tonic::async_trait]
impl KeeperControl for MockControl {
    async fn fail_keeper(&self, keeper_uid: &str) -> Result<()> {
        match self.behavior {
            ControlBehavior::Succeed => {
                record(&self.trace, format!("failkeeper:{keeper_uid}"));
                Ok(())
            }
            ControlBehavior::Fail => {
                record(&self.trace, format!("failkeeper:{keeper_uid}"));
                Err(Error::FailkeeperFailed("exit status 1".to_string()))
            }
            ControlBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

struct Harness {
    trace: Trace,
    failover: Arc<Failover>,
    store: Arc<MockStore>,
}

fn options() -> FailoverOptions {
    FailoverOptions::new(CLUSTERDATA_KEY)
        .with_health_check_timeout(Duration::from_millis(500))
        .with_pause_expiry(Duration::from_secs(5))
        .with_stolonctl_timeout(Duration::from_secs(5))
}

fn harness(
    clients: fn(&Trace) -> Vec<Arc<MockClient>>,
    locker_contended: Option<Duration>,
    behavior: ControlBehavior,
    store: Arc<MockStore>,
    opt: FailoverOptions,
) -> Harness {
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));

    let mut handles: HashMap<String, Arc<dyn FailoverClient>> = HashMap::new();
    for client in clients(&trace) {
        handles.insert(client.endpoint.clone(), client);
    }

    let locker = Arc::new(MockLocker {
        trace: trace.clone(),
        contended: locker_contended,
    });
    let control = Arc::new(MockControl {
        trace: trace.clone(),
        behavior,
    });

    let failover = Failover::new(
        test_logger(),
        store.clone(),
        handles,
        control,
        locker,
        opt,
    );

    Harness {
        trace,
        failover,
        store,
    }
}

fn three_healthy_agents(trace: &Trace) -> Vec<Arc<MockClient>> {
    vec![
        MockClient::healthy("agent-1:8444", trace),
        MockClient::healthy("agent-2:8444", trace),
        MockClient::healthy("agent-3:8444", trace),
    ]
}

fn count_prefix(trace: &Trace, prefix: &str) -> usize {
    trace
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.starts_with(prefix))
        .count()
}

fn index_of(trace: &Trace, entry: &str) -> Option<usize> {
    trace.lock().unwrap().iter().position(|e| e == entry)
}

fn last_index_with_prefix(trace: &Trace, prefix: &str) -> Option<usize> {
    trace
        .lock()
        .unwrap()
        .iter()
        .rposition(|e| e.starts_with(prefix))
}

async fn run(harness: &Harness) -> Result<()> {
    let exec = CancellationToken::new();
    let defer = CancellationToken::new();
    harness.failover.run(&exec, &defer).await
}

#[tokio::test]
async fn test_successful_failover() {
    let store = MockStore::new(
        clusterdata_json("keeper0", true, &[("keeper1", true)]),
        vec![revision(
            clusterdata_json("keeper1", true, &[("keeper0", true)]),
            2,
        )],
    );
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        store,
        options(),
    );

    run(&harness).await.unwrap();

    let trace = &harness.trace;
    assert_eq!(count_prefix(trace, "pause:"), 3);
    assert_eq!(count_prefix(trace, "resume:"), 3);
    assert!(index_of(trace, "acquire").is_some());
    assert!(index_of(trace, "release").is_some());
    assert!(index_of(trace, "failkeeper:keeper0").is_some());

    // acquire < pause < failkeeper < resume < release
    let acquire = index_of(trace, "acquire").unwrap();
    let failkeeper = index_of(trace, "failkeeper:keeper0").unwrap();
    let release = index_of(trace, "release").unwrap();
    let last_pause = last_index_with_prefix(trace, "pause:").unwrap();
    let last_resume = last_index_with_prefix(trace, "resume:").unwrap();

    assert!(acquire < last_pause);
    assert!(last_pause < failkeeper);
    assert!(failkeeper < last_resume);
    assert!(last_resume < release);
}

#[tokio::test]
async fn test_unhealthy_agent_aborts_before_any_state_change() {
    let store = MockStore::new(clusterdata_json("keeper0", true, &[]), vec![]);
    let harness = harness(
        |trace| {
            vec![
                MockClient::healthy("agent-1:8444", trace),
                MockClient::unhealthy("agent-2:8444", trace),
                MockClient::healthy("agent-3:8444", trace),
            ]
        },
        None,
        ControlBehavior::Succeed,
        store,
        options(),
    );

    let err = run(&harness).await.unwrap_err();

    match err {
        Error::AgentUnhealthy { endpoint, .. } => assert_eq!(endpoint, "agent-2:8444"),
        other => panic!("expected AgentUnhealthy, got {other:?}"),
    }

    let trace = &harness.trace;
    assert!(index_of(trace, "acquire").is_none());
    assert_eq!(count_prefix(trace, "pause:"), 0);
    assert_eq!(count_prefix(trace, "failkeeper:"), 0);
}

#[tokio::test]
async fn test_contended_lock_fails_within_deadline() {
    let store = MockStore::new(clusterdata_json("keeper0", true, &[]), vec![]);
    let harness = harness(
        three_healthy_agents,
        Some(Duration::from_millis(200)),
        ControlBehavior::Succeed,
        store,
        options(),
    );

    let begin = Instant::now();
    let err = run(&harness).await.unwrap_err();

    assert!(matches!(err, Error::LockUnavailable));
    assert!(begin.elapsed() >= Duration::from_millis(200));

    let trace = &harness.trace;
    assert_eq!(count_prefix(trace, "pause:"), 0);
    assert_eq!(count_prefix(trace, "failkeeper:"), 0);
}

#[tokio::test]
async fn test_failkeeper_failure_resumes_and_releases() {
    let store = MockStore::new(clusterdata_json("keeper0", true, &[]), vec![]);
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Fail,
        store,
        options(),
    );

    let err = run(&harness).await.unwrap_err();
    assert!(matches!(err, Error::FailkeeperFailed(_)));

    let trace = &harness.trace;
    assert_eq!(count_prefix(trace, "pause:"), 3);
    assert_eq!(count_prefix(trace, "resume:"), 3);

    // Cleanups drain in reverse registration order: resume before release.
    let last_resume = last_index_with_prefix(trace, "resume:").unwrap();
    let release = index_of(trace, "release").unwrap();
    assert!(last_resume < release);
}

#[tokio::test]
async fn test_recovery_timeout_when_master_never_changes() {
    // The watch only ever reports the old master.
    let store = MockStore::new(
        clusterdata_json("keeper0", true, &[]),
        vec![revision(clusterdata_json("keeper0", true, &[]), 2)],
    );
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        store,
        options().with_pause_expiry(Duration::from_millis(300)),
    );

    let begin = Instant::now();
    let err = run(&harness).await.unwrap_err();

    assert!(matches!(err, Error::RecoveryTimeout));
    assert!(begin.elapsed() >= Duration::from_millis(300));

    let trace = &harness.trace;
    assert_eq!(count_prefix(trace, "resume:"), 3);
    assert!(index_of(trace, "release").is_some());
}

#[tokio::test]
async fn test_recovery_skips_non_qualifying_revisions() {
    let store = MockStore::new(
        clusterdata_json("keeper0", true, &[("keeper1", true)]),
        vec![
            // Master has not moved yet.
            revision(clusterdata_json("keeper0", true, &[("keeper1", true)]), 2),
            // Moved but not yet healthy.
            revision(clusterdata_json("keeper1", false, &[("keeper0", true)]), 3),
            // Healthy master, lagging standby.
            revision(clusterdata_json("keeper1", true, &[("keeper0", false)]), 4),
            // Fully recovered.
            revision(clusterdata_json("keeper1", true, &[("keeper0", true)]), 5),
        ],
    );
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        store,
        options(),
    );

    run(&harness).await.unwrap();

    assert_eq!(harness.store.observed.load(Ordering::SeqCst), 4);
    assert_eq!(count_prefix(&harness.trace, "resume:"), 3);
}

#[tokio::test]
async fn test_undecodable_revisions_are_skipped() {
    let store = MockStore::new(
        clusterdata_json("keeper0", true, &[]),
        vec![
            revision(b"not valid json".to_vec(), 2),
            revision(clusterdata_json("keeper1", true, &[]), 3),
        ],
    );
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        store,
        options(),
    );

    run(&harness).await.unwrap();
}

#[tokio::test]
async fn test_foreign_keys_are_skipped() {
    let mut foreign = revision(clusterdata_json("keeper1", true, &[]), 2);
    foreign.key = "stolon/cluster/other/clusterdata".to_string();

    let store = MockStore::new(
        clusterdata_json("keeper0", true, &[]),
        vec![foreign, revision(clusterdata_json("keeper1", true, &[]), 3)],
    );
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        store,
        options(),
    );

    run(&harness).await.unwrap();
}

#[tokio::test]
async fn test_partial_pause_failure_still_resumes_every_agent() {
    let store = MockStore::new(clusterdata_json("keeper0", true, &[]), vec![]);
    let harness = harness(
        |trace| {
            vec![
                MockClient::healthy("agent-1:8444", trace),
                MockClient::pause_failing("agent-2:8444", trace),
                MockClient::healthy("agent-3:8444", trace),
            ]
        },
        None,
        ControlBehavior::Succeed,
        store,
        options(),
    );

    let err = run(&harness).await.unwrap_err();
    assert!(matches!(err, Error::PauseFailed));

    let trace = &harness.trace;
    // Every agent received the pause call before the step was judged.
    assert_eq!(count_prefix(trace, "pause:"), 3);
    // And every agent is resumed, failed pause included.
    assert_eq!(count_prefix(trace, "resume:"), 3);
    assert_eq!(count_prefix(trace, "failkeeper:"), 0);
    assert!(index_of(trace, "release").is_some());
}

#[tokio::test]
async fn test_operator_abort_still_runs_cleanup() {
    let store = MockStore::new(clusterdata_json("keeper0", true, &[]), vec![]);
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Hang,
        store,
        options().with_stolonctl_timeout(Duration::from_secs(3600)),
    );

    let exec = CancellationToken::new();
    let defer = CancellationToken::new();

    let cancel = exec.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let err = harness.failover.run(&exec, &defer).await.unwrap_err();
    assert!(matches!(err, Error::Aborted));

    let trace = &harness.trace;
    assert_eq!(count_prefix(trace, "resume:"), 3);
    assert!(index_of(trace, "release").is_some());
}

#[tokio::test]
async fn test_two_sequential_failovers_swap_masters() {
    let first_store = MockStore::new(
        clusterdata_json("keeper0", true, &[("keeper1", true)]),
        vec![revision(
            clusterdata_json("keeper1", true, &[("keeper0", true)]),
            2,
        )],
    );
    let first = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        first_store,
        options(),
    );
    run(&first).await.unwrap();
    assert!(index_of(&first.trace, "failkeeper:keeper0").is_some());

    // The second run sees the new master and fails it back over.
    let second_store = MockStore::new(
        clusterdata_json("keeper1", true, &[("keeper0", true)]),
        vec![revision(
            clusterdata_json("keeper0", true, &[("keeper1", true)]),
            2,
        )],
    );
    let second = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        second_store,
        options(),
    );
    run(&second).await.unwrap();
    assert!(index_of(&second.trace, "failkeeper:keeper1").is_some());
}

#[tokio::test]
async fn test_corrupt_initial_snapshot_aborts_failkeeper() {
    // An empty keeper UID means the cluster is not initialised; the
    // subprocess must never run.
    let store = MockStore::new(clusterdata_json("", true, &[]), vec![]);
    let harness = harness(
        three_healthy_agents,
        None,
        ControlBehavior::Succeed,
        store,
        options(),
    );

    let err = run(&harness).await.unwrap_err();
    assert!(matches!(err, Error::InvalidClusterdata(_)));

    let trace = &harness.trace;
    assert_eq!(count_prefix(trace, "failkeeper:"), 0);
    assert_eq!(count_prefix(trace, "resume:"), 3);
}
