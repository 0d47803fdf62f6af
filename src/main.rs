use clap::{Args, Parser, Subcommand};
use slog::{info, o, Drain, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stolon_pgbouncer::agent::AgentService;
use stolon_pgbouncer::config::{AgentOptions, FailoverOptions};
use stolon_pgbouncer::etcd::{EtcdLock, EtcdStore};
use stolon_pgbouncer::failover::{Failover, FailoverClient, GrpcFailoverClient};
use stolon_pgbouncer::pgbouncer::{AdminConnection, PgBouncer};
use stolon_pgbouncer::stolon::Stolonctl;
use tokio_util::sync::CancellationToken;

/// Zero-downtime failover tooling for stolon PostgreSQL clusters fronted by
/// PgBouncer.
#[derive(Parser, Debug)]
#[command(name = "stolon-pgbouncer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// etcd endpoints, comma separated.
    #[arg(long, global = true, default_value = "127.0.0.1:2379")]
    etcd_endpoints: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an orchestrated failover of the cluster primary.
    Failover(FailoverArgs),
    /// Run the PgBouncer agent daemon.
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct FailoverArgs {
    /// etcd key holding the stolon cluster snapshot.
    #[arg(long)]
    clusterdata_key: String,

    /// Agent endpoints (host:port), comma separated.
    #[arg(long)]
    agents: String,

    /// stolon cluster name, passed through to stolonctl.
    #[arg(long)]
    cluster_name: String,

    /// stolon store backend, passed through to stolonctl.
    #[arg(long, default_value = "etcdv3")]
    store_backend: String,

    #[arg(long, default_value_t = 2_000)]
    health_check_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    lock_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pause_timeout_ms: u64,

    #[arg(long, default_value_t = 25_000)]
    pause_expiry_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    resume_timeout_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    stolonctl_timeout_ms: u64,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Address the agent gRPC service binds to.
    #[arg(long, default_value = "0.0.0.0:8444")]
    bind_address: String,

    /// PgBouncer admin console connection string.
    #[arg(
        long,
        default_value = "host=127.0.0.1 port=6432 user=pgbouncer dbname=pgbouncer"
    )]
    admin_dsn: String,
}

fn root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let logger = root_logger();
    let etcd_endpoints = cli.etcd_endpoints.clone();

    match cli.command {
        Commands::Failover(args) => run_failover(logger, &etcd_endpoints, args).await,
        Commands::Agent(args) => run_agent(logger, args).await,
    }
}

async fn run_failover(
    logger: Logger,
    etcd_endpoints: &str,
    args: FailoverArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let endpoints: Vec<&str> = etcd_endpoints.split(',').map(str::trim).collect();
    let client = etcd_client::Client::connect(&endpoints, None).await?;

    let opt = FailoverOptions::new(&args.clusterdata_key)
        .with_health_check_timeout(Duration::from_millis(args.health_check_timeout_ms))
        .with_lock_timeout(Duration::from_millis(args.lock_timeout_ms))
        .with_pause_timeout(Duration::from_millis(args.pause_timeout_ms))
        .with_pause_expiry(Duration::from_millis(args.pause_expiry_ms))
        .with_resume_timeout(Duration::from_millis(args.resume_timeout_ms))
        .with_stolonctl_timeout(Duration::from_millis(args.stolonctl_timeout_ms));

    let mut clients: HashMap<String, Arc<dyn FailoverClient>> = HashMap::new();
    for endpoint in args.agents.split(',').map(str::trim) {
        let agent = GrpcFailoverClient::connect(endpoint).await?;
        clients.insert(endpoint.to_string(), Arc::new(agent));
    }

    let store = Arc::new(EtcdStore::new(logger.clone(), client.clone()));
    let locker = Arc::new(EtcdLock::new(
        logger.clone(),
        client,
        &args.clusterdata_key,
        Duration::from_millis(args.lock_timeout_ms),
    ));
    let stolonctl = Arc::new(Stolonctl::new(
        args.cluster_name,
        args.store_backend,
        etcd_endpoints.to_string(),
    ));

    let failover = Failover::new(logger.clone(), store, clients, stolonctl, locker, opt);

    // Ctrl-C aborts forward progress; cleanup runs on its own scope so an
    // aborted run still resumes the PgBouncers and releases the lock.
    let exec = CancellationToken::new();
    let defer = CancellationToken::new();
    {
        let exec = exec.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                exec.cancel();
            }
        });
    }

    failover.run(&exec, &defer).await?;
    info!(logger, "failover complete");

    Ok(())
}

async fn run_agent(logger: Logger, args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let opt = AgentOptions::new(args.bind_address, args.admin_dsn);

    let executor = AdminConnection::connect(logger.clone(), &opt.admin_dsn).await?;
    let pgbouncer = Arc::new(PgBouncer::new(logger.clone(), Arc::new(executor)));

    let service = AgentService::new(logger, pgbouncer);
    service.serve(&opt.bind_address).await?;

    Ok(())
}
