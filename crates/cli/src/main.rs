use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfghist_controller::{DiscoveryConfig, DiscoveryLoop, RateLimit, SyncKey, WatchManager, WorkQueue};
use cfghist_core::ResourceMatcher;
use cfghist_gitserver::{ServerConfig, ServerState};
use cfghist_kubehub::{get_kube_client, CrdRegistry, DiscoveryMapper, KubeEventSource};
use cfghist_store::{spawn_writer, GitBackend, HistoryConfig, HistoryStore};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "config-history", version, about = "Records cluster configuration changes in a git repository and serves it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch configuration kinds and commit every change
    Operator {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        operator: OperatorArgs,
    },
    /// Serve the history repository over HTTP (git dumb protocol)
    Gitserver {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Operator and history server in one process
    All {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        operator: OperatorArgs,
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct RepoArgs {
    /// Working tree of the history repository; initialized when missing
    #[arg(long = "repository", env = "REPOSITORY_PATH", default_value = "/repository")]
    repository: PathBuf,
    /// Bound on draining in-flight work at shutdown
    #[arg(long = "shutdown-grace-secs", env = "CFGHIST_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    shutdown_grace_secs: u64,
}

#[derive(Args, Debug, Clone)]
struct OperatorArgs {
    /// CRDs whose name ends with this suffix are tracked
    #[arg(long = "group-suffix", env = "CFGHIST_GROUP_SUFFIX", default_value = ".config.openshift.io")]
    group_suffix: String,
    #[arg(long = "sync-timeout-secs", env = "CFGHIST_SYNC_TIMEOUT_SECS", default_value_t = 5)]
    sync_timeout_secs: u64,
    #[arg(long = "resync-secs", env = "CFGHIST_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,
    #[arg(long = "discovery-timeout-secs", env = "CFGHIST_DISCOVERY_TIMEOUT_SECS", default_value_t = 30)]
    discovery_timeout_secs: u64,
    /// Capacity of the channel feeding the history writer
    #[arg(long = "queue-cap", env = "CFGHIST_QUEUE_CAP", default_value_t = 1024)]
    queue_cap: usize,
    /// E-mail domain of commit identities
    #[arg(long = "commit-domain", env = "CFGHIST_COMMIT_DOMAIN", default_value = "openshift.io")]
    commit_domain: String,
}

#[derive(Args, Debug, Clone)]
struct ServerArgs {
    #[arg(long = "listen", env = "CFGHIST_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Header read and keep-alive idle timeout
    #[arg(long = "header-timeout-secs", env = "CFGHIST_HEADER_TIMEOUT_SECS", default_value_t = 15)]
    header_timeout_secs: u64,
    #[arg(long = "read-timeout-secs", env = "CFGHIST_READ_TIMEOUT_SECS", default_value_t = 5)]
    read_timeout_secs: u64,
    #[arg(long = "write-timeout-secs", env = "CFGHIST_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    write_timeout_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("CFGHIST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CFGHIST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CFGHIST_METRICS_ADDR; expected host:port");
        }
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Cancels `token` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown requested");
        token.cancel();
    });
}

fn open_repository(repo: &RepoArgs) -> Result<GitBackend> {
    let backend = GitBackend::open_or_init(&repo.repository)
        .with_context(|| format!("opening history repository at {}", repo.repository.display()))?;
    info!(path = %repo.repository.display(), "history repository ready");
    Ok(backend)
}

async fn run_operator(backend: GitBackend, repo: &RepoArgs, args: &OperatorArgs, shutdown: CancellationToken) -> Result<()> {
    let grace = secs(repo.shutdown_grace_secs);
    let client = get_kube_client().await?;

    let store = HistoryStore::new(backend, HistoryConfig::with_domain(&args.commit_domain));
    let (sink, writer) = spawn_writer(store, args.queue_cap);

    let queue = WorkQueue::new(RateLimit::default());
    let registry = CrdRegistry::new();
    let crd_watch = {
        let queue = queue.clone();
        registry.spawn(client.clone(), shutdown.child_token(), move || queue.add(SyncKey))
    };
    let resolver = DiscoveryMapper::new(client.clone(), secs(args.discovery_timeout_secs));
    let watches = WatchManager::new(Arc::new(KubeEventSource::new(client)), sink, shutdown.child_token());
    let cfg = DiscoveryConfig { sync_timeout: secs(args.sync_timeout_secs), resync: secs(args.resync_secs) };
    let discovery = DiscoveryLoop::new(
        Arc::new(registry),
        Arc::new(resolver),
        watches,
        ResourceMatcher::new(args.group_suffix.as_str()),
        cfg,
    );

    queue.add(SyncKey);
    let watches = discovery.run(queue, shutdown.clone()).await;

    let _ = crd_watch.await;
    if !watches.shutdown(grace).await {
        warn!("some watches were still running at shutdown");
    }
    if let Err(e) = writer.join(grace).await {
        error!(error = %e, grace_ms = grace.as_millis() as u64, "history writer did not drain; exiting");
        return Err(e).context("draining history writer");
    }
    info!("operator stopped");
    Ok(())
}

async fn run_gitserver(git_dir: PathBuf, args: &ServerArgs, grace: Duration, shutdown: CancellationToken) -> Result<()> {
    let cfg = ServerConfig {
        header_timeout: secs(args.header_timeout_secs),
        read_timeout: secs(args.read_timeout_secs),
        write_timeout: secs(args.write_timeout_secs),
        grace,
    };
    let listener = cfghist_gitserver::bind(args.listen).await?;
    cfghist_gitserver::serve(listener, ServerState::new(git_dir), cfg, shutdown).await?;
    Ok(())
}

/// A failing half takes the other one down with it.
async fn cancel_on_error(fut: impl std::future::Future<Output = Result<()>>, token: CancellationToken) -> Result<()> {
    let res = fut.await;
    if let Err(e) = &res {
        error!(error = ?e, "component failed; shutting down");
        token.cancel();
    }
    res
}

/// Blocking tasks (the history writer) are not cancellable; once the work is
/// over, wait at most this long for them before leaving.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

/// Drive `fut` to completion on a fresh runtime, then tear the runtime down
/// without waiting on stuck blocking tasks.
fn run_to_completion<F>(fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().context("building tokio runtime")?;
    let res = runtime.block_on(fut);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    res
}

async fn run(cli: Cli) -> Result<()> {
    init_metrics();
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Commands::Operator { repo, operator } => {
            let backend = open_repository(&repo)?;
            run_operator(backend, &repo, &operator, shutdown).await
        }
        Commands::Gitserver { repo, server } => {
            let git_dir = open_repository(&repo)?.git_dir().to_path_buf();
            run_gitserver(git_dir, &server, secs(repo.shutdown_grace_secs), shutdown).await
        }
        Commands::All { repo, operator, server } => {
            let backend = open_repository(&repo)?;
            let git_dir = backend.git_dir().to_path_buf();
            let (op, srv) = tokio::join!(
                cancel_on_error(run_operator(backend, &repo, &operator, shutdown.clone()), shutdown.clone()),
                cancel_on_error(run_gitserver(git_dir, &server, secs(repo.shutdown_grace_secs), shutdown.clone()), shutdown.clone()),
            );
            op.and(srv)
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_to_completion(run(cli))
}
