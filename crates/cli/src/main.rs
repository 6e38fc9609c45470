use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_controller::{AnnotationLabelPolicy, Controller, ControllerConfig, Policy};
use vigil_kubehub::Target;
use vigil_store::{spawn_ingest, SyncWait};

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Level-triggered annotation-to-label controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct WatchArgs {
    /// GVK key of the watched kind, e.g. "apps/v1/Deployment" or "v1/ConfigMap"
    #[arg(long, env = "VIGIL_GVK", default_value = "apps/v1/Deployment")]
    gvk: String,
    /// Restrict to one namespace (default: all namespaces)
    #[arg(long = "ns", env = "VIGIL_NAMESPACE")]
    namespace: Option<String>,
    /// Seconds to wait for the initial listing before giving up
    #[arg(long, env = "VIGIL_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,
    /// Delta channel capacity between watcher and cache
    #[arg(long, env = "VIGIL_QUEUE_CAP", default_value_t = 2048)]
    queue_cap: usize,
}

#[derive(Args, Debug, Clone)]
struct PolicyArgs {
    /// Annotation that opts an object in
    #[arg(long, env = "VIGIL_TRIGGER_ANNOTATION", default_value = "add-deployment-name-label")]
    trigger_annotation: String,
    /// Annotation value that opts an object in (exact match)
    #[arg(long, env = "VIGIL_TRIGGER_VALUE", default_value = "True")]
    trigger_value: String,
    /// Label set to the object's name
    #[arg(long, env = "VIGIL_LABEL_KEY", default_value = "deployment-name")]
    label_key: String,
}

impl PolicyArgs {
    fn policy(&self) -> AnnotationLabelPolicy {
        AnnotationLabelPolicy {
            trigger_annotation: self.trigger_annotation.clone(),
            trigger_value: self.trigger_value.clone(),
            label_key: self.label_key.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        #[command(flatten)]
        watch: WatchArgs,
        #[command(flatten)]
        policy: PolicyArgs,
        /// Concurrent workers
        #[arg(long, env = "VIGIL_WORKERS", default_value_t = 2)]
        workers: usize,
        /// Seconds to let in-flight syncs finish after a shutdown signal
        #[arg(long, env = "VIGIL_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
        shutdown_grace_secs: u64,
        /// Re-check every cached object this often (0 = never)
        #[arg(long, env = "VIGIL_RESYNC_SECS", default_value_t = 0)]
        resync_secs: u64,
    },
    /// List once and report which objects the policy would correct (no writes)
    Plan {
        #[command(flatten)]
        watch: WatchArgs,
        #[command(flatten)]
        policy: PolicyArgs,
        /// Output format
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Ctrl-C received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Ctrl-C received");
    }
}

async fn run(watch: WatchArgs, policy: PolicyArgs, workers: usize, shutdown_grace_secs: u64, resync_secs: u64) -> Result<()> {
    let client = vigil_kubehub::client().await?;
    let target = Target::resolve(client, &watch.gvk, watch.namespace.as_deref()).await?;
    let resync = (resync_secs > 0).then(|| Duration::from_secs(resync_secs));
    let (delta_tx, cache, notifications) = spawn_ingest(watch.queue_cap, resync);

    let config = ControllerConfig {
        name: target.resource.kind.to_lowercase(),
        workers,
        sync_timeout: Duration::from_secs(watch.sync_timeout_secs),
        shutdown_grace: Duration::from_secs(shutdown_grace_secs),
    };
    info!(gvk = %watch.gvk, ns = ?target.namespace, workers, "controller configured");
    let controller = Controller::new(config, cache, notifications, Arc::new(target.writer()), Arc::new(policy.policy()));

    let source = {
        let target = target.clone();
        async move {
            if let Err(e) = vigil_kubehub::start_watcher(&target, delta_tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });
    controller.run(source, cancel).await?;
    Ok(())
}

async fn plan(watch: WatchArgs, policy: PolicyArgs, output: Output) -> Result<()> {
    let client = vigil_kubehub::client().await?;
    let target = Target::resolve(client, &watch.gvk, watch.namespace.as_deref()).await?;
    let (delta_tx, cache, _notifications) = spawn_ingest(watch.queue_cap, None);
    let watcher_handle = tokio::spawn({
        let target = target.clone();
        async move {
            if let Err(e) = vigil_kubehub::start_watcher(&target, delta_tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });
    let waited = cache.wait_for_sync(Duration::from_secs(watch.sync_timeout_secs)).await;
    watcher_handle.abort();
    match waited {
        SyncWait::Synced => {}
        SyncWait::TimedOut => bail!("cache did not sync within {}s", watch.sync_timeout_secs),
        SyncWait::Closed => bail!("watch ended before the initial listing completed"),
    }

    let policy = policy.policy();
    #[derive(serde::Serialize)]
    struct Row { key: String, correction: Option<String> }
    let rows: Vec<Row> = cache
        .list()
        .iter()
        .map(|o| Row { key: o.key().to_string(), correction: policy.plan(o).map(|c| c.to_string()) })
        .collect();

    match output {
        Output::Human => {
            println!("{:<48} ACTION", "NAMESPACE/NAME");
            for r in &rows {
                println!("{:<48} {}", r.key, r.correction.as_deref().unwrap_or("-"));
            }
            let pending = rows.iter().filter(|r| r.correction.is_some()).count();
            println!("{} object(s), {} need correction", rows.len(), pending);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { watch, policy, workers, shutdown_grace_secs, resync_secs } => {
            run(watch, policy, workers, shutdown_grace_secs, resync_secs).await
        }
        Commands::Plan { watch, policy, output } => plan(watch, policy, output).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["vigilctl", "run"]).unwrap();
        match cli.command {
            Commands::Run { watch, policy, workers, .. } => {
                assert_eq!(watch.gvk, "apps/v1/Deployment");
                assert_eq!(workers, 2);
                assert_eq!(policy.policy(), AnnotationLabelPolicy::default());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
