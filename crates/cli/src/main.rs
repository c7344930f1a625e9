use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use skiff_controller::{Controller, ControllerConfig, ControllerHandle, MirrorReconciler};
use skiff_core::ResourceSnapshot;
use skiff_kubehub::WatchScope;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Skiff deployment controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app=web,tier!=cache"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Field selector, e.g. "metadata.name=web"
    #[arg(long = "field-selector", global = true)]
    field_selector: Option<String>,

    /// Concurrent workers (overrides SKIFF_WORKERS)
    #[arg(long = "workers", global = true)]
    workers: Option<usize>,

    /// Seconds to wait for the initial list (overrides SKIFF_SYNC_TIMEOUT_SECS)
    #[arg(long = "sync-timeout", global = true)]
    sync_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile Deployments until Ctrl-C
    Run {
        /// Seconds between progress lines
        #[arg(long = "report-every", default_value_t = 30)]
        report_every: u64,
    },
    /// Sync once and list Deployments
    Ls,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SKIFF_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics when `SKIFF_METRICS_ADDR` names a listen address.
fn init_metrics() {
    let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") else { return };
    let sock = match addr.parse::<SocketAddr>() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %addr, error = %e, "ignoring SKIFF_METRICS_ADDR; expected host:port");
            return;
        }
    };
    if let Err(e) = PrometheusBuilder::new().with_http_listener(sock).install() {
        warn!(error = %e, "failed to install metrics exporter");
    } else {
        info!(%sock, "serving metrics");
    }
}

impl Cli {
    fn scope(&self) -> WatchScope {
        WatchScope {
            namespace: self.namespace.clone(),
            label_selector: self.selector.clone(),
            field_selector: self.field_selector.clone(),
        }
    }

    fn config(&self) -> ControllerConfig {
        let mut cfg = ControllerConfig::from_env();
        if let Some(w) = self.workers { cfg.workers = w.max(1); }
        if let Some(s) = self.sync_timeout { cfg.sync_timeout = Duration::from_secs(s); }
        cfg
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let client = kube::Client::try_default().await.context("building kube client from the current context")?;

    let mirror = Arc::new(MirrorReconciler::<Deployment>::new());
    let controller = Controller::<Deployment>::new("deployments", cli.config(), mirror.clone());
    let handle = controller.handle();
    let shutdown = CancellationToken::new();
    info!(scope = ?cli.scope(), "starting deployment controller");
    let mut task = tokio::spawn(controller.run_with_client(client, cli.scope(), shutdown.clone()));

    match cli.command {
        Commands::Run { report_every } => {
            let mut tick = tokio::time::interval(Duration::from_secs(report_every.max(1)));
            tick.tick().await;
            loop {
                tokio::select! {
                    res = &mut task => {
                        res.context("controller task panicked")??;
                        warn!("controller stopped on its own");
                        return Ok(());
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        metrics::gauge!("skiff_mirrored_objects", mirror.len() as f64);
                        info!(
                            synced = handle.has_synced(),
                            cached = handle.view().len(),
                            reconciled = mirror.len(),
                            pending = handle.pending(),
                            "controller progress"
                        );
                    }
                }
            }
        }
        Commands::Ls => {
            tokio::select! {
                synced = handle.wait_synced() => {
                    if !synced {
                        bail!("watcher stopped before the initial list arrived");
                    }
                }
                res = &mut task => {
                    res.context("controller task panicked")??;
                    bail!("controller exited before cache sync");
                }
            }
            print_deployments(&handle, cli.output)?;
        }
    }

    shutdown.cancel();
    if let Err(e) = task.await.context("controller task panicked")? {
        error!(error = %e, "controller failed");
        return Err(e.into());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct Row {
    namespace: Option<String>,
    name: String,
    ready: i32,
    desired: i32,
    /// Seconds since creation, unknown when the object carries no timestamp.
    age_secs: Option<u64>,
}

impl Row {
    fn from_snapshot(snap: &ResourceSnapshot<Deployment>, now: i64) -> Self {
        let d = &snap.object;
        Self {
            namespace: snap.key.namespace().map(str::to_string),
            name: snap.key.name().to_string(),
            ready: d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
            desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            age_secs: (snap.creation_ts > 0).then(|| now.saturating_sub(snap.creation_ts).max(0) as u64),
        }
    }

    /// Two most significant units for days and hours (`3d4h`, `2h5m`), one below that.
    fn age(&self) -> String {
        const UNITS: [(u64, char); 4] = [(86_400, 'd'), (3_600, 'h'), (60, 'm'), (1, 's')];
        let Some(secs) = self.age_secs else { return "-".to_string() };
        let i = UNITS.iter().position(|(size, _)| secs >= *size).unwrap_or(UNITS.len() - 1);
        let (size, unit) = UNITS[i];
        match UNITS.get(i + 1) {
            Some((next, next_unit)) if i < 2 => format!("{}{unit}{}{next_unit}", secs / size, secs % size / next),
            _ => format!("{}{unit}", secs / size),
        }
    }
}

fn print_deployments(handle: &ControllerHandle<Deployment>, output: Output) -> Result<()> {
    let view = handle.view();
    let now = Utc::now().timestamp();
    // views iterate in key order
    let rows: Vec<Row> = view.iter().map(|(_, snap)| Row::from_snapshot(snap, now)).collect();
    match output {
        Output::Human => {
            println!("{:<20} {:<32} {:<8} AGE", "NAMESPACE", "NAME", "READY");
            for r in &rows {
                let ready = format!("{}/{}", r.ready, r.desired);
                println!("{:<20} {:<32} {:<8} {}", r.namespace.as_deref().unwrap_or("-"), r.name, ready, r.age());
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["skiffctl", "ls", "--ns", "prod", "-l", "app=web", "-o", "json", "--workers", "0"]).unwrap();
        assert!(matches!(cli.command, Commands::Ls));
        assert_eq!(cli.output, Output::Json);
        let scope = cli.scope();
        assert_eq!(scope.namespace.as_deref(), Some("prod"));
        assert_eq!(scope.label_selector.as_deref(), Some("app=web"));
        assert_eq!(scope.field_selector, None);
        assert_eq!(cli.config().workers, 1);
    }

    #[test]
    fn rows_report_ready_over_desired() {
        let d: Deployment = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web", "namespace": "prod" },
            "spec": { "replicas": 3, "selector": {}, "template": {} },
            "status": { "readyReplicas": 2 },
        }))
        .unwrap();
        let mut snap = ResourceSnapshot::new("prod/web".parse().unwrap(), d);
        let row = Row::from_snapshot(&snap, 1_000);
        assert_eq!((row.namespace.as_deref(), row.name.as_str(), row.ready, row.desired), (Some("prod"), "web", 2, 3));
        assert_eq!(row.age(), "-");

        snap.creation_ts = 400;
        assert_eq!(Row::from_snapshot(&snap, 1_000).age_secs, Some(600));
    }

    #[test]
    fn ages_render_coarsely() {
        let age = |secs| Row { namespace: None, name: String::new(), ready: 0, desired: 0, age_secs: Some(secs) }.age();
        assert_eq!(age(0), "0s");
        assert_eq!(age(42), "42s");
        assert_eq!(age(300), "5m");
        assert_eq!(age(7_500), "2h5m");
        assert_eq!(age(90_000), "1d1h");
    }
}
