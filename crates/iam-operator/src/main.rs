//! IAM Kubernetes Operator
//!
//! Watches ServiceRole custom resources and keeps an owned, labeled
//! ServiceAccount in place for each of them.

use anyhow::{Context, Result};
use clap::Parser;
use iam_operator::controller::{run_controller, ControllerConfig};
use iam_operator::crd::ServiceRole;
use iam_operator::health::{self, Readiness};
use iam_operator::rbac::cluster_role;
use kube::{Client, CustomResourceExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, Level};

/// IAM Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "iam-operator")]
#[command(about = "Kubernetes operator that binds ServiceRoles to ServiceAccounts")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address, serving /healthz and /readyz
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Maximum number of concurrent reconciles
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value = "4")]
    concurrency: u16,

    /// Deadline for a single reconcile, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value = "30")]
    reconcile_timeout: u64,

    /// Requeue interval after a successful reconcile, in seconds (0 disables)
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value = "0")]
    resync_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print the ServiceRole CRD YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// Print the ClusterRole YAML the operator needs and exit
    #[arg(long)]
    print_rbac: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: if self.namespace.is_empty() {
                None
            } else {
                Some(self.namespace.clone())
            },
            concurrency: self.concurrency,
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout),
            resync_interval: (self.resync_interval > 0)
                .then(|| Duration::from_secs(self.resync_interval)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd || args.print_rbac {
        print!("{}", render_manifests(args.print_crd, args.print_rbac)?);
        return Ok(());
    }

    init_logging(args.log_level, args.log_json);

    let config = args.controller_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting IAM Kubernetes Operator"
    );

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(address = %args.metrics_addr, "Serving metrics");

    let readiness = Readiness::new();
    let probes = TcpListener::bind(args.health_addr)
        .await
        .with_context(|| format!("Failed to bind health probes on {}", args.health_addr))?;
    info!(address = %args.health_addr, "Serving health probes");
    tokio::spawn({
        let readiness = readiness.clone();
        async move {
            if let Err(e) = health::serve(probes, readiness).await {
                error!(error = %e, "Health probe server stopped");
            }
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    run_controller(client, config, readiness)
        .await
        .context("Controller failed")
}

/// Install the global tracing subscriber
fn init_logging(level: Level, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if json {
        builder.json().with_current_span(true).init();
    } else {
        builder.compact().init();
    }
}

/// Installation manifests as a multi-document YAML stream
fn render_manifests(crd: bool, rbac: bool) -> Result<String> {
    let mut documents = Vec::new();
    if crd {
        let crd = serde_yaml::to_string(&ServiceRole::crd()).context("Failed to render CRD")?;
        documents.push(crd);
    }
    if rbac {
        let role =
            serde_yaml::to_string(&cluster_role()).context("Failed to render ClusterRole")?;
        documents.push(role);
    }
    Ok(documents.join("---\n"))
}
