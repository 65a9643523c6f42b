use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ekko_controller::{Controller, ControllerConfig};
use ekko_core::KindRegistry;
use ekko_kubehub::KubeStore;
use ekko_schema::{CrdError, CrdManager};

#[derive(Parser, Debug)]
#[command(name = "ekkoctl", version, about = "Ekko echo controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the CRDs and run the controller until SIGINT/SIGTERM
    Run {
        /// Path to a kubeconfig (default: in-cluster or $KUBECONFIG)
        #[arg(long = "kubeconfig", env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
        /// Only watch this namespace (default: all)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Worker count (overrides EKKO_WORKERS)
        #[arg(long = "workers")]
        workers: Option<usize>,
        /// Assume the CRDs are already installed
        #[arg(long = "skip-crds", action = ArgAction::SetTrue)]
        skip_crds: bool,
    },
    /// Print the CustomResourceDefinitions this controller serves
    Crds,
}

fn init_tracing() {
    let env = std::env::var("EKKO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EKKO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EKKO_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let term = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut s) => {
                    s.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            _ = signal::ctrl_c() => info!("SIGINT received"),
            _ = term => info!("SIGTERM received"),
        }
        token.cancel();
    });
}

/// Install the CRDs and wait for them. `Ok(false)` when cancelled first.
async fn install_crds(manager: &CrdManager, cancel: &CancellationToken) -> Result<bool> {
    match manager.ensure_definitions(&ekko_kubehub::crds(), cancel).await {
        Ok(()) => Ok(true),
        Err(CrdError::Cancelled) => Ok(false),
        Err(e) => Err(e).context("ensuring CRDs"),
    }
}

async fn run(kubeconfig: Option<PathBuf>, namespace: Option<String>, workers: Option<usize>, skip_crds: bool) -> Result<()> {
    let mut config = ControllerConfig::from_env();
    config.namespace = namespace;
    if let Some(n) = workers.filter(|n| *n > 0) {
        config.workers = n;
    }
    info!(?config, "configuration");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let client = tokio::select! {
        _ = cancel.cancelled() => {
            info!("cancelled while connecting");
            return Ok(());
        }
        c = ekko_kubehub::get_kube_client(kubeconfig.as_deref()) => c?,
    };
    let store = KubeStore::new(client);

    if skip_crds {
        info!("skipping CRD installation");
    } else if !install_crds(&CrdManager::new(store.definitions()), &cancel).await? {
        info!("cancelled while installing CRDs");
        return Ok(());
    }

    let controller = Controller::new(config, KindRegistry::standard(), store.echoes(), store.children());
    controller.run(cancel).await
}

fn print_crds(output: Output) -> Result<()> {
    let crds = ekko_kubehub::crds();
    match output {
        Output::Human => {
            for crd in &crds {
                let s = ekko_schema::summarize(crd);
                println!("{} • {}/{} • {} • {}", s.name, s.group, s.served_version, s.kind, s.scope.to_lowercase());
                for c in &s.printer_cols {
                    println!("    {:<10} {}", c.name, c.json_path);
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&crds)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { kubeconfig, namespace, workers, skip_crds } => {
            if let Err(e) = run(kubeconfig, namespace, workers, skip_crds).await {
                error!(error = ?e, "controller failed");
                return Err(e);
            }
            info!("clean shutdown");
        }
        Commands::Crds => print_crds(cli.output)?,
    }
    Ok(())
}
