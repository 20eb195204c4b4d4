//! Trellis - multi-cluster service mesh policy engine

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kube::{CustomResourceExt, ResourceExt};
use tracing::{error, info};
use uuid::Uuid;

use trellis_applier::run_pass;
use trellis_common::crd::{
    AccessPolicy, Destination, FailoverService, KubernetesCluster, Mesh, TrafficPolicy,
    VirtualMesh, Workload,
};
use trellis_common::telemetry::{init_logging, LoggingConfig};
use trellis_common::InputSnapshot;
use trellis_operator::{
    dump, load_files, EngineConfig, KubeClusterWriter, OutputSyncer, SyncError,
};
use trellis_translator::{OutputSnapshot, Translator};

/// Trellis - validate mesh policies and translate them for Istio, SMI and App Mesh
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: EngineConfig,

    /// Log filter directives, overriding RUST_LOG
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one pass over snapshot files and print statuses and outputs as YAML
    Translate {
        /// Multi-document YAML files holding the input records
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run one pass and write the outputs to every cluster
    Sync {
        /// Multi-document YAML files holding the input records
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Kubeconfig holding one context per cluster
        #[arg(long, env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
    },

    /// Print the CRD manifests and exit
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Cluster clients need a process-wide TLS provider.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_logging(LoggingConfig {
        format: cli.config.log_format,
        filter: cli.log_filter.clone(),
    })?;
    cli.config.validate()?;

    match cli.command {
        Commands::Translate { files } => {
            let (snapshot, outputs) = run(&cli.config, &files).await?;
            print!("{}", dump(&snapshot, &outputs)?);
        }
        Commands::Sync { files, kubeconfig } => {
            let (snapshot, outputs) = run(&cli.config, &files).await?;
            sync(&cli.config, &snapshot, &outputs, kubeconfig).await?;
        }
        Commands::Crds => print_crds()?,
    }
    Ok(())
}

async fn run(
    config: &EngineConfig,
    files: &[PathBuf],
) -> anyhow::Result<(InputSnapshot, OutputSnapshot)> {
    let mut snapshot = load_files(files).await?;
    config.apply_cluster_defaults(&mut snapshot);
    info!(records = snapshot.total_count(), "snapshot loaded");

    let translator = Translator::with_default_decorators(config.instance_id.clone());
    let outcome = run_pass(&mut snapshot, &translator, Uuid::new_v4());
    Ok((snapshot, outcome.outputs))
}

async fn sync(
    config: &EngineConfig,
    snapshot: &InputSnapshot,
    outputs: &OutputSnapshot,
    kubeconfig: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut clusters: BTreeSet<String> = snapshot.clusters.iter().map(|c| c.name_any()).collect();
    clusters.insert(String::new());
    let mut targets = clusters.clone();
    targets.extend(outputs.clusters());

    let writer = KubeClusterWriter::connect(
        &targets,
        |cluster| config.context_for(cluster).to_string(),
        kubeconfig,
    )
    .await?;
    match OutputSyncer::new(writer).sync(outputs, &clusters).await {
        Ok(report) => {
            info!(applied = report.applied, deleted = report.deleted, "sync complete");
            Ok(())
        }
        Err(SyncError::Partial { failures }) => {
            for failure in &failures {
                error!(%failure, "sync operation failed");
            }
            anyhow::bail!("{} cluster operations failed", failures.len())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        TrafficPolicy::crd(),
        AccessPolicy::crd(),
        VirtualMesh::crd(),
        FailoverService::crd(),
        Destination::crd(),
        Mesh::crd(),
        Workload::crd(),
        KubernetesCluster::crd(),
    ];
    let mut documents = Vec::with_capacity(crds.len());
    for crd in &crds {
        documents.push(
            serde_yaml::to_string(crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?,
        );
    }
    print!("{}", documents.join("---\n"));
    Ok(())
}
