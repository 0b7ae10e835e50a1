//! kubeproc - run process executions as Kubernetes Jobs or Argo Workflows

mod config;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kubeproc_common::kube_utils::{create_client, resolve_namespace};
use kubeproc_common::telemetry::{init_telemetry, TelemetryConfig};
use kubeproc_common::{JobStatus, Subscriber};
use kubeproc_manager::{
    HttpWebhookSender, JobBackend, JobManager, KubeClient, KubeClientImpl, ListOptions,
    NotificationDispatcher, SubmitRequest, WorkflowBackend, WorkloadBackend,
};
use kubeproc_workload::{ContainerProcess, WorkflowTemplates};

use crate::config::{BackendKind, ManagerConfig};

/// kubeproc - job lifecycle engine for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kubeproc", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "KUBEPROC_CONFIG")]
    config: PathBuf,

    /// Path to a kubeconfig; inferred if absent
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Namespace override
    #[arg(long)]
    namespace: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deliver completion callbacks until interrupted
    Serve,

    /// Submit a job and print its accepted descriptor
    Submit(SubmitArgs),

    /// Print the status of a job
    Status {
        /// Job identifier
        job_id: String,
    },

    /// List jobs, most recent first
    List {
        /// Jobs to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Page size
        #[arg(long)]
        limit: Option<usize>,

        /// Only jobs with this status
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
    },

    /// Delete a job, its pods and its result artifact
    Delete {
        /// Job identifier
        job_id: String,
    },

    /// Submit a job and wait until it finishes
    Run(SubmitArgs),

    /// Print the result location of a successful job
    #[command(name = "result")]
    JobResult {
        /// Job identifier
        job_id: String,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Process to run
    process_id: String,

    /// Job identifier; generated if absent
    #[arg(long)]
    job_id: Option<String>,

    /// Request parameter as key=value, repeatable
    #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,

    /// Callback for successful completion
    #[arg(long)]
    success_uri: Option<String>,

    /// Callback for failure
    #[arg(long)]
    failed_uri: Option<String>,
}

impl SubmitArgs {
    fn into_request(self) -> SubmitRequest {
        let subscriber = (self.success_uri.is_some() || self.failed_uri.is_some()).then(|| {
            Subscriber {
                success_uri: self.success_uri,
                failed_uri: self.failed_uri,
            }
        });
        SubmitRequest {
            process_id: self.process_id,
            job_id: self.job_id,
            parameters: self.params.into_iter().collect::<BTreeMap<_, _>>(),
            subscriber,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    if key.is_empty() {
        return Err(format!("empty key in {:?}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::parse(s)
        .ok_or_else(|| format!("unknown status {:?}, expected accepted, running, successful or failed", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    let config = ManagerConfig::load(&cli.config).await?;
    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let namespace = resolve_namespace(
        &client,
        cli.namespace.as_deref().or(config.namespace.as_deref()),
    );
    info!(namespace = %namespace, backend = ?config.backend, "kubeproc starting");
    let kube: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(client, namespace));

    match config.backend {
        BackendKind::Job => {
            let process = config
                .process
                .clone()
                .ok_or_else(|| anyhow::anyhow!("backend 'job' requires a 'process' section"))?;
            let backend = JobBackend::new(kube, ContainerProcess::new(process)?);
            run(backend, cli.command, &config).await
        }
        BackendKind::Workflow => {
            let workflow = config
                .workflow
                .clone()
                .ok_or_else(|| anyhow::anyhow!("backend 'workflow' requires a 'workflow' section"))?;
            let backend = WorkflowBackend::new(kube, WorkflowTemplates::new(workflow)?);
            run(backend, cli.command, &config).await
        }
    }
}

async fn run<B: WorkloadBackend>(
    backend: B,
    command: Commands,
    config: &ManagerConfig,
) -> anyhow::Result<()> {
    let manager = JobManager::new(backend).with_poll_interval(config.poll_interval());

    match command {
        Commands::Serve => serve(manager, config).await,
        Commands::Submit(args) => print_json(&manager.submit(args.into_request()).await?),
        Commands::Status { job_id } => print_json(&manager.get_status(&job_id).await?),
        Commands::List {
            offset,
            limit,
            status,
        } => print_json(
            &manager
                .list(ListOptions {
                    offset,
                    limit,
                    status,
                })
                .await?,
        ),
        Commands::Delete { job_id } => {
            if !manager.delete(&job_id).await? {
                anyhow::bail!("job {} not found", job_id);
            }
            println!("deleted {}", job_id);
            Ok(())
        }
        Commands::Run(args) => print_json(&manager.execute_sync(args.into_request()).await?),
        Commands::JobResult { job_id } => match manager.result(&job_id).await? {
            Some(location) => {
                println!("{}", location);
                Ok(())
            }
            None => anyhow::bail!("job {} has no result", job_id),
        },
    }
}

async fn serve<B: WorkloadBackend>(
    manager: JobManager<B>,
    config: &ManagerConfig,
) -> anyhow::Result<()> {
    let sender = Arc::new(HttpWebhookSender::new()?);
    let handle = NotificationDispatcher::spawn(
        Arc::new(manager),
        sender,
        config.notification_interval(),
        CancellationToken::new(),
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    handle.shutdown().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
