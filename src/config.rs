//! Deployment configuration
//!
//! One YAML file selects the workload backend and configures it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kubeproc_manager::notify::DEFAULT_NOTIFICATION_INTERVAL;
use kubeproc_manager::DEFAULT_POLL_INTERVAL;
use kubeproc_workload::{ProcessConfig, WorkflowConfig};

/// Workload kind jobs run as
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Batch Jobs built from `process`
    #[default]
    Job,
    /// Argo Workflows referencing templates from `workflow`
    Workflow,
}

/// Contents of the configuration file
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ManagerConfig {
    /// Workload kind; batch Jobs unless set
    #[serde(default)]
    pub backend: BackendKind,

    /// Namespace override; the client default otherwise
    #[serde(default)]
    pub namespace: Option<String>,

    /// Seconds between notification cycles
    #[serde(default = "default_notification_interval_secs")]
    pub notification_interval_secs: u64,

    /// Seconds between status polls of a synchronous run
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Required for the job backend
    #[serde(default)]
    pub process: Option<ProcessConfig>,

    /// Required for the workflow backend
    #[serde(default)]
    pub workflow: Option<WorkflowConfig>,
}

fn default_notification_interval_secs() -> u64 {
    DEFAULT_NOTIFICATION_INTERVAL.as_secs()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

impl ManagerConfig {
    /// Parse and check a configuration document
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
        match config.backend {
            BackendKind::Job if config.process.is_none() => {
                anyhow::bail!("backend 'job' requires a 'process' section")
            }
            BackendKind::Workflow if config.workflow.is_none() => {
                anyhow::bail!("backend 'workflow' requires a 'workflow' section")
            }
            _ => {}
        }
        if config.poll_interval_secs == 0 || config.notification_interval_secs == 0 {
            anyhow::bail!("intervals must be at least one second");
        }
        Ok(config)
    }

    /// Read the configuration file
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Interval between notification cycles
    pub fn notification_interval(&self) -> Duration {
        Duration::from_secs(self.notification_interval_secs)
    }

    /// Interval between status polls of a synchronous run
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
