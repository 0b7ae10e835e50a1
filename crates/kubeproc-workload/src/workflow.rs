//! Argo Workflow serialization types and manifest building
//!
//! Typed subset of `argoproj.io/v1alpha1` Workflow. Only the fields this
//! engine reads or writes are modeled; everything else is ignored on read.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use kubeproc_common::{Error, Result};

use crate::manifest::{Bookkeeping, JOB_TTL_SECONDS};
use crate::policy::AllowList;

/// Label Argo sets on every pod of a workflow
pub const WORKFLOW_LABEL: &str = "workflows.argoproj.io/workflow";
/// Label Argo keeps in sync with the workflow phase
pub const PHASE_LABEL: &str = "workflows.argoproj.io/phase";

/// Workflow spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Workflow",
    plural = "workflows",
    namespaced,
    status = "WorkflowStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_template_ref: Option<WorkflowTemplateRef>,

    #[serde(default)]
    pub arguments: Arguments,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_strategy: Option<TtlStrategy>,
}

/// Reference to a WorkflowTemplate in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkflowTemplateRef {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Arguments {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TtlStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_completion: Option<i32>,
}

/// Workflow status as reported by the Argo controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Empty, Pending, Running, Succeeded, Failed or Error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Completed over total nodes, e.g. "1/2"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

impl WorkflowStatus {
    /// Node progress as a percentage, if reported
    pub fn progress_percent(&self) -> Option<u8> {
        let (done, total) = self.progress.as_deref()?.split_once('/')?;
        let done: u64 = done.trim().parse().ok()?;
        let total: u64 = total.trim().parse().ok()?;
        if total == 0 {
            return None;
        }
        Some((done.min(total) * 100 / total) as u8)
    }
}

impl Workflow {
    /// Request parameters as recorded in the workflow arguments
    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.spec
            .arguments
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.clone().unwrap_or_default()))
            .collect()
    }
}

/// Deployment configuration of the workflow backend
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WorkflowConfig {
    /// Templates a process may reference
    pub allowed_templates_regex: String,
    /// Process id → WorkflowTemplate name
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Template for processes without an explicit mapping
    #[serde(default)]
    pub default_template: Option<String>,
    /// Retention of finished workflows
    #[serde(default = "default_ttl")]
    pub ttl_seconds_after_completion: i32,
}

fn default_ttl() -> i32 {
    JOB_TTL_SECONDS
}

/// Compiled [`WorkflowConfig`]
#[derive(Clone, Debug)]
pub struct WorkflowTemplates {
    config: WorkflowConfig,
    allowed: AllowList,
}

impl WorkflowTemplates {
    /// Compile the template allow-list
    pub fn new(config: WorkflowConfig) -> Result<Self> {
        let allowed = AllowList::new(&config.allowed_templates_regex)?;
        Ok(Self { config, allowed })
    }

    /// Retention of finished workflows
    pub fn ttl_seconds(&self) -> i32 {
        self.config.ttl_seconds_after_completion
    }

    /// Template for a process, checked against the allow-list
    pub fn resolve(&self, process_id: &str) -> Result<&str> {
        let template = self
            .config
            .templates
            .get(process_id)
            .or(self.config.default_template.as_ref())
            .ok_or_else(|| {
                Error::client_field(
                    "process_id",
                    format!("no workflow template for process {:?}", process_id),
                )
            })?;
        self.allowed.check("workflow_template", template)?;
        Ok(template)
    }
}

/// Build a Workflow referencing a template.
///
/// Argo retries nothing unless the template asks for it; no retry strategy is
/// set here.
pub fn build_workflow(
    template: &str,
    parameters: &BTreeMap<String, String>,
    bookkeeping: &Bookkeeping,
    ttl_seconds: i32,
) -> Result<Workflow> {
    let spec = WorkflowSpec {
        workflow_template_ref: Some(WorkflowTemplateRef {
            name: template.to_string(),
        }),
        arguments: Arguments {
            parameters: parameters
                .iter()
                .map(|(name, value)| Parameter {
                    name: name.clone(),
                    value: Some(value.clone()),
                })
                .collect(),
        },
        ttl_strategy: Some(TtlStrategy {
            seconds_after_completion: Some(ttl_seconds),
        }),
    };

    Ok(Workflow {
        metadata: ObjectMeta {
            name: Some(bookkeeping.job_name()),
            annotations: Some(bookkeeping.annotations()?),
            ..Default::default()
        },
        spec,
        status: None,
    })
}
