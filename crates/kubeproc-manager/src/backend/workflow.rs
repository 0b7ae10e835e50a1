//! Argo Workflow backend

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use kubeproc_common::annotations::format_annotations;
use kubeproc_common::{JobDescriptor, JobStatus, Result};
use kubeproc_workload::workflow::{PHASE_LABEL, WORKFLOW_LABEL};
use kubeproc_workload::{build_workflow, Bookkeeping, Workflow, WorkflowTemplates};

use super::{Outcome, Submission, WorkloadBackend};
use crate::client::{KubeClient, ListQuery};
use crate::status::{descriptor, workflow_status, Observation};

/// Runs jobs as Workflows referencing pre-installed templates
pub struct WorkflowBackend {
    client: Arc<dyn KubeClient>,
    templates: WorkflowTemplates,
}

impl WorkflowBackend {
    /// Backend resolving processes through `templates`
    pub fn new(client: Arc<dyn KubeClient>, templates: WorkflowTemplates) -> Self {
        Self { client, templates }
    }
}

#[async_trait]
impl WorkloadBackend for WorkflowBackend {
    type Object = Workflow;

    const KIND: &'static str = "Workflow";

    fn client(&self) -> &Arc<dyn KubeClient> {
        &self.client
    }

    async fn create(&self, submission: &Submission) -> Result<()> {
        let template = self.templates.resolve(&submission.process_id)?;
        let bookkeeping = Bookkeeping::new(
            &submission.identifier,
            &submission.process_id,
            submission.parameters.clone(),
        )
        .with_subscriber(submission.subscriber.clone());

        let workflow = build_workflow(
            template,
            &submission.parameters,
            &bookkeeping,
            self.templates.ttl_seconds(),
        )?;
        let created = self.client.create_workflow(workflow).await?;
        info!(
            workflow = %created.name_any(),
            template = %template,
            process = %submission.process_id,
            "created workflow"
        );
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Workflow>> {
        self.client.get_workflow(name).await
    }

    async fn list(&self) -> Result<Vec<Workflow>> {
        self.client.list_workflows(ListQuery::default()).await
    }

    async fn list_terminal(&self, outcome: Outcome) -> Result<Vec<Workflow>> {
        let selector = match outcome {
            Outcome::Success => format!("{}=Succeeded", PHASE_LABEL),
            Outcome::Failure => format!("{} in (Failed,Error)", PHASE_LABEL),
        };
        self.client.list_workflows(ListQuery::labels(selector)).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.client.delete_workflow(name).await
    }

    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> Result<()> {
        self.client
            .patch_workflow_annotations(name, format_annotations(&annotations))
            .await
    }

    async fn describe(&self, workflow: &Workflow) -> Result<JobDescriptor> {
        let name = workflow.name_any();
        let status = workflow_status(workflow.status.as_ref())?;
        debug!(workflow = %name, %status, "reconciled workflow");

        let observed = workflow.status.as_ref();
        Ok(descriptor(Observation {
            name: &name,
            annotations: workflow.metadata.annotations.as_ref(),
            status,
            started: observed.and_then(|s| s.started_at.as_ref()).map(|t| t.0),
            finished: observed.and_then(|s| s.finished_at.as_ref()).map(|t| t.0),
            message: observed.and_then(|s| s.message.clone()),
            progress: observed.and_then(|s| s.progress_percent()),
            parameters: Some(workflow.parameters()),
        }))
    }

    fn observed_status(workflow: &Workflow) -> Result<JobStatus> {
        workflow_status(workflow.status.as_ref())
    }

    fn pod_selector(workflow: &Workflow) -> Option<String> {
        workflow
            .metadata
            .name
            .as_ref()
            .map(|name| format!("{}={}", WORKFLOW_LABEL, name))
    }
}
