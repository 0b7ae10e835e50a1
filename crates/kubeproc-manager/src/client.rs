//! Kubernetes access for the job lifecycle engine
//!
//! Every cluster read and write the engine performs goes through
//! [`KubeClient`], which is scoped to one namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubeproc_common::error::is_kube_not_found;
use kubeproc_common::{Error, FIELD_MANAGER};
use kubeproc_workload::{SecretLister, Workflow};

/// Server-side filters for list calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Label selector, e.g. `a=b,c!=d`
    pub label_selector: Option<String>,
    /// Field selector, e.g. `status.successful=1`
    pub field_selector: Option<String>,
}

impl ListQuery {
    /// Query filtering on fields only
    pub fn fields(selector: impl Into<String>) -> Self {
        Self {
            label_selector: None,
            field_selector: Some(selector.into()),
        }
    }

    /// Query filtering on labels only
    pub fn labels(selector: impl Into<String>) -> Self {
        Self {
            label_selector: Some(selector.into()),
            field_selector: None,
        }
    }

    fn params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }
}

/// Trait abstracting namespaced Kubernetes operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Create a batch Job
    async fn create_job(&self, job: Job) -> Result<Job, Error>;

    /// Get a batch Job by name
    async fn get_job(&self, name: &str) -> Result<Option<Job>, Error>;

    /// List batch Jobs
    async fn list_jobs(&self, query: ListQuery) -> Result<Vec<Job>, Error>;

    /// Delete a batch Job with foreground propagation
    ///
    /// Returns false if the job did not exist.
    async fn delete_job(&self, name: &str) -> Result<bool, Error>;

    /// Merge annotations into a batch Job
    async fn patch_job_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Create an Argo Workflow
    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, Error>;

    /// Get an Argo Workflow by name
    async fn get_workflow(&self, name: &str) -> Result<Option<Workflow>, Error>;

    /// List Argo Workflows
    async fn list_workflows(&self, query: ListQuery) -> Result<Vec<Workflow>, Error>;

    /// Delete an Argo Workflow with foreground propagation
    ///
    /// Returns false if the workflow did not exist.
    async fn delete_workflow(&self, name: &str) -> Result<bool, Error>;

    /// Merge annotations into an Argo Workflow
    async fn patch_workflow_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// Delete a pod immediately, skipping graceful termination
    ///
    /// Returns false if the pod was already gone.
    async fn force_delete_pod(&self, name: &str) -> Result<bool, Error>;

    /// List events matching a field selector
    async fn list_events(&self, field_selector: &str) -> Result<Vec<Event>, Error>;

    /// Names of secrets matching a label selector
    async fn list_secret_names(&self, label_selector: &str) -> Result<Vec<String>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    namespace: String,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl operating in one namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Namespace all operations are scoped to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn annotation_patch(annotations: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "annotations": annotations
        }
    })
}

fn gone_is_false(result: Result<(), kube::Error>, kind: &str, name: &str) -> Result<bool, Error> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if is_kube_not_found(&e) => {
            debug!(kind, name, "already deleted");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn create_job(&self, job: Job) -> Result<Job, Error> {
        let api: Api<Job> = self.api();
        Ok(api.create(&PostParams::default(), &job).await?)
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = self.api();
        Ok(api.get_opt(name).await?)
    }

    async fn list_jobs(&self, query: ListQuery) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = self.api();
        Ok(api.list(&query.params()).await?.items)
    }

    async fn delete_job(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Job> = self.api();
        let result = api.delete(name, &DeleteParams::foreground()).await.map(|_| ());
        gone_is_false(result, "Job", name)
    }

    async fn patch_job_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Job> = self.api();
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&annotation_patch(&annotations)),
        )
        .await?;
        Ok(())
    }

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, Error> {
        let api: Api<Workflow> = self.api();
        Ok(api.create(&PostParams::default(), &workflow).await?)
    }

    async fn get_workflow(&self, name: &str) -> Result<Option<Workflow>, Error> {
        let api: Api<Workflow> = self.api();
        Ok(api.get_opt(name).await?)
    }

    async fn list_workflows(&self, query: ListQuery) -> Result<Vec<Workflow>, Error> {
        let api: Api<Workflow> = self.api();
        Ok(api.list(&query.params()).await?.items)
    }

    async fn delete_workflow(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Workflow> = self.api();
        let result = api.delete(name, &DeleteParams::foreground()).await.map(|_| ());
        gone_is_false(result, "Workflow", name)
    }

    async fn patch_workflow_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Workflow> = self.api();
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&annotation_patch(&annotations)),
        )
        .await?;
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = self.api();
        Ok(api
            .list(&ListParams::default().labels(label_selector))
            .await?
            .items)
    }

    async fn force_delete_pod(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Pod> = self.api();
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        let result = api.delete(name, &params).await.map(|_| ());
        gone_is_false(result, "Pod", name)
    }

    async fn list_events(&self, field_selector: &str) -> Result<Vec<Event>, Error> {
        let api: Api<Event> = self.api();
        Ok(api
            .list(&ListParams::default().fields(field_selector))
            .await?
            .items)
    }

    async fn list_secret_names(&self, label_selector: &str) -> Result<Vec<String>, Error> {
        let api: Api<Secret> = self.api();
        let secrets = api
            .list_metadata(&ListParams::default().labels(label_selector))
            .await?;
        Ok(secrets
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect())
    }
}

/// Secret discovery through a [`KubeClient`]
pub struct ClientSecrets(pub Arc<dyn KubeClient>);

#[async_trait]
impl SecretLister for ClientSecrets {
    async fn list_secret_names(&self, label_selector: &str) -> kubeproc_common::Result<Vec<String>> {
        self.0.list_secret_names(label_selector).await
    }
}
