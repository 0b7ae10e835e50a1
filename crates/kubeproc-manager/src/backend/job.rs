//! Batch Job backend

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tracing::{debug, info};

use kubeproc_common::annotations::format_annotations;
use kubeproc_common::{JobDescriptor, JobStatus, Result};
use kubeproc_workload::{build_job, compose, Bookkeeping, ContainerProcess, RequestParameters};

use super::{Outcome, Submission, WorkloadBackend};
use crate::client::{ClientSecrets, KubeClient, ListQuery};
use crate::status::{
    container_message, descriptor, job_finished, job_status, latest_event_message, Observation,
};

/// Runs jobs as single-attempt batch Jobs
pub struct JobBackend {
    client: Arc<dyn KubeClient>,
    process: ContainerProcess,
}

impl JobBackend {
    /// Backend running every job as `process`
    pub fn new(client: Arc<dyn KubeClient>, process: ContainerProcess) -> Self {
        Self { client, process }
    }

    /// Best-effort message: the newest event while nothing runs yet, else the
    /// state of the primary container
    async fn message(&self, job: &Job, name: &str, status: JobStatus) -> Result<Option<String>> {
        if status == JobStatus::Accepted {
            let selector = format!("involvedObject.name={},involvedObject.kind=Job", name);
            let events = self.client.list_events(&selector).await?;
            if let Some(message) = latest_event_message(&events) {
                return Ok(Some(message));
            }
        }

        let Some(selector) = Self::pod_selector(job) else {
            return Ok(None);
        };
        let pods = self.client.list_pods(&selector).await?;
        Ok(container_message(&pods))
    }
}

#[async_trait]
impl WorkloadBackend for JobBackend {
    type Object = Job;

    const KIND: &'static str = "Job";

    fn client(&self) -> &Arc<dyn KubeClient> {
        &self.client
    }

    async fn create(&self, submission: &Submission) -> Result<()> {
        let request = RequestParameters::from_map(&submission.parameters)?;
        let secrets = ClientSecrets(self.client.clone());
        let fragment = compose(
            &self.process.config().features,
            &secrets,
            request.git_revision.as_deref(),
        )
        .await?;

        let bookkeeping = Bookkeeping::new(
            &submission.identifier,
            &submission.process_id,
            submission.parameters.clone(),
        )
        .with_subscriber(submission.subscriber.clone());
        let bookkeeping = match self.process.result_artifact(&bookkeeping.job_name()) {
            Some(artifact) => bookkeeping.with_result(artifact.link, Some(artifact.path)),
            None => bookkeeping,
        };

        let job = build_job(&self.process, &request, fragment, &bookkeeping)?;
        let created = self.client.create_job(job).await?;
        info!(
            job = %created.name_any(),
            process = %submission.process_id,
            "created job"
        );
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Job>> {
        self.client.get_job(name).await
    }

    async fn list(&self) -> Result<Vec<Job>> {
        self.client.list_jobs(ListQuery::default()).await
    }

    async fn list_terminal(&self, outcome: Outcome) -> Result<Vec<Job>> {
        // failed jobs have no field selector; callers refine by status
        let selector = match outcome {
            Outcome::Success => "status.successful=1",
            Outcome::Failure => "status.successful!=1",
        };
        self.client.list_jobs(ListQuery::fields(selector)).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.client.delete_job(name).await
    }

    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> Result<()> {
        self.client
            .patch_job_annotations(name, format_annotations(&annotations))
            .await
    }

    async fn describe(&self, job: &Job) -> Result<JobDescriptor> {
        let name = job.name_any();
        let status = job_status(job.status.as_ref());
        let message = self.message(job, &name, status).await?;
        debug!(job = %name, %status, "reconciled job");

        Ok(descriptor(Observation {
            name: &name,
            annotations: job.metadata.annotations.as_ref(),
            status,
            finished: job_finished(job, status),
            message,
            ..Default::default()
        }))
    }

    fn observed_status(job: &Job) -> Result<JobStatus> {
        Ok(job_status(job.status.as_ref()))
    }

    fn pod_selector(job: &Job) -> Option<String> {
        let labels = job
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.as_ref())
            .filter(|l| !l.is_empty())?;

        Some(
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, Event, Pod, PodStatus,
    };

    use crate::client::MockKubeClient;
    use crate::test_support::{active, job, job_backend, started, succeeded};

    fn submission(parameters: &[(&str, &str)]) -> Submission {
        Submission {
            identifier: "abc".to_string(),
            process_id: "echo".to_string(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            subscriber: None,
        }
    }

    fn waiting_pod() -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "job".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("ContainerCreating".to_string()),
                            message: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_submits_annotated_job() {
        let mut mock = MockKubeClient::new();
        mock.expect_create_job()
            .withf(|job| {
                let annotations = job.metadata.annotations.as_ref().unwrap();
                job.metadata.name.as_deref() == Some("pygeoapi-job-abc")
                    && annotations["pygeoapi.io/process_id"] == "echo"
                    && annotations["pygeoapi.io/result-notebook"]
                        == "/home/jovyan/job-output/pygeoapi-job-abc.ipynb"
                    && annotations["pygeoapi.io/result-link"]
                        == "https://hub.example.com/lab/tree/job-output/pygeoapi-job-abc.ipynb"
            })
            .times(1)
            .returning(Ok);

        let backend = job_backend(mock);
        backend
            .create(&submission(&[("inpfile", "test2.txt")]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_image_creates_nothing() {
        // no create expectation: any create call panics the mock
        let backend = job_backend(MockKubeClient::new());
        let err = backend
            .create(&submission(&[("image", "evil/miner:latest")]))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn accepted_job_reports_newest_event() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_events()
            .withf(|selector| {
                selector == "involvedObject.name=pygeoapi-job-abc,involvedObject.kind=Job"
            })
            .returning(|_| {
                Ok(vec![Event {
                    message: Some("Created pod: pygeoapi-job-abc-x7k2p".to_string()),
                    ..Default::default()
                }])
            });

        let backend = job_backend(mock);
        let descriptor = backend.describe(&job("abc", started(0), None)).await.unwrap();
        assert_eq!(descriptor.status, JobStatus::Accepted);
        assert_eq!(descriptor.message, "Created pod: pygeoapi-job-abc-x7k2p");
        assert_eq!(descriptor.progress, 1);
        assert_eq!(descriptor.start_time, Some(started(0)));
        assert!(descriptor.end_time.is_none());
    }

    #[tokio::test]
    async fn running_job_reports_container_state() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_pods()
            .withf(|selector| selector == "batch.kubernetes.io/controller-uid=uid-abc")
            .returning(|_| Ok(vec![waiting_pod()]));

        let backend = job_backend(mock);
        let descriptor = backend.describe(&job("abc", started(0), active())).await.unwrap();
        assert_eq!(descriptor.status, JobStatus::Running);
        assert_eq!(descriptor.message, "ContainerCreating");
    }

    #[tokio::test]
    async fn successful_job_is_complete() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_pods().returning(|_| Ok(vec![]));

        let backend = job_backend(mock);
        let descriptor = backend
            .describe(&job("abc", started(0), succeeded()))
            .await
            .unwrap();
        assert_eq!(descriptor.status, JobStatus::Successful);
        assert_eq!(descriptor.progress, 100);
        assert_eq!(descriptor.end_time, Some(started(30)));
        assert_eq!(descriptor.identifier, "abc");
    }

    #[tokio::test]
    async fn terminal_candidates_use_field_selectors() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_jobs()
            .withf(|q| q.field_selector.as_deref() == Some("status.successful=1"))
            .times(1)
            .returning(|_| Ok(vec![]));
        mock.expect_list_jobs()
            .withf(|q| q.field_selector.as_deref() == Some("status.successful!=1"))
            .times(1)
            .returning(|_| Ok(vec![]));

        let backend = job_backend(mock);
        backend.list_terminal(Outcome::Success).await.unwrap();
        backend.list_terminal(Outcome::Failure).await.unwrap();
    }

    #[test]
    fn pod_selector_uses_only_the_recorded_selector() {
        let mut j = job("abc", started(0), None);
        assert_eq!(
            JobBackend::pod_selector(&j).as_deref(),
            Some("batch.kubernetes.io/controller-uid=uid-abc")
        );
        j.spec = None;
        assert_eq!(JobBackend::pod_selector(&j), None);
    }
}
