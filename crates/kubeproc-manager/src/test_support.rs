//! Fixtures shared by the unit tests of this crate

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus as K8sJobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

use kubeproc_common::annotations::{format_annotations, format_timestamp, k8s_job_name};
use kubeproc_workload::{
    ContainerProcess, Features, PolicyConfig, ProcessConfig, Workflow, WorkflowConfig,
    WorkflowSpec, WorkflowStatus, WorkflowTemplates,
};

use crate::backend::{JobBackend, WorkflowBackend};
use crate::client::MockKubeClient;

pub fn process_config() -> ProcessConfig {
    ProcessConfig {
        default_image: "eurodatacube/jupyter-user:1.0".to_string(),
        command: vec!["run-job".to_string()],
        policy: PolicyConfig {
            allowed_images_regex: "eurodatacube/.*".to_string(),
            default_node_purpose: "user".to_string(),
            allowed_node_purposes_regex: "user|g2".to_string(),
            node_purpose_label_key: "hub.eox.at/node-purpose".to_string(),
            tolerations: vec![],
            allow_fargate: false,
        },
        image_pull_secret: None,
        service_account: None,
        parameters_env: BTreeMap::new(),
        output_directory: Some("/home/jovyan/job-output".to_string()),
        result_file_template: "{job_name}.ipynb".to_string(),
        result_link_base: Some("https://hub.example.com/lab/tree".to_string()),
        features: Features::default(),
    }
}

pub fn workflow_config() -> WorkflowConfig {
    WorkflowConfig {
        allowed_templates_regex: "kubeproc-.*".to_string(),
        templates: BTreeMap::from([("echo".to_string(), "kubeproc-echo".to_string())]),
        default_template: None,
        ttl_seconds_after_completion: 3600,
    }
}

pub fn job_backend(mock: MockKubeClient) -> JobBackend {
    let process = ContainerProcess::new(process_config()).unwrap();
    JobBackend::new(Arc::new(mock), process)
}

pub fn workflow_backend(mock: MockKubeClient) -> WorkflowBackend {
    let templates = WorkflowTemplates::new(workflow_config()).unwrap();
    WorkflowBackend::new(Arc::new(mock), templates)
}

/// Submission time `minutes` after a fixed base
pub fn started(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 18, 10, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

pub fn annotations(id: &str, started: DateTime<Utc>) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("identifier".to_string(), id.to_string()),
        ("process_id".to_string(), "echo".to_string()),
        ("job_start_datetime".to_string(), format_timestamp(started)),
    ])
}

pub fn job(id: &str, started: DateTime<Utc>, status: Option<K8sJobStatus>) -> Job {
    job_with(id, annotations(id, started), status)
}

pub fn job_with(
    id: &str,
    bookkeeping: BTreeMap<String, String>,
    status: Option<K8sJobStatus>,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(k8s_job_name(id)),
            annotations: Some(format_annotations(&bookkeeping)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "batch.kubernetes.io/controller-uid".to_string(),
                    format!("uid-{}", id),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status,
    }
}

pub fn succeeded() -> Option<K8sJobStatus> {
    Some(K8sJobStatus {
        succeeded: Some(1),
        completion_time: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            started(30),
        )),
        ..Default::default()
    })
}

pub fn failed() -> Option<K8sJobStatus> {
    Some(K8sJobStatus {
        failed: Some(1),
        ..Default::default()
    })
}

pub fn active() -> Option<K8sJobStatus> {
    Some(K8sJobStatus {
        active: Some(1),
        ..Default::default()
    })
}

pub fn workflow(id: &str, started: DateTime<Utc>, phase: Option<&str>) -> Workflow {
    let mut wf = Workflow::new(&k8s_job_name(id), WorkflowSpec::default());
    wf.metadata.annotations = Some(format_annotations(&annotations(id, started)));
    wf.status = phase.map(|p| WorkflowStatus {
        phase: Some(p.to_string()),
        ..Default::default()
    });
    wf
}
