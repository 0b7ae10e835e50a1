//! Job manifest building
//!
//! Everything the engine needs to know about a job later is written as
//! prefixed annotations on the object itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::ObjectMeta;

use kubeproc_common::annotations::{self, format_annotations, k8s_job_name, MAX_PARAMETERS_LEN};
use kubeproc_common::redact::hide_secret_values;
use kubeproc_common::{Result, Subscriber};

use crate::fragment::ResourceFragment;
use crate::process::ContainerProcess;
use crate::request::RequestParameters;

/// Retention of finished objects, independent of this engine running
pub const JOB_TTL_SECONDS: i32 = 60 * 60 * 24 * 100;

/// Metadata recorded on every workload object
#[derive(Clone, Debug, PartialEq)]
pub struct Bookkeeping {
    /// Job identifier
    pub identifier: String,
    /// Process that produced the job
    pub process_id: String,
    /// Submission time
    pub submitted: DateTime<Utc>,
    /// Request parameters, stored redacted
    pub parameters: BTreeMap<String, String>,
    /// Completion callbacks
    pub subscriber: Option<Subscriber>,
    /// Caller-facing result link
    pub result_link: Option<String>,
    /// Local result artifact path
    pub result_artifact: Option<String>,
}

impl Bookkeeping {
    /// Bookkeeping for a submission happening now
    pub fn new(
        identifier: impl Into<String>,
        process_id: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            process_id: process_id.into(),
            submitted: Utc::now(),
            parameters,
            subscriber: None,
            result_link: None,
            result_artifact: None,
        }
    }

    /// Record completion callbacks
    pub fn with_subscriber(mut self, subscriber: Option<Subscriber>) -> Self {
        self.subscriber = subscriber;
        self
    }

    /// Record where the result will be
    pub fn with_result(mut self, link: Option<String>, artifact: Option<String>) -> Self {
        self.result_link = link;
        self.result_artifact = artifact;
        self
    }

    /// Object name derived from the identifier
    pub fn job_name(&self) -> String {
        k8s_job_name(&self.identifier)
    }

    /// Prefixed annotations.
    ///
    /// The parameter snapshot is redacted JSON cut to [`MAX_PARAMETERS_LEN`]
    /// characters; a cut snapshot no longer parses and reads back empty.
    pub fn annotations(&self) -> Result<BTreeMap<String, String>> {
        let snapshot = serde_json::to_string(&hide_secret_values(&self.parameters))?;
        let snapshot: String = snapshot.chars().take(MAX_PARAMETERS_LEN).collect();

        let mut values = BTreeMap::from([
            (annotations::IDENTIFIER.to_string(), self.identifier.clone()),
            (annotations::PROCESS_ID.to_string(), self.process_id.clone()),
            (
                annotations::JOB_START_DATETIME.to_string(),
                annotations::format_timestamp(self.submitted),
            ),
            (annotations::PARAMETERS.to_string(), snapshot),
        ]);

        let optional = [
            (
                annotations::SUCCESS_URI,
                self.subscriber.as_ref().and_then(|s| s.success_uri.clone()),
            ),
            (
                annotations::FAILED_URI,
                self.subscriber.as_ref().and_then(|s| s.failed_uri.clone()),
            ),
            (annotations::RESULT_LINK, self.result_link.clone()),
            (annotations::RESULT_NOTEBOOK, self.result_artifact.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                values.insert(key.to_string(), value);
            }
        }

        Ok(format_annotations(&values))
    }
}

/// Build a single-attempt batch Job for a request.
///
/// Validation happens before anything is assembled, so a rejected request
/// never produces a manifest.
pub fn build_job(
    process: &ContainerProcess,
    request: &RequestParameters,
    fragment: ResourceFragment,
    bookkeeping: &Bookkeeping,
) -> Result<Job> {
    let name = bookkeeping.job_name();
    let pod = process.pod(request, fragment, &name)?;

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name),
            annotations: Some(bookkeeping.annotations()?),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: (!pod.labels.is_empty()).then_some(pod.labels),
                    ..Default::default()
                }),
                spec: Some(pod.spec),
            },
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            ..Default::default()
        }),
        ..Default::default()
    })
}
