//! Job manager
//!
//! Caller-facing operations over one workload backend. Holds no state of its
//! own: every answer is read back from the cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use kubeproc_common::annotations::k8s_job_name;
use kubeproc_common::redact::hide_secret_values;
use kubeproc_common::{Error, JobDescriptor, JobList, JobStatus, Result, Subscriber};

use crate::backend::{Submission, WorkloadBackend};
use crate::cleanup::delete_job;
use crate::listing::{list_page, ListOptions};

/// Interval between status reads while executing synchronously
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Longest object name the cluster accepts for a job
const MAX_OBJECT_NAME_LEN: usize = 63;

/// Inbound job submission
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Process to run
    #[serde(rename = "processID")]
    pub process_id: String,
    /// Caller-chosen identifier; generated if absent
    #[serde(default, rename = "jobID")]
    pub job_id: Option<String>,
    /// Request parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Completion callbacks
    #[serde(default)]
    pub subscriber: Option<Subscriber>,
}

fn validate_job_id(job_id: &str) -> Result<()> {
    let valid_chars = job_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || job_id.ends_with('-') {
        return Err(Error::client_field(
            "job_id",
            format!(
                "{:?} must consist of lowercase letters, digits and '-' and not end with '-'",
                job_id
            ),
        ));
    }
    if k8s_job_name(job_id).len() > MAX_OBJECT_NAME_LEN {
        return Err(Error::client_field("job_id", format!("{:?} is too long", job_id)));
    }
    Ok(())
}

/// Lifecycle operations for jobs backed by `B`
pub struct JobManager<B> {
    backend: B,
    poll_interval: Duration,
}

impl<B: WorkloadBackend> JobManager<B> {
    /// Manager over `backend` with the default poll interval
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the synchronous execution poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Backend this manager runs jobs on
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Submit a job and return its accepted descriptor.
    ///
    /// Validation failures are client errors and create nothing.
    #[instrument(skip(self, request), fields(process = %request.process_id))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobDescriptor> {
        let identifier = match request.job_id {
            Some(id) if !id.is_empty() => {
                validate_job_id(&id)?;
                id
            }
            _ => Uuid::new_v4().to_string(),
        };

        let submission = Submission {
            identifier,
            process_id: request.process_id,
            parameters: request.parameters,
            subscriber: request.subscriber,
        };
        if let Err(e) = self.backend.create(&submission).await {
            if e.is_client_error() {
                debug!(job = %submission.identifier, error = %e, "submission rejected");
            }
            return Err(e);
        }
        info!(job = %submission.identifier, kind = B::KIND, "job accepted");

        let mut descriptor =
            JobDescriptor::accepted(submission.identifier, submission.process_id);
        descriptor.parameters = hide_secret_values(&submission.parameters);
        Ok(descriptor)
    }

    /// Current state of one job
    pub async fn get_status(&self, job_id: &str) -> Result<JobDescriptor> {
        let name = k8s_job_name(job_id);
        match self.backend.get(&name).await? {
            Some(object) => self.backend.describe(&object).await,
            None => Err(Error::not_found(job_id)),
        }
    }

    /// One page of jobs, most recent first
    pub async fn list(&self, options: ListOptions) -> Result<JobList> {
        list_page(&self.backend, options).await
    }

    /// Delete a job and everything it left behind; false if unknown
    #[instrument(skip(self))]
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        delete_job(&self.backend, job_id).await
    }

    /// Result location of a successful job
    pub async fn result(&self, job_id: &str) -> Result<Option<String>> {
        let job = self.get_status(job_id).await?;
        if job.status != JobStatus::Successful {
            debug!(job = %job_id, status = %job.status, "no result yet");
            return Ok(None);
        }
        Ok(job.result_location)
    }

    /// Submit and wait until the job is terminal.
    ///
    /// A job that disappears while waiting is reported as failed. There is no
    /// timeout; drop the future to stop waiting.
    pub async fn execute_sync(&self, request: SubmitRequest) -> Result<JobDescriptor> {
        let accepted = self.submit(request).await?;
        let job_id = accepted.identifier.clone();

        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.get_status(&job_id).await {
                Ok(job) if job.status.is_terminal() => {
                    info!(job = %job_id, status = %job.status, "job finished");
                    return Ok(job);
                }
                Ok(job) => debug!(job = %job_id, status = %job.status, "waiting for job"),
                Err(e) if e.is_not_found() => {
                    warn!(job = %job_id, "job vanished while waiting");
                    return Ok(JobDescriptor {
                        status: JobStatus::Failed,
                        end_time: Some(Utc::now()),
                        message: "job vanished before completion".to_string(),
                        ..accepted
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
