//! Canonical, caller-facing job types
//!
//! These types hide which workload kind backs a job. Every backend reports
//! through [`JobDescriptor`], which is also the webhook payload.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical job status.
///
/// `Accepted → Running → {Successful, Failed}`; terminal states never
/// transition again.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Known to the cluster but not started
    #[default]
    Accepted,
    /// At least one container is running
    Running,
    /// Completed successfully
    Successful,
    /// Completed with a failure
    Failed,
}

impl JobStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Successful | JobStatus::Failed)
    }

    /// Parse the lowercase wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "running" => Some(Self::Running),
            "successful" => Some(Self::Successful),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Running => write!(f, "running"),
            Self::Successful => write!(f, "successful"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Canonical view of one execution
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Job identifier, unique within the namespace
    #[serde(rename = "jobID")]
    pub identifier: String,
    /// Process that produced the job
    #[serde(rename = "processID")]
    pub process_id: String,
    /// Canonical status
    pub status: JobStatus,
    /// Submission or start time
    #[serde(rename = "started", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Completion time, present iff the status is terminal
    #[serde(rename = "finished", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Progress in percent
    pub progress: u8,
    /// Best-effort human readable message
    #[serde(default)]
    pub message: String,
    /// Request parameters with secret values masked
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Where the result can be found, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
}

impl JobDescriptor {
    /// Descriptor for a job that was just submitted
    pub fn accepted(identifier: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            process_id: process_id.into(),
            status: JobStatus::Accepted,
            start_time: Some(Utc::now()),
            end_time: None,
            progress: 1,
            message: String::new(),
            parameters: BTreeMap::new(),
            result_location: None,
        }
    }
}

/// One page of jobs
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobList {
    /// Jobs on this page, most recent first
    pub jobs: Vec<JobDescriptor>,
    /// Number of jobs matching the query before pagination
    pub number_matched: usize,
}

/// Caller-supplied completion callbacks
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    /// Called once the job succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_uri: Option<String>,
    /// Called once the job failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_uri: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        for status in [
            JobStatus::Accepted,
            JobStatus::Running,
            JobStatus::Successful,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(
            serde_json::to_value(JobStatus::Successful).unwrap(),
            serde_json::json!("successful")
        );
        assert_eq!(JobStatus::parse("dismissed"), None);
    }

    #[test]
    fn only_successful_and_failed_are_terminal() {
        assert!(!JobStatus::Accepted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Successful.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn descriptor_serializes_with_ogc_field_names() {
        let mut job = JobDescriptor::accepted("abc", "execute-notebook");
        job.start_time = None;
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["jobID"], "abc");
        assert_eq!(value["processID"], "execute-notebook");
        assert_eq!(value["status"], "accepted");
        assert_eq!(value["progress"], 1);
        assert!(value.get("finished").is_none());
        assert!(value.get("resultLocation").is_none());
    }
}
