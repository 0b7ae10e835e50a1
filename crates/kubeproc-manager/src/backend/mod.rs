//! Workload backends
//!
//! A backend owns one workload kind: how submissions become objects, how
//! objects are found again and how their state maps onto [`JobStatus`].
//! Everything above this layer is kind-agnostic.

mod job;
mod workflow;

pub use job::JobBackend;
pub use workflow::WorkflowBackend;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use kubeproc_common::annotations::{self, bookkeeping};
use kubeproc_common::{JobDescriptor, JobStatus, Result, Subscriber};

use crate::client::KubeClient;

/// A validated-to-be submission with its identifier assigned
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Submission {
    /// Job identifier
    pub identifier: String,
    /// Process to run
    pub process_id: String,
    /// Request parameters, unredacted
    pub parameters: BTreeMap<String, String>,
    /// Completion callbacks
    pub subscriber: Option<Subscriber>,
}

/// Terminal outcome a notification is sent for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Job succeeded
    Success,
    /// Job failed
    Failure,
}

impl Outcome {
    /// Both outcomes, in dispatch order
    pub const ALL: [Outcome; 2] = [Outcome::Success, Outcome::Failure];

    /// Status an object must have to qualify
    pub fn status(self) -> JobStatus {
        match self {
            Outcome::Success => JobStatus::Successful,
            Outcome::Failure => JobStatus::Failed,
        }
    }

    /// Bookkeeping key of the callback URI
    pub fn uri_key(self) -> &'static str {
        match self {
            Outcome::Success => annotations::SUCCESS_URI,
            Outcome::Failure => annotations::FAILED_URI,
        }
    }

    /// Bookkeeping key of the sent marker
    pub fn sent_key(self) -> &'static str {
        match self {
            Outcome::Success => annotations::SUCCESS_SENT,
            Outcome::Failure => annotations::FAILED_SENT,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

/// One workload kind the engine can run jobs as
#[async_trait]
pub trait WorkloadBackend: Send + Sync + 'static {
    /// Cluster object backing a job
    type Object: Resource + Clone + Send + Sync + 'static;

    /// Kind name used in logs
    const KIND: &'static str;

    /// Client the backend talks through
    fn client(&self) -> &Arc<dyn KubeClient>;

    /// Validate a submission and create its object
    async fn create(&self, submission: &Submission) -> Result<()>;

    /// Read an object by name
    async fn get(&self, name: &str) -> Result<Option<Self::Object>>;

    /// Every object of this kind in the namespace
    async fn list(&self) -> Result<Vec<Self::Object>>;

    /// Objects that may have reached an outcome, using the narrowest server
    /// side filter available
    async fn list_terminal(&self, outcome: Outcome) -> Result<Vec<Self::Object>>;

    /// Delete an object with foreground propagation; false if already gone
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Merge prefixed annotations into an object
    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> Result<()>;

    /// Full reconciliation, including lookups of related objects
    async fn describe(&self, object: &Self::Object) -> Result<JobDescriptor>;

    /// Status derived from the object alone
    fn observed_status(object: &Self::Object) -> Result<JobStatus>;

    /// Label selector recorded on the object for its pods, if any
    fn pod_selector(object: &Self::Object) -> Option<String>;
}

/// Unprefixed bookkeeping values of an object
pub fn object_bookkeeping<K: Resource>(object: &K) -> BTreeMap<String, String> {
    bookkeeping(object.meta().annotations.as_ref())
}

/// Whether an object was created by this engine
pub fn is_managed<K: Resource>(object: &K) -> bool {
    annotations::is_k8s_job_name(&object.name_any())
}
