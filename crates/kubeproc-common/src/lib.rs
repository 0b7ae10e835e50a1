//! Common types for kubeproc: job descriptors, errors, annotation naming and
//! kube client setup

#![deny(missing_docs)]

pub mod annotations;
pub mod error;
pub mod job;
pub mod kube_utils;
pub mod redact;
pub mod telemetry;

pub use error::Error;
pub use job::{JobDescriptor, JobList, JobStatus, Subscriber};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Reserved prefix for every annotation and label key written by kubeproc.
///
/// Kept byte-identical to the prefix used by already-running workloads.
pub const ANNOTATION_PREFIX: &str = "pygeoapi.io/";

/// Reserved prefix for names of workload objects created by kubeproc
pub const JOB_NAME_PREFIX: &str = "pygeoapi-job-";

/// Field manager name used for server-side patches
pub const FIELD_MANAGER: &str = "kubeproc";
