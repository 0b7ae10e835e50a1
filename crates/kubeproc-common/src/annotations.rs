//! Bookkeeping stored on workload objects
//!
//! The cluster object store is the only persistence layer: everything known
//! about a job lives in annotations under [`ANNOTATION_PREFIX`]. Keys outside
//! the prefix belong to someone else and are never read or written.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{ANNOTATION_PREFIX, JOB_NAME_PREFIX};

/// Job identifier
pub const IDENTIFIER: &str = "identifier";
/// Process that produced the job
pub const PROCESS_ID: &str = "process_id";
/// Submission time
pub const JOB_START_DATETIME: &str = "job_start_datetime";
/// Redacted JSON snapshot of the request parameters
pub const PARAMETERS: &str = "parameters";
/// Caller-facing link to the result
pub const RESULT_LINK: &str = "result-link";
/// Local path of the result artifact written by the workload
pub const RESULT_NOTEBOOK: &str = "result-notebook";
/// Progress percentage reported by the workload itself
pub const PROGRESS: &str = "progress";
/// Callback for successful completion
pub const SUCCESS_URI: &str = "success-uri";
/// Callback for failure
pub const FAILED_URI: &str = "failed-uri";
/// Marker written once the success callback has been handled
pub const SUCCESS_SENT: &str = "success-sent";
/// Marker written once the failure callback has been handled
pub const FAILED_SENT: &str = "failed-sent";

/// Timestamp format used for every timestamp annotation
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const DATETIME_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Maximum length of the stored parameter snapshot
pub const MAX_PARAMETERS_LEN: usize = 8000;

/// Object name for a job identifier
pub fn k8s_job_name(job_id: &str) -> String {
    format!("{}{}", JOB_NAME_PREFIX, job_id)
}

/// Whether an object name belongs to kubeproc
pub fn is_k8s_job_name(name: &str) -> bool {
    name.starts_with(JOB_NAME_PREFIX)
}

/// Job identifier encoded in an object name
pub fn job_id_from_job_name(name: &str) -> Option<&str> {
    name.strip_prefix(JOB_NAME_PREFIX)
}

/// Prefix a bookkeeping key
pub fn format_annotation_key(key: &str) -> String {
    format!("{}{}", ANNOTATION_PREFIX, key)
}

/// Strip the reserved prefix; `None` for foreign keys
pub fn parse_annotation_key(key: &str) -> Option<&str> {
    key.strip_prefix(ANNOTATION_PREFIX).filter(|k| !k.is_empty())
}

/// Prefix every key of an unprefixed bookkeeping map
pub fn format_annotations(values: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (format_annotation_key(k), v.clone()))
        .collect()
}

/// Extract kubeproc's own annotations, with the prefix removed.
///
/// Kubernetes returns `None` rather than an empty map when an object has no
/// annotations; both are treated the same.
pub fn bookkeeping(annotations: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    annotations
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| parse_annotation_key(k).map(|key| (key.to_string(), v.clone())))
        .collect()
}

/// Format a timestamp for an annotation value
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

/// Parse a timestamp annotation value.
///
/// Accepts the annotation format as well as RFC 3339.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DATETIME_PARSE_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
        })
}

/// Current time formatted for an annotation value
pub fn now_str() -> String {
    format_timestamp(Utc::now())
}
