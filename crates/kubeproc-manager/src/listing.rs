//! Listing and pagination
//!
//! Filtering, ordering and slicing use only what the listed objects carry.
//! The per-job lookups of full reconciliation run on the returned page only.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use kube::ResourceExt;
use tracing::{debug, warn};

use kubeproc_common::annotations::{self, parse_timestamp};
use kubeproc_common::{JobList, JobStatus, Result};

use crate::backend::{is_managed, object_bookkeeping, WorkloadBackend};

/// Page request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Jobs to skip
    pub offset: usize,
    /// Page size; unbounded if absent
    pub limit: Option<usize>,
    /// Only jobs with this status
    pub status: Option<JobStatus>,
}

fn submitted_at<K: kube::Resource>(object: &K) -> Option<DateTime<Utc>> {
    object_bookkeeping(object)
        .get(annotations::JOB_START_DATETIME)
        .and_then(|v| parse_timestamp(v))
}

/// Objects of this engine, most recent submission first, filtered by status
pub fn select<B: WorkloadBackend>(
    objects: Vec<B::Object>,
    status: Option<JobStatus>,
) -> Vec<B::Object> {
    let mut selected: Vec<(Option<DateTime<Utc>>, B::Object)> = objects
        .into_iter()
        .filter(|object| is_managed(object))
        .filter(|object| match status {
            None => true,
            Some(wanted) => match B::observed_status(object) {
                Ok(observed) => observed == wanted,
                Err(e) => {
                    warn!(job = %object.name_any(), error = %e, "skipping object in listing");
                    false
                }
            },
        })
        .map(|object| (submitted_at(&object), object))
        .collect();

    // missing timestamps sort as earliest
    selected.sort_by(|a, b| b.0.cmp(&a.0));
    selected.into_iter().map(|(_, object)| object).collect()
}

/// One page of jobs with the total number matched
pub async fn list_page<B: WorkloadBackend>(backend: &B, options: ListOptions) -> Result<JobList> {
    let selected = select::<B>(backend.list().await?, options.status);
    let number_matched = selected.len();

    let page: Vec<B::Object> = selected
        .into_iter()
        .skip(options.offset)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();
    debug!(
        kind = B::KIND,
        number_matched,
        page = page.len(),
        offset = options.offset,
        "listed jobs"
    );

    let jobs = try_join_all(page.iter().map(|object| backend.describe(object))).await?;
    Ok(JobList {
        jobs,
        number_matched,
    })
}
