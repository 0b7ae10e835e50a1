//! Job deletion
//!
//! Foreground propagation alone can leave a pod stuck in termination behind,
//! so dependent pods are force-deleted after the owner is gone. That step
//! cannot be undone.

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};

use kubeproc_common::annotations::{k8s_job_name, RESULT_NOTEBOOK};
use kubeproc_common::{Error, Result};

use crate::backend::{object_bookkeeping, WorkloadBackend};
use crate::client::KubeClient;

/// Delete a job, its pods and its result artifact.
///
/// Returns false if no such job exists. Each step tolerates its target being
/// gone already; a failed artifact removal is logged and ignored.
pub async fn delete_job<B: WorkloadBackend>(backend: &B, identifier: &str) -> Result<bool> {
    let name = k8s_job_name(identifier);
    let Some(object) = backend.get(&name).await? else {
        debug!(job = %name, "nothing to delete");
        return Ok(false);
    };

    let selector = B::pod_selector(&object);
    let artifact = object_bookkeeping(&object).get(RESULT_NOTEBOOK).cloned();

    if !backend.delete(&name).await? {
        debug!(job = %name, "object vanished before deletion");
    }

    match selector {
        Some(selector) => {
            let forced = force_delete_pods(backend.client().as_ref(), &selector).await?;
            if forced > 0 {
                info!(job = %name, pods = forced, "force-deleted remaining pods");
            }
        }
        None => warn!(job = %name, "no pod selector recorded, skipping pod cleanup"),
    }

    if let Some(path) = artifact {
        if let Err(e) = remove_artifact(Path::new(&path)).await {
            warn!(job = %name, error = %e, "failed to remove result artifact");
        }
    }

    info!(job = %name, kind = B::KIND, "deleted job");
    Ok(true)
}

/// Force-delete every pod matching `selector`; returns how many were removed
pub async fn force_delete_pods(client: &dyn KubeClient, selector: &str) -> Result<usize> {
    let mut forced = 0;
    for pod in client.list_pods(selector).await? {
        let Some(pod_name) = pod.metadata.name else {
            continue;
        };
        if client.force_delete_pod(&pod_name).await? {
            forced += 1;
        }
    }
    Ok(forced)
}

/// Remove a result artifact; a missing file counts as removed
pub async fn remove_artifact(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed result artifact");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::artifact(path.display().to_string(), e.to_string())),
    }
}
