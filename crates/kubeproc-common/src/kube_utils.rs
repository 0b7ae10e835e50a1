//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction with explicit timeouts, namespace resolution and
//! helpers for the condition lists found in workload status.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobCondition;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Kubernetes condition status value for a condition that holds
pub const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
///
/// Without a kubeconfig the local configuration or the in-cluster service
/// account is inferred.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Namespace to operate in: an explicit override, else the client's default
/// (kubeconfig context namespace or the pod's own namespace in-cluster)
pub fn resolve_namespace(client: &Client, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ => {
            let ns = client.default_namespace().to_string();
            debug!(namespace = %ns, "using client default namespace");
            ns
        }
    }
}

/// Trait for types that have condition-like fields
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
    /// Get the last transition time, if recorded
    fn transition_time(&self) -> Option<DateTime<Utc>>;
}

impl HasConditionFields for JobCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
    fn transition_time(&self) -> Option<DateTime<Utc>> {
        self.last_transition_time.as_ref().map(|t| t.0)
    }
}

/// Latest transition time among true conditions of the given type.
///
/// The condition history may hold several entries of one type; only the most
/// recent one reflects the current state.
pub fn latest_true_condition_time<T>(
    conditions: Option<&[T]>,
    condition_type: &str,
) -> Option<DateTime<Utc>>
where
    T: HasConditionFields,
{
    conditions?
        .iter()
        .filter(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        .filter_map(|c| c.transition_time())
        .max()
}
