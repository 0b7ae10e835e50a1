//! Job lifecycle engine for kubeproc
//!
//! [`JobManager`] submits jobs, reconciles their status from the cluster,
//! lists and deletes them. [`NotificationDispatcher`] delivers completion
//! callbacks in the background. Both work over any [`WorkloadBackend`]:
//! batch Jobs ([`JobBackend`]) or Argo Workflows ([`WorkflowBackend`]).
//!
//! The cluster object store is the only state. Every object this engine
//! creates is named with [`kubeproc_common::JOB_NAME_PREFIX`] and carries its
//! bookkeeping as annotations.

pub mod backend;
pub mod cleanup;
pub mod client;
pub mod listing;
pub mod manager;
pub mod notify;
pub mod status;

#[cfg(test)]
mod test_support;

pub use backend::{JobBackend, Outcome, Submission, WorkflowBackend, WorkloadBackend};
pub use client::{KubeClient, KubeClientImpl, ListQuery};
pub use listing::ListOptions;
pub use manager::{JobManager, SubmitRequest, DEFAULT_POLL_INTERVAL};
pub use notify::{
    DispatcherHandle, HttpWebhookSender, NotificationDispatcher, WebhookSender,
    DEFAULT_NOTIFICATION_INTERVAL,
};
