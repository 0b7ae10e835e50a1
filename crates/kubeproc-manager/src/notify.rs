//! Completion notifications
//!
//! A background task periodically finds terminal jobs with a callback URI
//! and POSTs their descriptor once. The sent marker is written before the
//! POST: a crash or failed delivery after marking loses that notification,
//! but a job is never notified twice by one dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use kubeproc_common::annotations::now_str;
use kubeproc_common::{Error, JobDescriptor, Result};

use crate::backend::{is_managed, object_bookkeeping, Outcome, WorkloadBackend};
use crate::manager::JobManager;

/// Interval between notification cycles
pub const DEFAULT_NOTIFICATION_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout of a single webhook delivery
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers a job descriptor to a callback URI
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// POST `job` as JSON to `uri`; non-2xx responses are errors
    async fn send(&self, uri: &str, job: &JobDescriptor) -> Result<()>;
}

/// [`WebhookSender`] over HTTP
pub struct HttpWebhookSender {
    http: reqwest::Client,
}

impl HttpWebhookSender {
    /// Sender with the default delivery timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(WEBHOOK_TIMEOUT)
    }

    /// Sender with a custom delivery timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::internal_with_context(
                    "webhook",
                    format!("failed to create HTTP client: {}", e),
                )
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, uri: &str, job: &JobDescriptor) -> Result<()> {
        let response = self
            .http
            .post(uri)
            .json(job)
            .send()
            .await
            .map_err(|e| Error::webhook(uri, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::webhook(uri, format!("unexpected status {}", status)));
        }
        Ok(())
    }
}

/// Sends completion callbacks for the jobs of one manager
pub struct NotificationDispatcher<B> {
    manager: Arc<JobManager<B>>,
    sender: Arc<dyn WebhookSender>,
}

impl<B: WorkloadBackend> NotificationDispatcher<B> {
    /// Dispatcher delivering through `sender`
    pub fn new(manager: Arc<JobManager<B>>, sender: Arc<dyn WebhookSender>) -> Self {
        Self { manager, sender }
    }

    /// Run cycles every `interval` on a background task until `token` is
    /// cancelled
    pub fn spawn(
        manager: Arc<JobManager<B>>,
        sender: Arc<dyn WebhookSender>,
        interval: Duration,
        token: CancellationToken,
    ) -> DispatcherHandle {
        let dispatcher = Self::new(manager, sender);
        let task_token = token.clone();
        let handle = tokio::spawn(async move { dispatcher.run(interval, task_token).await });
        DispatcherHandle { token, handle }
    }

    /// Run cycles until `token` is cancelled
    pub async fn run(&self, interval: Duration, token: CancellationToken) {
        info!(kind = B::KIND, interval_secs = interval.as_secs(), "notification dispatcher started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let sent = self.run_cycle().await;
                    debug!(sent, "notification cycle complete");
                }
            }
        }
        info!("notification dispatcher stopped");
    }

    /// One pass over both outcomes; returns the number of delivered callbacks.
    ///
    /// A failed pass for one outcome is logged and does not hold up the other.
    pub async fn run_cycle(&self) -> usize {
        let mut sent = 0;
        for outcome in Outcome::ALL {
            match self.dispatch(outcome).await {
                Ok(n) => sent += n,
                Err(e) => warn!(%outcome, error = %e, "notification pass failed"),
            }
        }
        sent
    }

    async fn dispatch(&self, outcome: Outcome) -> Result<usize> {
        let backend = self.manager.backend();
        let mut sent = 0;

        for object in backend.list_terminal(outcome).await? {
            if !is_managed(&object) {
                continue;
            }
            let name = object.name_any();
            let values = object_bookkeeping(&object);
            let Some(uri) = values.get(outcome.uri_key()).filter(|u| !u.is_empty()) else {
                continue;
            };
            if values.contains_key(outcome.sent_key()) {
                continue;
            }
            match B::observed_status(&object) {
                Ok(status) if status == outcome.status() => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(job = %name, error = %e, "cannot determine status for notification");
                    continue;
                }
            }

            let job = match backend.describe(&object).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job = %name, error = %e, "failed to reconcile job for notification");
                    continue;
                }
            };

            let marker = BTreeMap::from([(outcome.sent_key().to_string(), now_str())]);
            if let Err(e) = backend.annotate(&name, marker).await {
                warn!(job = %name, error = %e, "failed to mark notification, will retry");
                continue;
            }

            match self.sender.send(uri, &job).await {
                Ok(()) => {
                    info!(job = %name, %outcome, uri = %uri, "notification sent");
                    sent += 1;
                }
                Err(e) => {
                    warn!(job = %name, %outcome, error = %e, "notification delivery failed");
                }
            }
        }
        Ok(sent)
    }
}

/// Owns a running dispatcher task
pub struct DispatcherHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Token that stops the dispatcher when cancelled
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop the dispatcher and wait for its current cycle to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "notification dispatcher task failed");
        }
    }
}
