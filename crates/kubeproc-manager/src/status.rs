//! Status reconciliation
//!
//! Maps eventually consistent cluster state onto the canonical
//! `accepted → running → {successful, failed}` machine. Every input may be
//! stale or partially populated; absent collections read as empty.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobStatus as K8sJobStatus};
use k8s_openapi::api::core::v1::{Event, Pod};
use tracing::warn;

use kubeproc_common::annotations::{self, bookkeeping, parse_timestamp};
use kubeproc_common::kube_utils::{latest_true_condition_time, HasConditionFields};
use kubeproc_common::redact::hide_secret_values;
use kubeproc_common::{Error, JobDescriptor, JobStatus, Result};
use kubeproc_workload::WorkflowStatus;

/// Progress reported for a job without better information
pub const DEFAULT_PROGRESS: u8 = 1;

/// Canonical status of a batch Job; first match wins
pub fn job_status(status: Option<&K8sJobStatus>) -> JobStatus {
    let Some(status) = status else {
        return JobStatus::Accepted;
    };
    let positive = |counter: Option<i32>| counter.unwrap_or(0) > 0;

    if positive(status.succeeded) {
        JobStatus::Successful
    } else if positive(status.failed) {
        JobStatus::Failed
    } else if positive(status.active) {
        JobStatus::Running
    } else {
        JobStatus::Accepted
    }
}

/// Completion time of a batch Job; only terminal jobs have one.
///
/// Failure time is only recorded in the condition history, where the latest
/// true `Failed` entry is authoritative.
pub fn job_finished(job: &Job, status: JobStatus) -> Option<DateTime<Utc>> {
    if !status.is_terminal() {
        return None;
    }
    let k8s_status = job.status.as_ref()?;
    let conditions = k8s_status.conditions.as_deref();
    let recorded = if status == JobStatus::Successful {
        k8s_status
            .completion_time
            .as_ref()
            .map(|t| t.0)
            .or_else(|| latest_true_condition_time(conditions, "Complete"))
    } else {
        latest_true_condition_time(conditions, "Failed")
    };
    recorded.or_else(|| latest_transition(conditions))
}

fn latest_transition<T: HasConditionFields>(conditions: Option<&[T]>) -> Option<DateTime<Utc>> {
    conditions?.iter().filter_map(|c| c.transition_time()).max()
}

/// Canonical status of an Argo Workflow.
///
/// An unknown phase is an unmodeled backend state and never coerced.
pub fn workflow_status(status: Option<&WorkflowStatus>) -> Result<JobStatus> {
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("");
    match phase {
        "" | "Pending" => Ok(JobStatus::Accepted),
        "Running" => Ok(JobStatus::Running),
        "Succeeded" => Ok(JobStatus::Successful),
        "Failed" | "Error" => Ok(JobStatus::Failed),
        other => Err(Error::unmodeled("workflow phase", other)),
    }
}

/// Message of the most recent event
pub fn latest_event_message(events: &[Event]) -> Option<String> {
    events
        .iter()
        .max_by_key(|e| event_time(e))
        .and_then(|e| e.message.clone())
        .filter(|m| !m.is_empty())
}

fn event_time(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// `"<reason>: <message>"` of the first pod's primary container while it
/// waits or after it terminated
pub fn container_message(pods: &[Pod]) -> Option<String> {
    let state = pods
        .first()?
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?;

    let (reason, message) = if let Some(waiting) = &state.waiting {
        (waiting.reason.as_deref(), waiting.message.as_deref())
    } else if let Some(terminated) = &state.terminated {
        (terminated.reason.as_deref(), terminated.message.as_deref())
    } else {
        return None;
    };

    let parts: Vec<&str> = [reason, message]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join(": "))
}

/// Progress percentage.
///
/// An explicit value wins but stays below 100 unless the job succeeded, so
/// that 100 always means success.
pub fn progress(annotation: Option<&str>, reported: Option<u8>, status: JobStatus) -> u8 {
    let explicit = annotation
        .and_then(|v| v.trim().parse::<u8>().ok())
        .or(reported);
    match (explicit, status) {
        (Some(p), JobStatus::Successful) => p.min(100),
        (Some(p), _) => p.min(99),
        (None, JobStatus::Successful) => 100,
        (None, _) => DEFAULT_PROGRESS,
    }
}

/// Redacted request parameters from the snapshot annotation.
///
/// A malformed snapshot is logged and read as empty.
pub fn decode_parameters(raw: Option<&str>, name: &str) -> BTreeMap<String, String> {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(raw) {
        Ok(values) => {
            let values = values
                .into_iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect();
            hide_secret_values(&values)
        }
        Err(e) => {
            warn!(job = %name, error = %e, "malformed parameters annotation, ignoring");
            BTreeMap::new()
        }
    }
}

/// What a backend observed about one object
#[derive(Clone, Debug, Default)]
pub struct Observation<'a> {
    /// Object name
    pub name: &'a str,
    /// Raw object annotations
    pub annotations: Option<&'a BTreeMap<String, String>>,
    /// Canonical status
    pub status: JobStatus,
    /// Start time reported by the backend, preferred over the annotation
    pub started: Option<DateTime<Utc>>,
    /// Completion time reported by the backend
    pub finished: Option<DateTime<Utc>>,
    /// Best-effort message
    pub message: Option<String>,
    /// Progress reported by the backend
    pub progress: Option<u8>,
    /// Parameters reported by the backend, preferred over the annotation
    pub parameters: Option<BTreeMap<String, String>>,
}

/// Assemble the canonical descriptor.
///
/// Terminal jobs always carry an end time; when the backend recorded none the
/// observation time stands in.
pub fn descriptor(obs: Observation<'_>) -> JobDescriptor {
    let values = bookkeeping(obs.annotations);
    let get = |key: &str| values.get(key).map(String::as_str);

    let identifier = get(annotations::IDENTIFIER)
        .map(str::to_string)
        .or_else(|| annotations::job_id_from_job_name(obs.name).map(str::to_string))
        .unwrap_or_default();

    let end_time = if obs.status.is_terminal() {
        Some(obs.finished.unwrap_or_else(Utc::now))
    } else {
        None
    };

    let parameters = match obs.parameters {
        Some(params) => hide_secret_values(&params),
        None => decode_parameters(get(annotations::PARAMETERS), obs.name),
    };

    JobDescriptor {
        identifier,
        process_id: get(annotations::PROCESS_ID).unwrap_or_default().to_string(),
        status: obs.status,
        start_time: obs
            .started
            .or_else(|| get(annotations::JOB_START_DATETIME).and_then(parse_timestamp)),
        end_time,
        progress: progress(get(annotations::PROGRESS), obs.progress, obs.status),
        message: obs.message.unwrap_or_default(),
        parameters,
        result_location: get(annotations::RESULT_LINK).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::batch::v1::JobCondition;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn counters(active: Option<i32>, succeeded: Option<i32>, failed: Option<i32>) -> K8sJobStatus {
        K8sJobStatus {
            active,
            succeeded,
            failed,
            ..Default::default()
        }
    }

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 18, h, 0, 0).unwrap()
    }

    fn pod_with_state(state: ContainerState) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "job".to_string(),
                    state: Some(state),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn success_counter_wins_over_everything() {
        let status = counters(Some(1), Some(1), Some(3));
        assert_eq!(job_status(Some(&status)), JobStatus::Successful);
    }

    #[test]
    fn counter_priority_and_nulls() {
        assert_eq!(job_status(None), JobStatus::Accepted);
        assert_eq!(job_status(Some(&counters(None, None, None))), JobStatus::Accepted);
        assert_eq!(job_status(Some(&counters(Some(0), Some(0), Some(0)))), JobStatus::Accepted);
        assert_eq!(job_status(Some(&counters(Some(1), None, None))), JobStatus::Running);
        assert_eq!(job_status(Some(&counters(Some(1), None, Some(1)))), JobStatus::Failed);
    }

    #[test]
    fn failure_time_is_latest_true_failed_condition() {
        let job = Job {
            status: Some(K8sJobStatus {
                failed: Some(1),
                conditions: Some(vec![
                    JobCondition {
                        type_: "Failed".to_string(),
                        status: "True".to_string(),
                        last_transition_time: Some(Time(ts(10))),
                        ..Default::default()
                    },
                    JobCondition {
                        type_: "Failed".to_string(),
                        status: "True".to_string(),
                        last_transition_time: Some(Time(ts(12))),
                        ..Default::default()
                    },
                    JobCondition {
                        type_: "Failed".to_string(),
                        status: "False".to_string(),
                        last_transition_time: Some(Time(ts(14))),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(job_finished(&job, JobStatus::Failed), Some(ts(12)));
    }

    #[test]
    fn success_time_prefers_completion_time() {
        let job = Job {
            status: Some(K8sJobStatus {
                succeeded: Some(1),
                completion_time: Some(Time(ts(9))),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(job_finished(&job, JobStatus::Successful), Some(ts(9)));
        assert_eq!(job_finished(&job, JobStatus::Running), None);
    }

    #[test]
    fn workflow_phases() {
        let phase = |p: Option<&str>| WorkflowStatus {
            phase: p.map(str::to_string),
            ..Default::default()
        };
        assert_eq!(workflow_status(None).unwrap(), JobStatus::Accepted);
        assert_eq!(workflow_status(Some(&phase(None))).unwrap(), JobStatus::Accepted);
        assert_eq!(workflow_status(Some(&phase(Some("")))).unwrap(), JobStatus::Accepted);
        assert_eq!(workflow_status(Some(&phase(Some("Pending")))).unwrap(), JobStatus::Accepted);
        assert_eq!(workflow_status(Some(&phase(Some("Running")))).unwrap(), JobStatus::Running);
        assert_eq!(
            workflow_status(Some(&phase(Some("Succeeded")))).unwrap(),
            JobStatus::Successful
        );
        assert_eq!(workflow_status(Some(&phase(Some("Failed")))).unwrap(), JobStatus::Failed);
        assert_eq!(workflow_status(Some(&phase(Some("Error")))).unwrap(), JobStatus::Failed);
    }

    #[test]
    fn unknown_workflow_phase_is_fatal() {
        let status = WorkflowStatus {
            phase: Some("Skipped".to_string()),
            ..Default::default()
        };
        let err = workflow_status(Some(&status)).unwrap_err();
        assert!(matches!(err, Error::UnmodeledState { .. }));
        assert!(!err.is_client_error());
    }

    #[test]
    fn newest_event_message_wins() {
        let event = |msg: &str, h: u32| Event {
            message: Some(msg.to_string()),
            last_timestamp: Some(Time(ts(h))),
            ..Default::default()
        };
        let events = vec![event("newer", 11), event("older", 10)];
        assert_eq!(latest_event_message(&events).as_deref(), Some("newer"));
        assert_eq!(latest_event_message(&[]), None);
    }

    #[test]
    fn container_message_formats_reason_and_detail() {
        let waiting = pod_with_state(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ImagePullBackOff".to_string()),
                message: Some("Back-off pulling image".to_string()),
            }),
            ..Default::default()
        });
        assert_eq!(
            container_message(&[waiting]).as_deref(),
            Some("ImagePullBackOff: Back-off pulling image")
        );

        let terminated = pod_with_state(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some("Error".to_string()),
                exit_code: 1,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(container_message(&[terminated]).as_deref(), Some("Error"));
    }

    #[test]
    fn container_message_tolerates_nulls() {
        assert_eq!(container_message(&[]), None);
        assert_eq!(container_message(&[Pod::default()]), None);
        let running = pod_with_state(ContainerState::default());
        assert_eq!(container_message(&[running]), None);
    }

    #[test]
    fn progress_rules() {
        assert_eq!(progress(None, None, JobStatus::Accepted), 1);
        assert_eq!(progress(None, None, JobStatus::Successful), 100);
        assert_eq!(progress(Some("42"), None, JobStatus::Running), 42);
        assert_eq!(progress(Some("100"), None, JobStatus::Running), 99);
        assert_eq!(progress(Some("100"), None, JobStatus::Successful), 100);
        assert_eq!(progress(Some("garbage"), Some(30), JobStatus::Running), 30);
    }

    #[test]
    fn malformed_parameters_read_as_empty() {
        assert!(decode_parameters(Some("{not json"), "pygeoapi-job-abc").is_empty());
        assert!(decode_parameters(None, "pygeoapi-job-abc").is_empty());
    }

    #[test]
    fn parameters_are_redacted_on_read() {
        let params = decode_parameters(
            Some(r#"{"apiKey": "k", "inpfile": "test2.txt", "n": 3}"#),
            "pygeoapi-job-abc",
        );
        assert_eq!(params["apiKey"], "*****");
        assert_eq!(params["inpfile"], "test2.txt");
        assert_eq!(params["n"], "3");
    }

    #[test]
    fn descriptor_end_time_only_when_terminal() {
        let annotations = BTreeMap::from([
            ("pygeoapi.io/identifier".to_string(), "abc".to_string()),
            ("pygeoapi.io/process_id".to_string(), "echo".to_string()),
            (
                "pygeoapi.io/job_start_datetime".to_string(),
                "2024-09-18T10:00:00.000000Z".to_string(),
            ),
            ("pygeoapi.io/result-link".to_string(), "https://r".to_string()),
        ]);

        let running = descriptor(Observation {
            name: "pygeoapi-job-abc",
            annotations: Some(&annotations),
            status: JobStatus::Running,
            finished: Some(ts(12)),
            ..Default::default()
        });
        assert_eq!(running.identifier, "abc");
        assert_eq!(running.process_id, "echo");
        assert_eq!(running.start_time, Some(ts(10)));
        assert_eq!(running.end_time, None);
        assert_eq!(running.progress, 1);

        let failed = descriptor(Observation {
            name: "pygeoapi-job-abc",
            annotations: Some(&annotations),
            status: JobStatus::Failed,
            ..Default::default()
        });
        assert!(failed.end_time.is_some());
        assert_eq!(failed.result_location.as_deref(), Some("https://r"));
    }

    #[test]
    fn descriptor_survives_missing_annotations() {
        let job = descriptor(Observation {
            name: "pygeoapi-job-xyz",
            status: JobStatus::Accepted,
            ..Default::default()
        });
        assert_eq!(job.identifier, "xyz");
        assert!(job.start_time.is_none());
        assert!(job.parameters.is_empty());
        assert_eq!(job.message, "");
    }
}
