//! Typed view over an inbound request map

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use kubeproc_common::{Error, Result};

/// Keys interpreted by the engine; everything else is a process parameter
pub const RESERVED_KEYS: [&str; 9] = [
    "image",
    "node_purpose",
    "run_on_fargate",
    "cpu_limit",
    "mem_limit",
    "cpu_requests",
    "mem_requests",
    "result_data_directory",
    "git_revision",
];

/// Parsed request parameters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestParameters {
    /// Image override
    pub image: Option<String>,
    /// Placement hint
    pub node_purpose: Option<String>,
    /// Serverless placement
    pub run_on_fargate: bool,
    /// CPU limit
    pub cpu_limit: Option<String>,
    /// Memory limit
    pub mem_limit: Option<String>,
    /// CPU request
    pub cpu_requests: Option<String>,
    /// Memory request
    pub mem_requests: Option<String>,
    /// Directory for result data; `{job_name}` is expanded
    pub result_data_directory: Option<String>,
    /// Revision for the git checkout
    pub git_revision: Option<String>,
    /// Everything else, passed to the process
    pub process_parameters: BTreeMap<String, String>,
}

impl RequestParameters {
    /// Split a request map into engine settings and process parameters.
    ///
    /// Empty values count as absent.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();

        let run_on_fargate = match get("run_on_fargate") {
            None => false,
            Some(v) => parse_bool(&v).ok_or_else(|| {
                Error::client_field(
                    "run_on_fargate",
                    format!("expected true or false, got {:?}", v),
                )
            })?,
        };

        let process_parameters = map
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            image: get("image"),
            node_purpose: get("node_purpose"),
            run_on_fargate,
            cpu_limit: get("cpu_limit"),
            mem_limit: get("mem_limit"),
            cpu_requests: get("cpu_requests"),
            mem_requests: get("mem_requests"),
            result_data_directory: get("result_data_directory"),
            git_revision: get("git_revision"),
            process_parameters,
        })
    }

    /// Resource requirements for the primary container, if any were requested
    pub fn resources(&self) -> Option<ResourceRequirements> {
        let limits = quantities(&[("cpu", &self.cpu_limit), ("memory", &self.mem_limit)]);
        let requests = quantities(&[("cpu", &self.cpu_requests), ("memory", &self.mem_requests)]);
        if limits.is_none() && requests.is_none() {
            return None;
        }
        Some(ResourceRequirements {
            limits,
            requests,
            ..Default::default()
        })
    }

    /// Result directory with `{job_name}` expanded.
    ///
    /// Only the last path component is kept so a request cannot escape the
    /// result root.
    pub fn result_directory_for(&self, job_name: &str) -> Option<String> {
        let expanded = self
            .result_data_directory
            .as_deref()?
            .replace("{job_name}", job_name);
        expanded
            .rsplit('/')
            .find(|c| !c.is_empty() && *c != "." && *c != "..")
            .map(str::to_string)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn quantities(values: &[(&str, &Option<String>)]) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<_, _> = values
        .iter()
        .filter_map(|&(k, v)| v.clone().map(|v| (k.to_string(), Quantity(v))))
        .collect();
    (!map.is_empty()).then_some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn splits_engine_settings_from_process_parameters() {
        let req = RequestParameters::from_map(&map(&[
            ("image", "eurodatacube/jupyter-user:1"),
            ("node_purpose", "g2"),
            ("git_revision", "main"),
            ("inpfile", "test2.txt"),
        ]))
        .unwrap();

        assert_eq!(req.image.as_deref(), Some("eurodatacube/jupyter-user:1"));
        assert_eq!(req.node_purpose.as_deref(), Some("g2"));
        assert_eq!(req.git_revision.as_deref(), Some("main"));
        assert!(!req.run_on_fargate);
        assert_eq!(req.process_parameters, map(&[("inpfile", "test2.txt")]));
    }

    #[test]
    fn malformed_fargate_flag_names_field() {
        let err = RequestParameters::from_map(&map(&[("run_on_fargate", "maybe")])).unwrap_err();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("[run_on_fargate]"));
    }

    #[test]
    fn fargate_flag_accepts_common_spellings() {
        let req = RequestParameters::from_map(&map(&[("run_on_fargate", "True")])).unwrap();
        assert!(req.run_on_fargate);
    }

    #[test]
    fn resources_only_when_requested() {
        let req = RequestParameters::from_map(&map(&[])).unwrap();
        assert!(req.resources().is_none());

        let req = RequestParameters::from_map(&map(&[("mem_limit", "2Gi")])).unwrap();
        let resources = req.resources().unwrap();
        assert_eq!(
            resources.limits.unwrap().get("memory"),
            Some(&Quantity("2Gi".to_string()))
        );
        assert!(resources.requests.is_none());
    }

    #[test]
    fn result_directory_is_confined() {
        let req = RequestParameters::from_map(&map(&[(
            "result_data_directory",
            "../../etc/{job_name}",
        )]))
        .unwrap();
        assert_eq!(
            req.result_directory_for("pygeoapi-job-abc").as_deref(),
            Some("pygeoapi-job-abc")
        );
    }
}
