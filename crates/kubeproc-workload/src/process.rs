//! Container process: the primary container and the pod around it

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, LocalObjectReference, PodSpec};
use serde::{Deserialize, Serialize};

use kubeproc_common::annotations::{format_annotation_key, PROGRESS};
use kubeproc_common::Result;

use crate::features::{env, Features, CONTAINER_HOME};
use crate::fragment::ResourceFragment;
use crate::policy::{ExecutionPolicy, Placement, PolicyConfig};
use crate::request::RequestParameters;

/// Name of the primary container, always the first container of the pod
pub const PRIMARY_CONTAINER: &str = "job";

/// Deployment configuration of a container process
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProcessConfig {
    /// Image used unless the request selects another
    pub default_image: String,
    /// Command of the primary container; the image default if empty
    #[serde(default)]
    pub command: Vec<String>,
    /// Image and placement policy
    #[serde(flatten)]
    pub policy: PolicyConfig,
    /// Pull secret for private images
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    /// Service account the pod runs as
    #[serde(default)]
    pub service_account: Option<String>,
    /// Environment variable name → process parameter key
    #[serde(default)]
    pub parameters_env: BTreeMap<String, String>,
    /// Directory the workload writes its result artifact to
    #[serde(default)]
    pub output_directory: Option<String>,
    /// File name of the result artifact; `{job_name}` is expanded
    #[serde(default = "default_result_file_template")]
    pub result_file_template: String,
    /// Base URL under which result artifacts are published
    #[serde(default)]
    pub result_link_base: Option<String>,
    /// Optional pod features
    #[serde(default)]
    pub features: Features,
}

fn default_result_file_template() -> String {
    "{job_name}.ipynb".to_string()
}

/// Where a job's result artifact lives
#[derive(Clone, Debug, PartialEq)]
pub struct ResultArtifact {
    /// Local path written by the workload
    pub path: String,
    /// Caller-facing link, if a link base is configured
    pub link: Option<String>,
}

/// Pod spec plus the pod labels it needs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodBlueprint {
    /// Pod spec with the primary container first
    pub spec: PodSpec,
    /// Pod template labels
    pub labels: BTreeMap<String, String>,
}

/// A [`ProcessConfig`] with its policy compiled
#[derive(Clone, Debug)]
pub struct ContainerProcess {
    config: ProcessConfig,
    policy: ExecutionPolicy,
}

impl ContainerProcess {
    /// Compile the policy of a process configuration
    pub fn new(config: ProcessConfig) -> Result<Self> {
        let policy = ExecutionPolicy::new(&config.policy)?;
        Ok(Self { config, policy })
    }

    /// The configuration this process was built from
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Result artifact location for a job, if an output directory is set
    pub fn result_artifact(&self, job_name: &str) -> Option<ResultArtifact> {
        let dir = self.config.output_directory.as_deref()?;
        let file = self.config.result_file_template.replace("{job_name}", job_name);
        let path = format!("{}/{}", dir.trim_end_matches('/'), file);

        let link = self.config.result_link_base.as_deref().map(|base| {
            let home = format!("{}/", CONTAINER_HOME);
            let relative = path.strip_prefix(&home).unwrap_or(path.trim_start_matches('/'));
            format!("{}/{}", base.trim_end_matches('/'), relative)
        });

        Some(ResultArtifact { path, link })
    }

    /// Validate a request and build the pod for it.
    ///
    /// Policy violations are client errors; nothing is created here.
    pub fn pod(
        &self,
        request: &RequestParameters,
        fragment: ResourceFragment,
        job_name: &str,
    ) -> Result<PodBlueprint> {
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        self.policy.validate_image(&image)?;

        let Placement {
            affinity,
            tolerations,
            labels,
        } = self
            .policy
            .placement(request.node_purpose.as_deref(), request.run_on_fargate)?;

        let primary = Container {
            name: PRIMARY_CONTAINER.to_string(),
            image: Some(image),
            command: non_empty(self.config.command.clone()),
            env: Some(self.primary_env(request, job_name)?),
            env_from: non_empty(fragment.env_from),
            volume_mounts: non_empty(fragment.volume_mounts),
            resources: request.resources(),
            ..Default::default()
        };

        let mut containers = vec![primary];
        containers.extend(fragment.containers);

        let spec = PodSpec {
            restart_policy: Some("Never".to_string()),
            containers,
            init_containers: non_empty(fragment.init_containers),
            volumes: non_empty(fragment.volumes),
            // sidecars must see the primary container exit
            share_process_namespace: Some(true),
            enable_service_links: Some(false),
            affinity,
            tolerations: non_empty(tolerations),
            image_pull_secrets: self.config.image_pull_secret.as_ref().map(|name| {
                vec![LocalObjectReference { name: name.clone() }]
            }),
            service_account_name: self.config.service_account.clone(),
            ..Default::default()
        };

        Ok(PodBlueprint { spec, labels })
    }

    fn primary_env(&self, request: &RequestParameters, job_name: &str) -> Result<Vec<EnvVar>> {
        let mut vars = vec![
            env("JOB_NAME", job_name),
            env("PROGRESS_ANNOTATION", &format_annotation_key(PROGRESS)),
            env(
                "PROCESS_PARAMETERS",
                &serde_json::to_string(&request.process_parameters)?,
            ),
        ];
        if let Some(dir) = request.result_directory_for(job_name) {
            vars.push(env("RESULT_DATA_DIRECTORY", &dir));
        }
        if let Some(artifact) = self.result_artifact(job_name) {
            vars.push(env("RESULT_PATH", &artifact.path));
        }
        for (var, key) in &self.config.parameters_env {
            if let Some(value) = request.process_parameters.get(key) {
                vars.push(env(var, value));
            }
        }
        Ok(vars)
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}
