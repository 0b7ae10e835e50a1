//! Per-deployment execution policy
//!
//! Requests may pick an image, a node purpose and serverless placement. Each
//! choice is checked against the deployment's allow-lists; violations are
//! client errors that name the field and the allowed pattern.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Toleration,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use kubeproc_common::{Error, Result};

/// Pod label set on serverless placements
pub const FARGATE_LABEL: (&str, &str) = ("runtime", "fargate");

/// Regex that must match a whole value
#[derive(Clone, Debug)]
pub struct AllowList {
    pattern: String,
    regex: Regex,
}

impl AllowList {
    /// Compile a pattern; it is anchored at both ends
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            Error::internal_with_context(
                "policy",
                format!("invalid allow-list pattern {:?}: {}", pattern, e),
            )
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Whether the whole value matches
    pub fn allows(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// Client error naming `field` unless the value matches
    pub fn check(&self, field: &str, value: &str) -> Result<()> {
        if self.allows(value) {
            Ok(())
        } else {
            Err(Error::client_field(
                field,
                format!("{} {:?} not allowed, only {:?}", field, value, self.pattern),
            ))
        }
    }
}

/// Policy as written in the deployment configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PolicyConfig {
    /// Images a request may select
    pub allowed_images_regex: String,
    /// Node purpose used when the request names none
    pub default_node_purpose: String,
    /// Node purposes a request may select
    pub allowed_node_purposes_regex: String,
    /// Node label carrying the purpose
    #[serde(default = "default_node_purpose_label_key")]
    pub node_purpose_label_key: String,
    /// Tolerations added to every pod
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Whether serverless placement may be requested
    #[serde(default)]
    pub allow_fargate: bool,
}

fn default_node_purpose_label_key() -> String {
    "hub.eox.at/node-purpose".to_string()
}

/// Scheduling constraints for one pod
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Placement {
    /// Required node affinity, absent for serverless placement
    pub affinity: Option<Affinity>,
    /// Tolerations from the policy
    pub tolerations: Vec<Toleration>,
    /// Extra pod labels
    pub labels: BTreeMap<String, String>,
}

/// Compiled [`PolicyConfig`]
#[derive(Clone, Debug)]
pub struct ExecutionPolicy {
    images: AllowList,
    node_purposes: AllowList,
    default_node_purpose: String,
    node_purpose_label_key: String,
    tolerations: Vec<Toleration>,
    allow_fargate: bool,
}

impl ExecutionPolicy {
    /// Compile the allow-lists of a policy configuration
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            images: AllowList::new(&config.allowed_images_regex)?,
            node_purposes: AllowList::new(&config.allowed_node_purposes_regex)?,
            default_node_purpose: config.default_node_purpose.clone(),
            node_purpose_label_key: config.node_purpose_label_key.clone(),
            tolerations: config.tolerations.clone(),
            allow_fargate: config.allow_fargate,
        })
    }

    /// Reject images outside the allow-list
    pub fn validate_image(&self, image: &str) -> Result<()> {
        self.images.check("image", image)
    }

    /// Scheduling constraints for a request.
    ///
    /// An empty node purpose falls back to the default, which is trusted and
    /// not matched against the allow-list.
    pub fn placement(&self, node_purpose: Option<&str>, run_on_fargate: bool) -> Result<Placement> {
        if run_on_fargate {
            if !self.allow_fargate {
                return Err(Error::client_field(
                    "run_on_fargate",
                    "run_on_fargate is not allowed on this deployment",
                ));
            }
            return Ok(Placement {
                affinity: None,
                tolerations: self.tolerations.clone(),
                labels: BTreeMap::from([(
                    FARGATE_LABEL.0.to_string(),
                    FARGATE_LABEL.1.to_string(),
                )]),
            });
        }

        let purpose = match node_purpose.filter(|p| !p.is_empty()) {
            Some(requested) => {
                self.node_purposes.check("node_purpose", requested)?;
                requested
            }
            None => self.default_node_purpose.as_str(),
        };

        Ok(Placement {
            affinity: Some(self.node_affinity(purpose)),
            tolerations: self.tolerations.clone(),
            labels: BTreeMap::new(),
        })
    }

    fn node_affinity(&self, purpose: &str) -> Affinity {
        Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: self.node_purpose_label_key.clone(),
                            operator: "In".to_string(),
                            values: Some(vec![purpose.to_string()]),
                        }]),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
