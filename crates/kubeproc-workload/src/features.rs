//! Optional pod features and their fragments
//!
//! Every feature function is pure. Secret discovery is the only feature that
//! needs the cluster and goes through [`SecretLister`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, EmptyDirVolumeSource, EnvFromSource, EnvVar, EnvVarSource,
    PersistentVolumeClaimVolumeSource, ResourceRequirements, SecretEnvSource, SecretKeySelector,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubeproc_common::Result;

use crate::fragment::ResourceFragment;

/// Home directory of the workload user
pub const CONTAINER_HOME: &str = "/home/jovyan";
/// uid owning the object store mount
pub const MOUNT_UID: &str = "1000";
/// gid owning the object store mount
pub const MOUNT_GID: &str = "100";

const HOME_VOLUME: &str = "home";
const S3_VOLUME: &str = "s3-user-bucket";
const S3_MOUNTER_IMAGE: &str = "totycro/s3fs:0.7.0-1.90";
const GIT_SYNC_VOLUME: &str = "git-sync-mount";
const GIT_SYNC_IMAGE: &str = "k8s.gcr.io/git-sync:v3.1.6";
const GIT_CHECKOUT_DIR: &str = "algorithm";

// Sidecars cannot see when the primary container ends (no native sidecar
// support), so the mounter polls for the shell of the primary container.
const S3_MOUNTER_SCRIPT: &str = concat!(
    "echo \"`date` waiting for job start\"; ",
    "sleep 3; echo \"`date` job start assumed\"; ",
    "while pgrep -x bash >/dev/null; do sleep 1; done; ",
    "echo \"`date` job end detected\"; ",
);

/// Additional persistent volume claim
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExtraPvc {
    /// Claim to mount
    pub claim_name: String,
    /// Mount path in the primary container
    pub mount_path: String,
}

/// Object store bucket mounted through an s3fs sidecar
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ObjectStore {
    /// Bucket to mount
    pub bucket_name: String,
    /// Secret with `username` and `password` keys
    pub secret_name: String,
    /// Object store endpoint
    pub s3_url: String,
    /// Mount path in the primary container
    #[serde(default = "default_s3_mount_path")]
    pub mount_path: String,
}

fn default_s3_mount_path() -> String {
    format!("{}/s3", CONTAINER_HOME)
}

/// Secret mounted as files under `/secret/<name>`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SecretMount {
    /// Secret name
    pub name: String,
}

/// Git repository checked out before the primary container starts
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GitCheckout {
    /// Repository URL
    pub url: String,
    /// Secret with `username` and `password` keys
    pub secret_name: String,
}

/// Secrets whose keys are exposed as environment variables
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SecretDiscovery {
    /// Label selector matching the secrets
    pub label_selector: String,
}

/// ConfigMaps and Secrets shared as environment by every job
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SharedEnvironment {
    /// ConfigMap names
    #[serde(default)]
    pub config_maps: Vec<String>,
    /// Secret names
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Deployment-level feature configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Features {
    /// PVC mounted as the user home
    pub home_volume_claim_name: Option<String>,
    /// Additional PVCs
    pub extra_pvcs: Vec<ExtraPvc>,
    /// Raw pod volumes
    pub extra_volumes: Vec<Volume>,
    /// Raw mounts for the primary container
    pub extra_volume_mounts: Vec<VolumeMount>,
    /// Object store mount
    pub s3: Option<ObjectStore>,
    /// Secrets mounted as files
    pub secrets: Vec<SecretMount>,
    /// Secrets discovered by label and exposed as environment
    pub auto_secrets: Option<SecretDiscovery>,
    /// Git checkout
    pub checkout_git_repo: Option<GitCheckout>,
    /// Shared environment sources
    pub shared_environment: Option<SharedEnvironment>,
}

/// Lists secrets in the job namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretLister: Send + Sync {
    /// Names of the secrets matching a label selector
    async fn list_secret_names(&self, label_selector: &str) -> Result<Vec<String>>;
}

/// Mount a PVC as the user home
pub fn home_volume(claim_name: &str) -> ResourceFragment {
    ResourceFragment {
        volumes: vec![pvc_volume(HOME_VOLUME, claim_name)],
        volume_mounts: vec![mount(HOME_VOLUME, CONTAINER_HOME)],
        ..Default::default()
    }
}

/// Mount an extra PVC; `num` keeps volume names unique
pub fn extra_pvc(pvc: &ExtraPvc, num: usize) -> ResourceFragment {
    let name = format!("extra-{}", num);
    ResourceFragment {
        volumes: vec![pvc_volume(&name, &pvc.claim_name)],
        volume_mounts: vec![mount(&name, &pvc.mount_path)],
        ..Default::default()
    }
}

/// Add a raw volume to the pod
pub fn extra_volume(volume: &Volume) -> ResourceFragment {
    ResourceFragment {
        volumes: vec![volume.clone()],
        ..Default::default()
    }
}

/// Add a raw mount to the primary container
pub fn extra_volume_mount(volume_mount: &VolumeMount) -> ResourceFragment {
    ResourceFragment {
        volume_mounts: vec![volume_mount.clone()],
        ..Default::default()
    }
}

/// Mount an object store bucket through a privileged s3fs sidecar.
///
/// The bucket is mounted into a shared emptyDir with bidirectional
/// propagation so the primary container sees it.
pub fn object_store(store: &ObjectStore) -> ResourceFragment {
    let mounter = Container {
        name: "s3mounter".to_string(),
        image: Some(S3_MOUNTER_IMAGE.to_string()),
        args: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            S3_MOUNTER_SCRIPT.to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: S3_VOLUME.to_string(),
            mount_path: "/opt/s3fs/bucket".to_string(),
            mount_propagation: Some("Bidirectional".to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(quantities(&[("cpu", "0.2"), ("memory", "512Mi")])),
            requests: Some(quantities(&[("cpu", "0.05"), ("memory", "32Mi")])),
            ..Default::default()
        }),
        env: Some(vec![
            env("S3FS_ARGS", "-oallow_other"),
            env("UID", MOUNT_UID),
            env("GID", MOUNT_GID),
            secret_env("AWS_S3_ACCESS_KEY_ID", &store.secret_name, "username"),
            secret_env("AWS_S3_SECRET_ACCESS_KEY", &store.secret_name, "password"),
            env("AWS_S3_BUCKET", &store.bucket_name),
            // shared process namespace: tini is not PID 1
            env("TINI_SUBREAPER", "1"),
            env("AWS_S3_URL", &store.s3_url),
        ]),
        ..Default::default()
    };

    ResourceFragment {
        containers: vec![mounter],
        volumes: vec![empty_dir_volume(S3_VOLUME)],
        volume_mounts: vec![VolumeMount {
            name: S3_VOLUME.to_string(),
            mount_path: store.mount_path.clone(),
            mount_propagation: Some("HostToContainer".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Mount a secret as files under `/secret/<name>`
pub fn secret_mount(secret_name: &str, num: usize) -> ResourceFragment {
    let volume_name = format!("secret-{}", num);
    ResourceFragment {
        volumes: vec![Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }],
        volume_mounts: vec![mount(&volume_name, &format!("/secret/{}", secret_name))],
        ..Default::default()
    }
}

/// Expose every key of the given secrets as environment variables
pub fn auto_secrets(secret_names: &[String]) -> ResourceFragment {
    ResourceFragment {
        env_from: secret_names.iter().map(|s| secret_env_from(s)).collect(),
        ..Default::default()
    }
}

/// Clone a repository with a one-shot git-sync init container.
///
/// The checkout lands in `~/git/algorithm`; a revision pins the checkout.
pub fn git_checkout(repo: &GitCheckout, git_revision: Option<&str>) -> ResourceFragment {
    let mut env_vars = vec![
        env("GIT_SYNC_REPO", &repo.url),
        env("GIT_SYNC_DEST", GIT_CHECKOUT_DIR),
        env("GIT_SYNC_ONE_TIME", "true"),
        secret_env("GIT_SYNC_USERNAME", &repo.secret_name, "username"),
        secret_env("GIT_SYNC_PASSWORD", &repo.secret_name, "password"),
    ];
    if let Some(rev) = git_revision {
        env_vars.push(env("GIT_SYNC_REV", rev));
    }

    let init = Container {
        name: "git-sync".to_string(),
        image: Some(GIT_SYNC_IMAGE.to_string()),
        volume_mounts: Some(vec![mount(GIT_SYNC_VOLUME, "/tmp/git")]),
        env: Some(env_vars),
        ..Default::default()
    };

    ResourceFragment {
        init_containers: vec![init],
        volumes: vec![empty_dir_volume(GIT_SYNC_VOLUME)],
        volume_mounts: vec![mount(GIT_SYNC_VOLUME, &format!("{}/git", CONTAINER_HOME))],
        ..Default::default()
    }
}

/// Expose shared ConfigMaps and Secrets as environment
pub fn shared_environment(shared: &SharedEnvironment) -> ResourceFragment {
    let config_maps = shared.config_maps.iter().map(|name| EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    });
    let secrets = shared.secrets.iter().map(|name| secret_env_from(name));

    ResourceFragment {
        env_from: config_maps.chain(secrets).collect(),
        ..Default::default()
    }
}

/// Look up secrets by label and expose them as environment.
///
/// No matching secret yields the identity fragment.
pub async fn discover_secrets(
    lister: &dyn SecretLister,
    label_selector: &str,
) -> Result<ResourceFragment> {
    let names = lister.list_secret_names(label_selector).await?;
    debug!(selector = %label_selector, count = names.len(), "discovered secrets");
    Ok(auto_secrets(&names))
}

/// Build every enabled feature and merge them in the fixed feature order
pub async fn compose(
    features: &Features,
    lister: &dyn SecretLister,
    git_revision: Option<&str>,
) -> Result<ResourceFragment> {
    let mut fragments = Vec::new();

    if let Some(claim) = &features.home_volume_claim_name {
        fragments.push(home_volume(claim));
    }
    fragments.extend(
        features
            .extra_pvcs
            .iter()
            .enumerate()
            .map(|(num, pvc)| extra_pvc(pvc, num)),
    );
    fragments.extend(features.extra_volumes.iter().map(extra_volume));
    fragments.extend(features.extra_volume_mounts.iter().map(extra_volume_mount));
    if let Some(store) = &features.s3 {
        fragments.push(object_store(store));
    }
    fragments.extend(
        features
            .secrets
            .iter()
            .enumerate()
            .map(|(num, secret)| secret_mount(&secret.name, num)),
    );
    if let Some(discovery) = &features.auto_secrets {
        fragments.push(discover_secrets(lister, &discovery.label_selector).await?);
    }
    if let Some(repo) = &features.checkout_git_repo {
        fragments.push(git_checkout(repo, git_revision));
    }
    if let Some(shared) = &features.shared_environment {
        fragments.push(shared_environment(shared));
    }

    Ok(ResourceFragment::concat(fragments))
}

fn pvc_volume(name: &str, claim_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub(crate) fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_env_from(secret_name: &str) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: secret_name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(values: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    values
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObjectStore {
        ObjectStore {
            bucket_name: "bucket".to_string(),
            secret_name: "s3-creds".to_string(),
            s3_url: "https://s3.example.com".to_string(),
            mount_path: default_s3_mount_path(),
        }
    }

    fn repo() -> GitCheckout {
        GitCheckout {
            url: "https://git.example.com/algo.git".to_string(),
            secret_name: "git-creds".to_string(),
        }
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn extra_pvcs_get_numbered_volume_names() {
        let pvc = ExtraPvc {
            claim_name: "data".to_string(),
            mount_path: "/data".to_string(),
        };
        let fragment = extra_pvc(&pvc, 2);
        assert_eq!(fragment.volumes[0].name, "extra-2");
        assert_eq!(
            fragment.volumes[0]
                .persistent_volume_claim
                .as_ref()
                .map(|p| p.claim_name.as_str()),
            Some("data")
        );
        assert_eq!(fragment.volume_mounts[0].mount_path, "/data");
    }

    #[test]
    fn object_store_adds_mounter_sidecar() {
        let fragment = object_store(&store());
        assert_eq!(fragment.container_names(), vec!["s3mounter"]);
        let mounter = &fragment.containers[0];
        assert_eq!(env_value(mounter, "AWS_S3_BUCKET"), Some("bucket"));
        assert_eq!(
            mounter.security_context.as_ref().and_then(|s| s.privileged),
            Some(true)
        );
        assert_eq!(
            fragment.volume_mounts[0].mount_propagation.as_deref(),
            Some("HostToContainer")
        );
        assert_eq!(fragment.volume_mounts[0].mount_path, "/home/jovyan/s3");
    }

    #[test]
    fn secret_mount_uses_secret_directory() {
        let fragment = secret_mount("db-creds", 0);
        assert_eq!(fragment.volumes[0].name, "secret-0");
        assert_eq!(fragment.volume_mounts[0].mount_path, "/secret/db-creds");
    }

    #[test]
    fn git_checkout_pins_revision_only_when_given() {
        let pinned = git_checkout(&repo(), Some("v1.2"));
        assert_eq!(env_value(&pinned.init_containers[0], "GIT_SYNC_REV"), Some("v1.2"));

        let floating = git_checkout(&repo(), None);
        assert_eq!(env_value(&floating.init_containers[0], "GIT_SYNC_REV"), None);
        assert!(floating.containers.is_empty());
    }

    #[test]
    fn shared_environment_lists_config_maps_before_secrets() {
        let fragment = shared_environment(&SharedEnvironment {
            config_maps: vec!["common".to_string()],
            secrets: vec!["tokens".to_string()],
        });
        assert_eq!(fragment.env_from.len(), 2);
        assert!(fragment.env_from[0].config_map_ref.is_some());
        assert!(fragment.env_from[1].secret_ref.is_some());
    }

    #[tokio::test]
    async fn no_discovered_secrets_is_identity() {
        let mut lister = MockSecretLister::new();
        lister
            .expect_list_secret_names()
            .withf(|selector| selector == "owner=kubeproc")
            .times(1)
            .returning(|_| Ok(vec![]));

        let fragment = discover_secrets(&lister, "owner=kubeproc").await.unwrap();
        assert!(fragment.is_empty());
    }

    #[tokio::test]
    async fn discovered_secrets_become_env_sources() {
        let mut lister = MockSecretLister::new();
        lister
            .expect_list_secret_names()
            .returning(|_| Ok(vec!["a".to_string(), "b".to_string()]));

        let fragment = discover_secrets(&lister, "owner=kubeproc").await.unwrap();
        let names: Vec<_> = fragment
            .env_from
            .iter()
            .filter_map(|e| e.secret_ref.as_ref().map(|s| s.name.as_str()))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn compose_without_features_is_identity() {
        let lister = MockSecretLister::new();
        let fragment = compose(&Features::default(), &lister, None).await.unwrap();
        assert!(fragment.is_empty());
    }

    #[tokio::test]
    async fn compose_follows_feature_order() {
        let mut lister = MockSecretLister::new();
        lister
            .expect_list_secret_names()
            .returning(|_| Ok(vec!["auto".to_string()]));

        let features = Features {
            home_volume_claim_name: Some("home-claim".to_string()),
            extra_pvcs: vec![ExtraPvc {
                claim_name: "data".to_string(),
                mount_path: "/data".to_string(),
            }],
            s3: Some(store()),
            secrets: vec![SecretMount {
                name: "db".to_string(),
            }],
            auto_secrets: Some(SecretDiscovery {
                label_selector: "owner=kubeproc".to_string(),
            }),
            checkout_git_repo: Some(repo()),
            shared_environment: Some(SharedEnvironment {
                config_maps: vec!["common".to_string()],
                secrets: vec![],
            }),
            ..Default::default()
        };

        let fragment = compose(&features, &lister, Some("main")).await.unwrap();

        let volumes: Vec<_> = fragment.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            volumes,
            vec!["home", "extra-0", S3_VOLUME, "secret-0", GIT_SYNC_VOLUME]
        );
        assert_eq!(fragment.container_names(), vec!["s3mounter"]);
        assert_eq!(fragment.init_containers[0].name, "git-sync");
        assert!(fragment.env_from[0].secret_ref.is_some());
        assert!(fragment.env_from[1].config_map_ref.is_some());
    }
}
