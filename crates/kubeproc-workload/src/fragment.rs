//! Composable pod spec pieces

use k8s_openapi::api::core::v1::{Container, EnvFromSource, Volume, VolumeMount};

/// Pod spec additions contributed by one optional feature.
///
/// Fragments form a monoid under [`ResourceFragment::merge`] with
/// `ResourceFragment::default()` as identity. Every list is concatenated, so
/// sidecar containers keep feature order. The primary container is never
/// part of a fragment: the manifest builder places it first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceFragment {
    /// Containers run to completion before the primary container
    pub init_containers: Vec<Container>,
    /// Sidecars running next to the primary container
    pub containers: Vec<Container>,
    /// Pod volumes
    pub volumes: Vec<Volume>,
    /// Mounts applied to the primary container
    pub volume_mounts: Vec<VolumeMount>,
    /// Environment sources applied to the primary container
    pub env_from: Vec<EnvFromSource>,
}

impl ResourceFragment {
    /// Appends all lists of `other` after the lists of `self`
    pub fn merge(mut self, other: ResourceFragment) -> ResourceFragment {
        self.init_containers.extend(other.init_containers);
        self.containers.extend(other.containers);
        self.volumes.extend(other.volumes);
        self.volume_mounts.extend(other.volume_mounts);
        self.env_from.extend(other.env_from);
        self
    }

    /// Left fold of [`merge`](Self::merge) starting from the identity
    pub fn concat<I>(fragments: I) -> ResourceFragment
    where
        I: IntoIterator<Item = ResourceFragment>,
    {
        fragments
            .into_iter()
            .fold(ResourceFragment::default(), ResourceFragment::merge)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.init_containers.is_empty()
            && self.containers.is_empty()
            && self.volumes.is_empty()
            && self.volume_mounts.is_empty()
            && self.env_from.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn container_names(&self) -> Vec<&str> {
        self.containers.iter().map(|c| c.name.as_str()).collect()
    }
}
