//! KubernetesCluster CRD: a cluster registered with the management plane

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec for a registered cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "multicluster.trellis.dev",
    version = "v1alpha1",
    kind = "KubernetesCluster",
    plural = "kubernetesclusters",
    shortname = "kc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClusterSpec {
    /// Secret holding the kubeconfig for this cluster
    pub secret_name: String,

    /// DNS suffix for Services (defaults to cluster.local)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
}

impl KubernetesClusterSpec {
    /// The configured cluster domain or the default
    pub fn domain(&self) -> &str {
        self.cluster_domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(crate::DEFAULT_CLUSTER_DOMAIN)
    }
}
