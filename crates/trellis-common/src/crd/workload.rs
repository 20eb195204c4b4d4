//! Workload CRD: a discovered pod controller participating in a mesh

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::identity::{ClusterObjectRef, ObjectRef};

/// Spec for a Workload, written by discovery
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "discovery.trellis.dev",
    version = "v1alpha1",
    kind = "Workload",
    plural = "workloads",
    shortname = "wl",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// The Kubernetes controller running the pods
    pub kubernetes: KubernetesWorkload,

    /// Mesh the pods are enrolled in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<ObjectRef>,

    /// App Mesh virtual node backing this workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_mesh: Option<AppMeshWorkload>,
}

/// Kubernetes side of a workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesWorkload {
    /// Deployment, StatefulSet or DaemonSet owning the pods
    pub controller: ClusterObjectRef,
    /// Labels on the pod template
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,
    /// Service account the pods run as
    #[serde(default)]
    pub service_account_name: String,
}

/// App Mesh virtual node of a workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppMeshWorkload {
    /// Name of the VirtualNode
    pub virtual_node_name: String,
    /// Ports the node listens on
    #[serde(default)]
    pub ports: Vec<u32>,
}

impl Workload {
    /// Identity of the pods' service account in their own cluster
    pub fn service_account(&self) -> ClusterObjectRef {
        let k = &self.spec.kubernetes;
        ClusterObjectRef::new(
            &k.service_account_name,
            &k.controller.namespace,
            &k.controller.cluster_name,
        )
    }
}
