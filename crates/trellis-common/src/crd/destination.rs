//! Destination CRD: a routable service discovered in one of the clusters

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::access_policy::AccessPolicySpec;
use super::traffic_policy::TrafficPolicySpec;
use super::types::AppliedPolicy;
use crate::identity::{ClusterObjectRef, ObjectRef};

/// Spec for a Destination, written by discovery
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "discovery.trellis.dev",
    version = "v1alpha1",
    kind = "Destination",
    plural = "destinations",
    shortname = "dest",
    namespaced,
    status = "DestinationStatus",
    printcolumn = r#"{"name":"FQDN","type":"string","jsonPath":".status.localFqdn"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    /// The Kubernetes Service backing this destination
    pub kube_service: KubeService,

    /// Mesh that manages the service's workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<ObjectRef>,
}

/// A Kubernetes Service as seen by discovery
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeService {
    /// The Service object in its own cluster
    #[serde(rename = "ref")]
    pub reference: ClusterObjectRef,

    /// Pod selector of the Service
    #[serde(default)]
    pub workload_selector_labels: BTreeMap<String, String>,

    /// Labels on the Service object
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Ports exposed by the Service
    #[serde(default)]
    pub ports: Vec<KubeServicePort>,

    /// Label keys of backing pods and their observed values
    #[serde(default)]
    pub subsets: BTreeMap<String, Vec<String>>,
}

/// A Service port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeServicePort {
    /// Port number
    pub port: u32,
    /// Port name
    #[serde(default)]
    pub name: String,
    /// Protocol (TCP, UDP)
    #[serde(default)]
    pub protocol: String,
}

/// A TrafficPolicy applied to a Destination
pub type AppliedTrafficPolicy = AppliedPolicy<TrafficPolicySpec>;

/// An AccessPolicy applied to a Destination
pub type AppliedAccessPolicy = AppliedPolicy<AccessPolicySpec>;

/// Status for a Destination
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatus {
    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// Traffic policies in acceptance order
    #[serde(default)]
    pub applied_traffic_policies: Vec<AppliedTrafficPolicy>,

    /// Access policies in identity order
    #[serde(default)]
    pub applied_access_policies: Vec<AppliedAccessPolicy>,

    /// Cluster-local hostname of the service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_fqdn: String,
}

impl Destination {
    /// The backing Service reference
    pub fn service_ref(&self) -> &ClusterObjectRef {
        &self.spec.kube_service.reference
    }

    /// Traffic policies applied in the last committed pass
    pub fn applied_traffic_policies(&self) -> &[AppliedTrafficPolicy] {
        self.status
            .as_ref()
            .map(|s| s.applied_traffic_policies.as_slice())
            .unwrap_or_default()
    }

    /// Access policies applied in the last committed pass
    pub fn applied_access_policies(&self) -> &[AppliedAccessPolicy] {
        self.status
            .as_ref()
            .map(|s| s.applied_access_policies.as_slice())
            .unwrap_or_default()
    }

    /// `<service>.<namespace>.svc.<cluster domain>`
    pub fn local_fqdn(&self, cluster_domain: &str) -> String {
        let svc = self.service_ref();
        format!("{}.{}.svc.{}", svc.name, svc.namespace, cluster_domain)
    }

    /// First declared Service port
    pub fn first_port(&self) -> Option<u32> {
        self.spec.kube_service.ports.first().map(|p| p.port)
    }
}
