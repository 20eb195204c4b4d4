//! Mesh CRD: a discovered service-mesh installation

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::failover_service::FailoverServiceSpec;
use super::types::AppliedPolicy;
use super::virtual_mesh::VirtualMeshSpec;

/// Spec for a Mesh, written by discovery
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "discovery.trellis.dev",
    version = "v1alpha1",
    kind = "Mesh",
    plural = "meshes",
    namespaced,
    status = "MeshStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MeshSpec {
    /// Mesh technology and its installation details
    pub mesh_type: MeshType,
}

/// Supported mesh technologies
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum MeshType {
    /// Istio control plane
    Istio(IstioMesh),
    /// Open Service Mesh (SMI)
    Osm(OsmMesh),
    /// AWS App Mesh
    AwsAppMesh(AppMeshInstance),
}

/// Where a mesh control plane runs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshInstallation {
    /// Control plane namespace
    pub namespace: String,
    /// Cluster hosting the control plane
    pub cluster: String,
    /// Control plane version
    #[serde(default)]
    pub version: String,
}

/// Istio installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IstioMesh {
    /// Control plane location
    pub installation: MeshInstallation,
    /// SPIFFE trust domain of the mesh
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,
}

fn default_trust_domain() -> String {
    crate::DEFAULT_CLUSTER_DOMAIN.to_string()
}

/// OSM installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OsmMesh {
    /// Control plane location
    pub installation: MeshInstallation,
}

/// AWS App Mesh instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppMeshInstance {
    /// Name of the App Mesh in AWS
    pub aws_name: String,
    /// AWS region
    pub region: String,
    /// AWS account owning the mesh
    #[serde(default)]
    pub aws_account_id: String,
    /// Clusters running workloads in this mesh
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// A VirtualMesh applied to a Mesh
pub type AppliedVirtualMesh = AppliedPolicy<VirtualMeshSpec>;

/// A FailoverService applied to a Mesh
pub type AppliedFailoverService = AppliedPolicy<FailoverServiceSpec>;

/// Status for a Mesh
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// The VirtualMesh that claimed this mesh, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_virtual_mesh: Option<AppliedVirtualMesh>,

    /// FailoverServices applied to this mesh
    #[serde(default)]
    pub applied_failover_services: Vec<AppliedFailoverService>,
}

impl Mesh {
    /// Short technology tag for logs and reports
    pub fn technology(&self) -> &'static str {
        match &self.spec.mesh_type {
            MeshType::Istio(_) => "istio",
            MeshType::Osm(_) => "osm",
            MeshType::AwsAppMesh(_) => "appmesh",
        }
    }

    /// Control plane installation, for meshes that run in a cluster
    pub fn installation(&self) -> Option<&MeshInstallation> {
        match &self.spec.mesh_type {
            MeshType::Istio(istio) => Some(&istio.installation),
            MeshType::Osm(osm) => Some(&osm.installation),
            MeshType::AwsAppMesh(_) => None,
        }
    }

    /// The VirtualMesh applied in the last committed pass
    pub fn applied_virtual_mesh(&self) -> Option<&AppliedVirtualMesh> {
        self.status
            .as_ref()
            .and_then(|s| s.applied_virtual_mesh.as_ref())
    }

    /// FailoverServices applied in the last committed pass
    pub fn applied_failover_services(&self) -> &[AppliedFailoverService] {
        self.status
            .as_ref()
            .map(|s| s.applied_failover_services.as_slice())
            .unwrap_or_default()
    }
}
