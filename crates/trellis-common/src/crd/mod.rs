//! Custom Resource Definitions read by the policy engine

mod access_policy;
mod cluster;
mod destination;
mod failover_service;
mod mesh;
mod traffic_policy;
mod types;
mod virtual_mesh;
mod workload;

pub use access_policy::{AccessPolicy, AccessPolicySpec, AccessPolicyStatus};
pub use cluster::{KubernetesCluster, KubernetesClusterSpec};
pub use destination::{
    AppliedAccessPolicy, AppliedTrafficPolicy, Destination, DestinationSpec, DestinationStatus,
    KubeService, KubeServicePort,
};
pub use failover_service::{
    FailoverPort, FailoverService, FailoverServiceSpec, FailoverServiceStatus,
};
pub use mesh::{
    AppMeshInstance, AppliedFailoverService, AppliedVirtualMesh, IstioMesh, Mesh,
    MeshInstallation, MeshSpec, MeshStatus, MeshType, OsmMesh,
};
pub use traffic_policy::{
    CorsPolicy, FaultInjection, HeaderManipulation, HeaderMatcher, HttpMatcher, Mirror,
    MtlsSettings, OutlierDetection, QueryParameterMatcher, RetryPolicy, StringMatch, TlsMode,
    TrafficPolicy, TrafficPolicyAction, TrafficPolicySpec, TrafficPolicyStatus, TrafficShift,
    WeightedDestination,
};
pub use types::{aggregate_state, AppliedPolicy, ApprovalState, ApprovalStatus};
pub use virtual_mesh::{
    GeneratedRootCa, GlobalAccessPolicy, LimitedTrust, MtlsConfig, RootCertificateAuthority,
    SharedTrust, TrustModel, VirtualMesh, VirtualMeshSpec, VirtualMeshStatus,
};
pub use workload::{AppMeshWorkload, KubernetesWorkload, Workload, WorkloadSpec};

/// Decode a manifest fragment the way the API server hands it to kube: YAML
/// to a JSON value, then serde_json into the typed record
#[cfg(test)]
pub(crate) fn from_yaml<T: serde::de::DeserializeOwned>(yaml: &str) -> T {
    let value: serde_json::Value = serde_yaml::from_str(yaml).unwrap();
    serde_json::from_value(value).unwrap()
}
