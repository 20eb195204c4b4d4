//! Fixtures shared by the translator tests

use std::collections::BTreeMap;

use trellis_common::crd::{
    AppMeshInstance, AppMeshWorkload, AppliedAccessPolicy, AppliedTrafficPolicy, AccessPolicySpec,
    Destination, DestinationSpec, DestinationStatus, IstioMesh, KubeService, KubeServicePort,
    KubernetesWorkload, Mesh, MeshInstallation, MeshSpec, MeshType, OsmMesh, TrafficPolicyAction,
    TrafficPolicySpec, Workload, WorkloadSpec,
};
use trellis_common::{ClusterObjectRef, InputSnapshot, ObjectRef};

pub(crate) const NS: &str = "trellis-system";

pub(crate) fn snapshot() -> InputSnapshot {
    InputSnapshot::default()
}

fn mesh(name: &str, mesh_type: MeshType) -> Mesh {
    let mut m = Mesh::new(name, MeshSpec { mesh_type });
    m.metadata.namespace = Some(NS.into());
    m
}

fn installation(cluster: &str, namespace: &str) -> MeshInstallation {
    MeshInstallation {
        namespace: namespace.into(),
        cluster: cluster.into(),
        version: "1.20".into(),
    }
}

pub(crate) fn istio_mesh(name: &str, cluster: &str) -> Mesh {
    mesh(
        name,
        MeshType::Istio(IstioMesh {
            installation: installation(cluster, "istio-system"),
            trust_domain: format!("{cluster}.local"),
        }),
    )
}

pub(crate) fn osm_mesh(name: &str, cluster: &str) -> Mesh {
    mesh(
        name,
        MeshType::Osm(OsmMesh {
            installation: installation(cluster, "osm-system"),
        }),
    )
}

pub(crate) fn appmesh_mesh(name: &str, clusters: &[&str]) -> Mesh {
    mesh(
        name,
        MeshType::AwsAppMesh(AppMeshInstance {
            aws_name: name.into(),
            region: "us-east-1".into(),
            aws_account_id: "111122223333".into(),
            clusters: clusters.iter().map(|c| c.to_string()).collect(),
        }),
    )
}

pub(crate) fn mesh_id(name: &str) -> ClusterObjectRef {
    ClusterObjectRef::new(name, NS, "")
}

/// Destination for Service `name.namespace` in `cluster`, selecting pods `app=<name>`
pub(crate) fn destination(name: &str, namespace: &str, cluster: &str, mesh: Option<&str>) -> Destination {
    let mut d = Destination::new(
        &format!("{name}-{namespace}-{cluster}"),
        DestinationSpec {
            kube_service: KubeService {
                reference: ClusterObjectRef::new(name, namespace, cluster),
                workload_selector_labels: BTreeMap::from([("app".to_string(), name.to_string())]),
                labels: BTreeMap::from([("app".to_string(), name.to_string())]),
                ports: vec![KubeServicePort {
                    port: 9080,
                    name: "http".into(),
                    protocol: "TCP".into(),
                }],
                subsets: BTreeMap::new(),
            },
            mesh: mesh.map(|m| ObjectRef::new(m, NS)),
        },
    );
    d.metadata.namespace = Some(NS.into());
    d
}

pub(crate) fn service(name: &str, namespace: &str, cluster: &str) -> ClusterObjectRef {
    ClusterObjectRef::new(name, namespace, cluster)
}

pub(crate) fn policy_id(name: &str) -> ClusterObjectRef {
    ClusterObjectRef::new(name, NS, "")
}

pub(crate) fn traffic_spec(policy: TrafficPolicyAction) -> TrafficPolicySpec {
    TrafficPolicySpec {
        source_selector: vec![],
        destination_selector: vec![],
        http_request_matchers: vec![],
        policy,
    }
}

pub(crate) fn applied_traffic(name: &str, spec: TrafficPolicySpec) -> AppliedTrafficPolicy {
    AppliedTrafficPolicy {
        reference: policy_id(name),
        observed_generation: 1,
        spec,
    }
}

pub(crate) fn applied_access(name: &str, spec: AccessPolicySpec) -> AppliedAccessPolicy {
    AppliedAccessPolicy {
        reference: policy_id(name),
        observed_generation: 1,
        spec,
    }
}

pub(crate) fn with_traffic(mut d: Destination, policies: Vec<AppliedTrafficPolicy>) -> Destination {
    d.status
        .get_or_insert_with(DestinationStatus::default)
        .applied_traffic_policies = policies;
    d
}

pub(crate) fn with_access(mut d: Destination, policies: Vec<AppliedAccessPolicy>) -> Destination {
    d.status
        .get_or_insert_with(DestinationStatus::default)
        .applied_access_policies = policies;
    d
}

pub(crate) fn workload(
    name: &str,
    namespace: &str,
    cluster: &str,
    labels: &[(&str, &str)],
    service_account: &str,
) -> Workload {
    let mut w = Workload::new(
        &format!("{name}-{namespace}-{cluster}"),
        WorkloadSpec {
            kubernetes: KubernetesWorkload {
                controller: ClusterObjectRef::new(name, namespace, cluster),
                pod_labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                service_account_name: service_account.into(),
            },
            mesh: None,
            app_mesh: None,
        },
    );
    w.metadata.namespace = Some(NS.into());
    w
}

pub(crate) fn with_virtual_node(mut w: Workload, node: &str) -> Workload {
    w.spec.app_mesh = Some(AppMeshWorkload {
        virtual_node_name: node.into(),
        ports: vec![9080],
    });
    w
}
