//! Workload attribution
//!
//! A policy is reported against the workloads it actually affects: those its
//! source selector matches whose mesh is the mesh of a destination that
//! accepted it, or is grouped with that mesh by an applied VirtualMesh.

use std::collections::BTreeSet;

use trellis_common::crd::{AccessPolicy, Destination, TrafficPolicy, Workload};
use trellis_common::selector::selector_matches;
use trellis_common::{ClusterObjectRef, Identified, InputSnapshot};

/// Meshes joined by one applied VirtualMesh form one group
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum MeshGroup {
    VirtualMesh(ClusterObjectRef),
    Mesh(ClusterObjectRef),
}

fn mesh_group(snapshot: &InputSnapshot, mesh: &ClusterObjectRef) -> MeshGroup {
    snapshot
        .meshes
        .find(mesh)
        .ok()
        .and_then(|m| m.applied_virtual_mesh())
        .map(|vm| MeshGroup::VirtualMesh(vm.reference.clone()))
        .unwrap_or_else(|| MeshGroup::Mesh(mesh.clone()))
}

fn reachable_groups(snapshot: &InputSnapshot, destinations: &[&Destination]) -> BTreeSet<MeshGroup> {
    destinations
        .iter()
        .filter_map(|d| {
            let mesh = d.spec.mesh.as_ref()?;
            Some(mesh_group(snapshot, &mesh.within(&d.identity())))
        })
        .collect()
}

fn attribute(
    snapshot: &InputSnapshot,
    destinations: &[&Destination],
    selected: impl Fn(&Workload) -> bool,
) -> Vec<String> {
    let groups = reachable_groups(snapshot, destinations);
    if groups.is_empty() {
        return Vec::new();
    }
    snapshot
        .workloads
        .iter()
        .filter(|w| {
            snapshot
                .workload_mesh(w)
                .is_some_and(|mesh| groups.contains(&mesh_group(snapshot, &mesh)))
        })
        .filter(|&w| selected(w))
        .map(|w| w.identity().key())
        .collect()
}

/// Workloads affected by a TrafficPolicy on the destinations that accepted it
pub fn traffic_policy_workloads(
    snapshot: &InputSnapshot,
    policy: &TrafficPolicy,
    accepted_by: &[&Destination],
) -> Vec<String> {
    attribute(snapshot, accepted_by, |w| {
        selector_matches(&policy.spec.source_selector, w)
    })
}

/// Workloads whose identity an AccessPolicy admits to the destinations that accepted it
pub fn access_policy_workloads(
    snapshot: &InputSnapshot,
    policy: &AccessPolicy,
    accepted_by: &[&Destination],
) -> Vec<String> {
    attribute(snapshot, accepted_by, |w| {
        selector_matches(&policy.spec.source_selector, &w.service_account())
    })
}
