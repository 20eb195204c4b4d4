//! The input snapshot: every record of one pass, ordered by identity
//!
//! Snapshots are assembled by whoever reads the clusters (the operator's
//! loader, tests) and then handed to the applier, which only rewrites status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::Resource;

use crate::crd::{
    AccessPolicy, Destination, FailoverService, KubernetesCluster, Mesh, TrafficPolicy,
    VirtualMesh, Workload,
};
use crate::identity::{ClusterObjectRef, Identified};
use crate::{Error, Result};

/// Identity-ordered collection of one record kind
#[derive(Clone, Debug)]
pub struct ResourceSet<T> {
    items: BTreeMap<ClusterObjectRef, T>,
}

impl<T> Default for ResourceSet<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T> ResourceSet<T>
where
    T: Resource<DynamicType = ()> + Clone,
{
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, keyed by its identity
    pub fn insert(&mut self, item: T) {
        self.items.insert(item.identity(), item);
    }

    /// All records in identity order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Records satisfying `predicate`, in identity order
    pub fn list(&self, predicate: impl Fn(&T) -> bool) -> Vec<&T> {
        self.items.values().filter(|i| predicate(i)).collect()
    }

    /// Identities in order
    pub fn keys(&self) -> impl Iterator<Item = &ClusterObjectRef> {
        self.items.keys()
    }

    /// Look a record up by identity
    pub fn find(&self, id: &ClusterObjectRef) -> Result<&T> {
        self.items
            .get(id)
            .ok_or_else(|| Error::not_found(T::kind(&()), id.key()))
    }

    /// Mutable lookup by identity
    pub fn find_mut(&mut self, id: &ClusterObjectRef) -> Result<&mut T> {
        self.items
            .get_mut(id)
            .ok_or_else(|| Error::not_found(T::kind(&()), id.key()))
    }

    /// Whether a record with this identity exists
    pub fn contains(&self, id: &ClusterObjectRef) -> bool {
        self.items.contains_key(id)
    }

    /// Records from both sets; `other` wins on identity collisions
    pub fn union(&self, other: &Self) -> Self {
        let mut items = self.items.clone();
        items.extend(other.items.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { items }
    }

    /// Records of `self` whose identity is not in `other`
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .filter(|(k, _)| !other.items.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Records of `self` whose identity is also in `other`
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .filter(|(k, _)| other.items.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> FromIterator<T> for ResourceSet<T>
where
    T: Resource<DynamicType = ()> + Clone,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

/// Every input record of one reconciliation pass
#[derive(Clone, Debug, Default)]
pub struct InputSnapshot {
    /// Traffic policies
    pub traffic_policies: ResourceSet<TrafficPolicy>,
    /// Access policies
    pub access_policies: ResourceSet<AccessPolicy>,
    /// Virtual meshes
    pub virtual_meshes: ResourceSet<VirtualMesh>,
    /// Failover services
    pub failover_services: ResourceSet<FailoverService>,
    /// Discovered destinations
    pub destinations: ResourceSet<Destination>,
    /// Discovered meshes
    pub meshes: ResourceSet<Mesh>,
    /// Discovered workloads
    pub workloads: ResourceSet<Workload>,
    /// Registered clusters
    pub clusters: ResourceSet<KubernetesCluster>,
    /// Secrets referenced by VirtualMeshes
    pub secrets: ResourceSet<Secret>,
}

impl InputSnapshot {
    /// DNS suffix of a registered cluster, or the default when unknown
    pub fn cluster_domain(&self, cluster_name: &str) -> &str {
        self.clusters
            .iter()
            .find(|c| c.metadata.name.as_deref() == Some(cluster_name))
            .map(|c| c.spec.domain())
            .unwrap_or(crate::DEFAULT_CLUSTER_DOMAIN)
    }

    /// The destination backed by a given Service
    pub fn destination_for_service(&self, service: &ClusterObjectRef) -> Option<&Destination> {
        self.destinations
            .iter()
            .find(|d| d.service_ref() == service)
    }

    /// Resolve a destination's mesh reference
    pub fn mesh_of(&self, destination: &Destination) -> Option<&Mesh> {
        let mesh_ref = destination.spec.mesh.as_ref()?;
        self.meshes.find(&mesh_ref.within(&destination.identity())).ok()
    }

    /// Resolve a workload's mesh reference
    pub fn workload_mesh(&self, workload: &Workload) -> Option<ClusterObjectRef> {
        workload
            .spec
            .mesh
            .as_ref()
            .map(|m| m.within(&workload.identity()))
    }

    /// Workloads whose pods back a destination's Service
    ///
    /// Same namespace and cluster as the Service, pod labels a superset of
    /// its selector. A Service without a selector has no backing workloads.
    pub fn backing_workloads(&self, destination: &Destination) -> Vec<&Workload> {
        let svc = &destination.spec.kube_service;
        if svc.workload_selector_labels.is_empty() {
            return Vec::new();
        }
        self.workloads.list(|w| {
            let k = &w.spec.kubernetes;
            k.controller.namespace == svc.reference.namespace
                && k.controller.cluster_name == svc.reference.cluster_name
                && svc
                    .workload_selector_labels
                    .iter()
                    .all(|(key, value)| k.pod_labels.get(key) == Some(value))
        })
    }

    /// Total number of records, for logging
    pub fn total_count(&self) -> usize {
        self.traffic_policies.len()
            + self.access_policies.len()
            + self.virtual_meshes.len()
            + self.failover_services.len()
            + self.destinations.len()
            + self.meshes.len()
            + self.workloads.len()
            + self.clusters.len()
            + self.secrets.len()
    }
}
