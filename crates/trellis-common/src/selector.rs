//! Selector matching
//!
//! A selector list is a disjunction of match-blocks: an empty list matches
//! everything, otherwise a candidate must satisfy at least one block. Inside a
//! block every non-empty predicate must hold (label subset, namespace
//! membership, cluster membership). There are no wildcards beyond "empty
//! means unconstrained".

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{Destination, Workload};
use crate::identity::ClusterObjectRef;

/// A single match-block over some candidate type
pub trait Selector {
    /// What the block is evaluated against
    type Candidate: ?Sized;

    /// Whether the candidate satisfies every non-empty predicate of the block
    fn matches(&self, candidate: &Self::Candidate) -> bool;
}

/// Evaluate a selector list: empty matches all, otherwise any block may match
pub fn selector_matches<S: Selector>(selectors: &[S], candidate: &S::Candidate) -> bool {
    selectors.is_empty() || selectors.iter().any(|s| s.matches(candidate))
}

fn labels_subset(required: &BTreeMap<String, String>, actual: &BTreeMap<String, String>) -> bool {
    required.iter().all(|(k, v)| actual.get(k) == Some(v))
}

fn member_of(allowed: &[String], value: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|a| a == value)
}

// =============================================================================
// Destinations
// =============================================================================

/// Selects destinations by service labels, namespace and cluster, or by
/// explicit service references
///
/// When `services` is non-empty the block matches exactly those services and
/// the other predicates are ignored.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSelector {
    /// Labels the Service must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Namespaces the Service may live in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Clusters the Service may live in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
    /// Explicit Service references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ClusterObjectRef>,
}

impl Selector for DestinationSelector {
    type Candidate = Destination;

    fn matches(&self, destination: &Destination) -> bool {
        let svc = &destination.spec.kube_service;
        if !self.services.is_empty() {
            return self.services.contains(&svc.reference);
        }
        labels_subset(&self.labels, &svc.labels)
            && member_of(&self.namespaces, &svc.reference.namespace)
            && member_of(&self.clusters, &svc.reference.cluster_name)
    }
}

// =============================================================================
// Workloads
// =============================================================================

/// Selects workloads by pod labels, namespace and cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    /// Labels the pods must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Namespaces the workload may live in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Clusters the workload may live in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
}

impl Selector for WorkloadSelector {
    type Candidate = Workload;

    fn matches(&self, workload: &Workload) -> bool {
        let k = &workload.spec.kubernetes;
        labels_subset(&self.labels, &k.pod_labels)
            && member_of(&self.namespaces, &k.controller.namespace)
            && member_of(&self.clusters, &k.controller.cluster_name)
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Selects calling identities (service accounts)
///
/// Explicit `serviceAccounts` take precedence over namespace/cluster matching,
/// as with [`DestinationSelector::services`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySelector {
    /// Namespaces the service account may live in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Clusters the service account may live in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
    /// Explicit service account references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ClusterObjectRef>,
}

impl Selector for IdentitySelector {
    type Candidate = ClusterObjectRef;

    fn matches(&self, service_account: &ClusterObjectRef) -> bool {
        if !self.service_accounts.is_empty() {
            return self.service_accounts.contains(service_account);
        }
        member_of(&self.namespaces, &service_account.namespace)
            && member_of(&self.clusters, &service_account.cluster_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DestinationSpec, KubeService, KubernetesWorkload, WorkloadSpec};
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn destination(name: &str, ns: &str, cluster: &str, svc_labels: &[(&str, &str)]) -> Destination {
        Destination::new(
            &format!("{name}-{ns}-{cluster}"),
            DestinationSpec {
                kube_service: KubeService {
                    reference: ClusterObjectRef::new(name, ns, cluster),
                    labels: labels(svc_labels),
                    ..Default::default()
                },
                mesh: None,
            },
        )
    }

    fn workload(ns: &str, cluster: &str, pod_labels: &[(&str, &str)]) -> Workload {
        Workload::new(
            "wl",
            WorkloadSpec {
                kubernetes: KubernetesWorkload {
                    controller: ClusterObjectRef::new("productpage", ns, cluster),
                    pod_labels: labels(pod_labels),
                    service_account_name: "bookinfo-productpage".into(),
                },
                mesh: None,
                app_mesh: None,
            },
        )
    }

    #[test]
    fn test_empty_selector_list_matches_everything() {
        let dest = destination("reviews", "bookinfo", "c1", &[]);
        assert!(selector_matches::<DestinationSelector>(&[], &dest));
    }

    #[test]
    fn test_empty_block_matches_everything() {
        let dest = destination("reviews", "bookinfo", "c1", &[("app", "reviews")]);
        assert!(selector_matches(&[DestinationSelector::default()], &dest));
    }

    #[rstest]
    #[case::label_subset(&[("app", "reviews")], &[], &[], true)]
    #[case::label_mismatch(&[("app", "ratings")], &[], &[], false)]
    #[case::namespace_member(&[], &["bookinfo", "other"], &[], true)]
    #[case::namespace_miss(&[], &["other"], &[], false)]
    #[case::cluster_member(&[], &[], &["c1"], true)]
    #[case::all_predicates(&[("app", "reviews")], &["bookinfo"], &["c1"], true)]
    #[case::one_predicate_fails(&[("app", "reviews")], &["bookinfo"], &["c2"], false)]
    fn test_destination_block_predicates(
        #[case] want_labels: &[(&str, &str)],
        #[case] namespaces: &[&str],
        #[case] clusters: &[&str],
        #[case] expected: bool,
    ) {
        let dest = destination(
            "reviews",
            "bookinfo",
            "c1",
            &[("app", "reviews"), ("version", "v1")],
        );
        let sel = DestinationSelector {
            labels: labels(want_labels),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            clusters: clusters.iter().map(|s| s.to_string()).collect(),
            services: vec![],
        };
        assert_eq!(selector_matches(&[sel], &dest), expected);
    }

    #[test]
    fn test_any_block_may_match() {
        let dest = destination("reviews", "bookinfo", "c1", &[]);
        let miss = DestinationSelector {
            namespaces: vec!["other".into()],
            ..Default::default()
        };
        let hit = DestinationSelector {
            clusters: vec!["c1".into()],
            ..Default::default()
        };
        assert!(!selector_matches(&[miss.clone()], &dest));
        assert!(selector_matches(&[miss, hit], &dest));
    }

    #[test]
    fn test_explicit_service_refs() {
        let dest = destination("reviews", "bookinfo", "c1", &[]);
        let sel = DestinationSelector {
            services: vec![ClusterObjectRef::new("reviews", "bookinfo", "c1")],
            namespaces: vec!["ignored".into()],
            ..Default::default()
        };
        assert!(selector_matches(&[sel], &dest));

        let other = DestinationSelector {
            services: vec![ClusterObjectRef::new("reviews", "bookinfo", "c2")],
            ..Default::default()
        };
        assert!(!selector_matches(&[other], &dest));
    }

    #[test]
    fn test_workload_selector() {
        let wl = workload("bookinfo", "c1", &[("app", "productpage")]);
        let sel = WorkloadSelector {
            labels: labels(&[("app", "productpage")]),
            clusters: vec!["c1".into()],
            ..Default::default()
        };
        assert!(selector_matches(&[sel], &wl));

        let wrong = WorkloadSelector {
            namespaces: vec!["istio-system".into()],
            ..Default::default()
        };
        assert!(!selector_matches(&[wrong], &wl));
    }

    #[test]
    fn test_identity_selector() {
        let wl = workload("bookinfo", "c1", &[]);
        let sa = wl.service_account();
        assert_eq!(sa, ClusterObjectRef::new("bookinfo-productpage", "bookinfo", "c1"));

        let by_ns = IdentitySelector {
            namespaces: vec!["bookinfo".into()],
            ..Default::default()
        };
        assert!(selector_matches(&[by_ns], &sa));

        let by_ref = IdentitySelector {
            service_accounts: vec![ClusterObjectRef::new("other", "bookinfo", "c1")],
            ..Default::default()
        };
        assert!(!selector_matches(&[by_ref], &sa));
    }
}
