//! SMI output types (TrafficSplit, TrafficTarget, HTTPRouteGroup)

use std::collections::{BTreeMap, BTreeSet};

use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use trellis_common::kube_utils::HasApiResource;

use super::{output_resource, render_all, Output, RenderedObject};

output_resource!(
    TrafficSplit,
    TrafficSplitSpec,
    "split.smi-spec.io/v1alpha2",
    "TrafficSplit"
);

/// TrafficSplit spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrafficSplitSpec {
    /// Root service clients address
    pub service: String,
    /// Weighted backend services
    #[serde(default)]
    pub backends: Vec<TrafficSplitBackend>,
}

/// One backend of a split
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrafficSplitBackend {
    /// Backend service name
    pub service: String,
    /// Relative weight
    pub weight: u32,
}

output_resource!(
    TrafficTarget,
    TrafficTargetSpec,
    "access.smi-spec.io/v1alpha3",
    "TrafficTarget"
);

/// TrafficTarget spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrafficTargetSpec {
    /// Service account receiving traffic
    pub destination: IdentityBindingSubject,
    /// Service accounts allowed to call
    #[serde(default)]
    pub sources: Vec<IdentityBindingSubject>,
    /// Route groups the sources may use
    #[serde(default)]
    pub rules: Vec<TrafficTargetRule>,
}

/// A service account subject
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct IdentityBindingSubject {
    /// Always "ServiceAccount"
    pub kind: String,
    /// Service account name
    pub name: String,
    /// Service account namespace
    pub namespace: String,
}

impl IdentityBindingSubject {
    /// Subject for a service account
    pub fn service_account(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind: "ServiceAccount".to_string(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Reference to route matches
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrafficTargetRule {
    /// Route group kind
    pub kind: String,
    /// Route group name
    pub name: String,
    /// Match names within the group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<String>,
}

output_resource!(
    HttpRouteGroup,
    HttpRouteGroupSpec,
    "specs.smi-spec.io/v1alpha4",
    "HTTPRouteGroup"
);

/// HTTPRouteGroup spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpRouteGroupSpec {
    /// Named request matches
    #[serde(default)]
    pub matches: Vec<HttpRouteMatch>,
}

/// A named request match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteMatch {
    /// Match name
    pub name: String,
    /// Path regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,
    /// Methods ("*" for any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Required headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// SMI objects produced by one pass
#[derive(Clone, Debug, Default)]
pub struct SmiOutputs {
    /// TrafficSplits
    pub traffic_splits: Vec<Output<TrafficSplit>>,
    /// TrafficTargets
    pub traffic_targets: Vec<Output<TrafficTarget>>,
    /// HTTPRouteGroups
    pub http_route_groups: Vec<Output<HttpRouteGroup>>,
}

impl SmiOutputs {
    /// Kinds this backend writes
    pub fn kinds() -> Vec<ApiResource> {
        vec![
            TrafficSplit::api_resource(),
            TrafficTarget::api_resource(),
            HttpRouteGroup::api_resource(),
        ]
    }

    /// Total number of objects
    pub fn total_count(&self) -> usize {
        self.traffic_splits.len() + self.traffic_targets.len() + self.http_route_groups.len()
    }

    /// Whether no objects were produced
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    pub(crate) fn clusters(&self) -> BTreeSet<String> {
        let mut clusters = BTreeSet::new();
        clusters.extend(self.traffic_splits.iter().map(|o| o.cluster.clone()));
        clusters.extend(self.traffic_targets.iter().map(|o| o.cluster.clone()));
        clusters.extend(self.http_route_groups.iter().map(|o| o.cluster.clone()));
        clusters
    }

    pub(crate) fn render_into(&self, out: &mut Vec<RenderedObject>) -> Result<(), serde_json::Error> {
        render_all(&self.traffic_splits, out)?;
        render_all(&self.traffic_targets, out)?;
        render_all(&self.http_route_groups, out)
    }
}
