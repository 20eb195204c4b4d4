//! AWS App Mesh controller output types (VirtualRouter, VirtualService)

use std::collections::BTreeSet;

use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use trellis_common::kube_utils::HasApiResource;

use super::{output_resource, render_all, Output, RenderedObject};

output_resource!(
    VirtualRouter,
    VirtualRouterSpec,
    "appmesh.k8s.aws/v1beta2",
    "VirtualRouter"
);

/// VirtualRouter spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualRouterSpec {
    /// Name of the router in AWS
    pub aws_name: String,
    /// Listeners
    #[serde(default)]
    pub listeners: Vec<RouterListener>,
    /// Ordered routes
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Router listener
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterListener {
    /// Listening port
    pub port_mapping: PortMapping,
}

/// Port and protocol
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    /// Port
    pub port: u32,
    /// http, http2, grpc or tcp
    pub protocol: String,
}

/// Named route
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Route name
    pub name: String,
    /// Evaluation priority, lower first
    pub priority: u32,
    /// HTTP route
    pub http_route: HttpRoute,
}

/// HTTP route body
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// Request match
    #[serde(rename = "match")]
    pub route_match: RouteMatch,
    /// Weighted targets
    pub action: RouteAction,
    /// Retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Timeouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<RouteTimeout>,
}

/// Request match; App Mesh requires a prefix, "/" matches everything
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteMatch {
    /// Path prefix
    pub prefix: String,
    /// Method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Header matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
}

/// Header match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HeaderMatch {
    /// Header name
    pub name: String,
    /// Match condition
    #[serde(rename = "match")]
    pub header_match: HeaderMatchMethod,
    /// Negate
    #[serde(default)]
    pub invert: bool,
}

/// Header match condition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HeaderMatchMethod {
    /// Exact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    /// Regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Route action
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteAction {
    /// Weighted virtual nodes
    pub weighted_targets: Vec<WeightedTarget>,
}

/// Weighted virtual node
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightedTarget {
    /// Target node
    pub virtual_node_ref: NodeRef,
    /// Weight
    pub weight: u32,
}

/// VirtualNode reference
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeRef {
    /// Node name
    pub name: String,
    /// Node namespace
    pub namespace: String,
}

/// Retry policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries
    pub max_retries: u32,
    /// Per-attempt timeout
    pub per_retry_timeout: AppMeshDuration,
    /// Retry on these HTTP event classes
    pub http_retry_events: Vec<String>,
}

/// Route timeouts
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTimeout {
    /// Whole-request timeout
    pub per_request: AppMeshDuration,
}

/// App Mesh duration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AppMeshDuration {
    /// "ms" or "s"
    pub unit: String,
    /// Amount
    pub value: u64,
}

impl AppMeshDuration {
    /// Milliseconds
    pub fn millis(value: u64) -> Self {
        Self {
            unit: "ms".to_string(),
            value,
        }
    }
}

output_resource!(
    AppMeshVirtualService,
    AppMeshVirtualServiceSpec,
    "appmesh.k8s.aws/v1beta2",
    "VirtualService"
);

/// App Mesh VirtualService spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppMeshVirtualServiceSpec {
    /// Name of the service in AWS (its DNS name)
    pub aws_name: String,
    /// Provider
    pub provider: VirtualServiceProvider,
}

/// Provider of an App Mesh VirtualService
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceProvider {
    /// Router serving the service
    pub virtual_router: RouterRef,
}

/// VirtualRouter reference
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterRef {
    /// Router name
    pub virtual_router_ref: NodeRef,
}

/// App Mesh objects produced by one pass
#[derive(Clone, Debug, Default)]
pub struct AppMeshOutputs {
    /// VirtualRouters
    pub virtual_routers: Vec<Output<VirtualRouter>>,
    /// VirtualServices
    pub virtual_services: Vec<Output<AppMeshVirtualService>>,
}

impl AppMeshOutputs {
    /// Kinds this backend writes
    pub fn kinds() -> Vec<ApiResource> {
        vec![
            VirtualRouter::api_resource(),
            AppMeshVirtualService::api_resource(),
        ]
    }

    /// Total number of objects
    pub fn total_count(&self) -> usize {
        self.virtual_routers.len() + self.virtual_services.len()
    }

    /// Whether no objects were produced
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    pub(crate) fn clusters(&self) -> BTreeSet<String> {
        let mut clusters = BTreeSet::new();
        clusters.extend(self.virtual_routers.iter().map(|o| o.cluster.clone()));
        clusters.extend(self.virtual_services.iter().map(|o| o.cluster.clone()));
        clusters
    }

    pub(crate) fn render_into(&self, out: &mut Vec<RenderedObject>) -> Result<(), serde_json::Error> {
        render_all(&self.virtual_routers, out)?;
        render_all(&self.virtual_services, out)
    }
}
