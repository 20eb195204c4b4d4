//! Istio output types
//!
//! Only the fields the translator writes are modeled:
//! - DestinationRule: subsets, client TLS, outlier detection
//! - VirtualService: HTTP routes and their per-route features
//! - AuthorizationPolicy: identity-based allow rules and deny-by-default
//! - PeerAuthentication: mesh-wide strict mTLS
//! - ServiceEntry: failover hostnames

use std::collections::{BTreeMap, BTreeSet};

use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use trellis_common::crd::StringMatch;
use trellis_common::kube_utils::HasApiResource;

use super::{output_resource, render_all, Output, RenderedObject};

// =============================================================================
// DestinationRule
// =============================================================================

output_resource!(
    DestinationRule,
    DestinationRuleSpec,
    "networking.istio.io/v1beta1",
    "DestinationRule"
);

/// DestinationRule spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRuleSpec {
    /// Service hostname
    pub host: String,
    /// Connection-level settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<ConnectionPolicy>,
    /// Named endpoint subsets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<Subset>,
}

/// `trafficPolicy` of a DestinationRule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPolicy {
    /// Client TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTls>,
    /// Outlier detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_detection: Option<OutlierDetection>,
}

/// Client TLS settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientTls {
    /// DISABLE, SIMPLE, MUTUAL or ISTIO_MUTUAL
    pub mode: String,
}

/// Outlier detection settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutlierDetection {
    /// Consecutive 5xx responses before ejection
    #[serde(rename = "consecutive5xxErrors")]
    pub consecutive_5xx_errors: u32,
    /// Sweep interval
    pub interval: String,
    /// Minimum ejection duration
    pub base_ejection_time: String,
    /// Maximum ejected share, percent
    pub max_ejection_percent: u32,
}

/// Named subset of endpoints
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Subset {
    /// Subset name
    pub name: String,
    /// Endpoint labels
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// VirtualService
// =============================================================================

output_resource!(
    VirtualService,
    VirtualServiceSpec,
    "networking.istio.io/v1beta1",
    "VirtualService"
);

/// VirtualService spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VirtualServiceSpec {
    /// Hostnames the routes apply to
    pub hosts: Vec<String>,
    /// Ordered HTTP routes, first match wins
    #[serde(default)]
    pub http: Vec<HttpRoute>,
}

/// One HTTP route
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// Match conditions, any of which selects the route
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpMatchRequest>,
    /// Weighted destinations
    #[serde(default)]
    pub route: Vec<HttpRouteDestination>,
    /// Request timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<HttpRetry>,
    /// Fault injection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<HttpFault>,
    /// Mirror target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<RouteDestination>,
    /// Share of traffic mirrored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_percentage: Option<Percent>,
    /// Header edits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    /// CORS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors_policy: Option<CorsPolicy>,
}

/// Istio string match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IstioStringMatch {
    /// Exact
    Exact(String),
    /// Prefix
    Prefix(String),
    /// RE2 regex
    Regex(String),
}

impl From<&StringMatch> for IstioStringMatch {
    fn from(m: &StringMatch) -> Self {
        match m {
            StringMatch::Exact(s) => Self::Exact(s.clone()),
            StringMatch::Prefix(s) => Self::Prefix(s.clone()),
            StringMatch::Regex(s) => Self::Regex(s.clone()),
        }
    }
}

/// Route match conditions
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatchRequest {
    /// Path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<IstioStringMatch>,
    /// Required headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, IstioStringMatch>,
    /// Headers that must not match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub without_headers: BTreeMap<String, IstioStringMatch>,
    /// Query parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, IstioStringMatch>,
    /// Method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<IstioStringMatch>,
    /// Labels of the calling workload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_labels: BTreeMap<String, String>,
    /// Namespace of the calling workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_namespace: Option<String>,
}

/// Weighted route destination
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpRouteDestination {
    /// Target
    pub destination: RouteDestination,
    /// Relative weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Host, subset and port of a route target
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteDestination {
    /// Service hostname
    pub host: String,
    /// DestinationRule subset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,
    /// Port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
}

/// Port selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PortSelector {
    /// Port number
    pub number: u32,
}

/// Retry policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRetry {
    /// Number of retries
    pub attempts: u32,
    /// Timeout per attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
}

/// Percentage
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Percent {
    /// 0.0 - 100.0
    pub value: f64,
}

/// Fault injection
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpFault {
    /// Delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<FaultDelay>,
    /// Abort
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<FaultAbort>,
}

/// Injected delay
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FaultDelay {
    /// Delay length
    pub fixed_delay: String,
    /// Share of requests delayed
    pub percentage: Percent,
}

/// Injected abort
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FaultAbort {
    /// Status returned
    pub http_status: u32,
    /// Share of requests aborted
    pub percentage: Percent,
}

/// Request and response header edits
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Headers {
    /// Request edits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOperations>,
    /// Response edits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HeaderOperations>,
}

/// Header additions and removals
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HeaderOperations {
    /// Headers added
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    /// Headers removed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

/// CORS policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    /// Allowed origins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_origins: Vec<IstioStringMatch>,
    /// Allowed methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_methods: Vec<String>,
    /// Allowed request headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_headers: Vec<String>,
    /// Exposed response headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose_headers: Vec<String>,
    /// Preflight cache duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    /// Whether credentials are allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_credentials: Option<bool>,
}

// =============================================================================
// AuthorizationPolicy
// =============================================================================

output_resource!(
    AuthorizationPolicy,
    AuthorizationPolicySpec,
    "security.istio.io/v1beta1",
    "AuthorizationPolicy"
);

/// AuthorizationPolicy spec
///
/// An empty spec (no selector, no rules, no action) denies every request in
/// its namespace.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationPolicySpec {
    /// Workloads the policy applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<WorkloadSelector>,
    /// ALLOW or DENY (empty = implicit deny-all)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    /// Rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<AuthorizationRule>,
}

/// Workload selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    /// Match labels
    pub match_labels: BTreeMap<String, String>,
}

/// One allow rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationRule {
    /// Who is calling
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<RuleFrom>,
    /// What is being called
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<RuleTo>,
}

/// Caller condition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleFrom {
    /// Source specification
    pub source: Source,
}

/// Caller identities
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Source {
    /// SPIFFE principals
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    /// Caller namespaces, in any trust domain
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

/// Operation condition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleTo {
    /// Operation specification
    pub operation: Operation,
}

/// Allowed operation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

impl Operation {
    /// Whether the operation constrains nothing
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty() && self.methods.is_empty() && self.paths.is_empty()
    }
}

// =============================================================================
// PeerAuthentication
// =============================================================================

output_resource!(
    PeerAuthentication,
    PeerAuthenticationSpec,
    "security.istio.io/v1beta1",
    "PeerAuthentication"
);

/// PeerAuthentication spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerAuthenticationSpec {
    /// mTLS settings
    pub mtls: PeerMtls,
}

/// Server-side mTLS mode
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerMtls {
    /// STRICT, PERMISSIVE or DISABLE
    pub mode: String,
}

// =============================================================================
// ServiceEntry
// =============================================================================

output_resource!(
    ServiceEntry,
    ServiceEntrySpec,
    "networking.istio.io/v1beta1",
    "ServiceEntry"
);

/// ServiceEntry spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntrySpec {
    /// Hostnames
    pub hosts: Vec<String>,
    /// Ports
    pub ports: Vec<ServiceEntryPort>,
    /// MESH_INTERNAL or MESH_EXTERNAL
    pub location: String,
    /// DNS or STATIC
    pub resolution: String,
    /// Backing endpoints in priority order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<WorkloadEntry>,
}

/// ServiceEntry port
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntryPort {
    /// Port number
    pub number: u32,
    /// Protocol (HTTP, GRPC, TCP)
    pub protocol: String,
    /// Port name
    pub name: String,
}

/// ServiceEntry endpoint
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkloadEntry {
    /// Hostname or IP
    pub address: String,
    /// Labels, used to express failover priority
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Collection
// =============================================================================

/// Istio objects produced by one pass
#[derive(Clone, Debug, Default)]
pub struct IstioOutputs {
    /// DestinationRules
    pub destination_rules: Vec<Output<DestinationRule>>,
    /// VirtualServices
    pub virtual_services: Vec<Output<VirtualService>>,
    /// AuthorizationPolicies
    pub authorization_policies: Vec<Output<AuthorizationPolicy>>,
    /// PeerAuthentications
    pub peer_authentications: Vec<Output<PeerAuthentication>>,
    /// ServiceEntries
    pub service_entries: Vec<Output<ServiceEntry>>,
}

impl IstioOutputs {
    /// Kinds this backend writes
    pub fn kinds() -> Vec<ApiResource> {
        vec![
            DestinationRule::api_resource(),
            VirtualService::api_resource(),
            AuthorizationPolicy::api_resource(),
            PeerAuthentication::api_resource(),
            ServiceEntry::api_resource(),
        ]
    }

    /// Total number of objects
    pub fn total_count(&self) -> usize {
        self.destination_rules.len()
            + self.virtual_services.len()
            + self.authorization_policies.len()
            + self.peer_authentications.len()
            + self.service_entries.len()
    }

    /// Whether no objects were produced
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    pub(crate) fn clusters(&self) -> BTreeSet<String> {
        let mut clusters = BTreeSet::new();
        clusters.extend(self.destination_rules.iter().map(|o| o.cluster.clone()));
        clusters.extend(self.virtual_services.iter().map(|o| o.cluster.clone()));
        clusters.extend(self.authorization_policies.iter().map(|o| o.cluster.clone()));
        clusters.extend(self.peer_authentications.iter().map(|o| o.cluster.clone()));
        clusters.extend(self.service_entries.iter().map(|o| o.cluster.clone()));
        clusters
    }

    pub(crate) fn render_into(&self, out: &mut Vec<RenderedObject>) -> Result<(), serde_json::Error> {
        render_all(&self.destination_rules, out)?;
        render_all(&self.virtual_services, out)?;
        render_all(&self.authorization_policies, out)?;
        render_all(&self.peer_authentications, out)?;
        render_all(&self.service_entries, out)
    }
}
