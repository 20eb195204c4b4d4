//! TrafficPolicy CRD: routing and resilience intent for destinations
//!
//! A policy selects destinations (and optionally source workloads), narrows
//! requests with HTTP matchers, and carries exactly one feature in `policy`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ApprovalStatus;
use crate::identity::ClusterObjectRef;
use crate::selector::{DestinationSelector, WorkloadSelector};

// =============================================================================
// CRD
// =============================================================================

/// Spec for a TrafficPolicy
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.trellis.dev",
    version = "v1alpha1",
    kind = "TrafficPolicy",
    plural = "trafficpolicies",
    shortname = "tp",
    namespaced,
    status = "TrafficPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPolicySpec {
    /// Workloads whose outbound requests are affected (empty = all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_selector: Vec<WorkloadSelector>,

    /// Destinations the policy applies to (empty = all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_selector: Vec<DestinationSelector>,

    /// Requests the policy applies to (empty = all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_request_matchers: Vec<HttpMatcher>,

    /// The feature this policy configures
    pub policy: TrafficPolicyAction,
}

/// Exactly one traffic feature
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum TrafficPolicyAction {
    /// Split traffic across weighted backends
    TrafficShift(TrafficShift),
    /// Retry failed requests
    Retries(RetryPolicy),
    /// Overall request timeout, as a duration string ("5s")
    RequestTimeout(String),
    /// Inject delays or aborts
    FaultInjection(FaultInjection),
    /// Mirror a share of traffic to another service
    Mirror(Mirror),
    /// Add or remove headers
    HeaderManipulation(HeaderManipulation),
    /// Cross-origin resource sharing
    CorsPolicy(CorsPolicy),
    /// Eject unhealthy endpoints
    OutlierDetection(OutlierDetection),
    /// Client-side TLS mode for the destination
    Mtls(MtlsSettings),
}

impl TrafficPolicyAction {
    /// Feature name as used in diagnostics
    pub fn feature_name(&self) -> &'static str {
        match self {
            Self::TrafficShift(_) => "TrafficShift",
            Self::Retries(_) => "Retries",
            Self::RequestTimeout(_) => "RequestTimeout",
            Self::FaultInjection(_) => "FaultInjection",
            Self::Mirror(_) => "Mirror",
            Self::HeaderManipulation(_) => "HeaderManipulation",
            Self::CorsPolicy(_) => "CorsPolicy",
            Self::OutlierDetection(_) => "OutlierDetection",
            Self::Mtls(_) => "Mtls",
        }
    }

    /// The traffic shift, if that is the configured feature
    pub fn traffic_shift(&self) -> Option<&TrafficShift> {
        match self {
            Self::TrafficShift(v) => Some(v),
            _ => None,
        }
    }

    /// The retry policy, if that is the configured feature
    pub fn retries(&self) -> Option<&RetryPolicy> {
        match self {
            Self::Retries(v) => Some(v),
            _ => None,
        }
    }

    /// The request timeout, if that is the configured feature
    pub fn request_timeout(&self) -> Option<&str> {
        match self {
            Self::RequestTimeout(v) => Some(v),
            _ => None,
        }
    }

    /// The fault injection, if that is the configured feature
    pub fn fault_injection(&self) -> Option<&FaultInjection> {
        match self {
            Self::FaultInjection(v) => Some(v),
            _ => None,
        }
    }

    /// The mirror, if that is the configured feature
    pub fn mirror(&self) -> Option<&Mirror> {
        match self {
            Self::Mirror(v) => Some(v),
            _ => None,
        }
    }

    /// The header manipulation, if that is the configured feature
    pub fn header_manipulation(&self) -> Option<&HeaderManipulation> {
        match self {
            Self::HeaderManipulation(v) => Some(v),
            _ => None,
        }
    }

    /// The CORS policy, if that is the configured feature
    pub fn cors_policy(&self) -> Option<&CorsPolicy> {
        match self {
            Self::CorsPolicy(v) => Some(v),
            _ => None,
        }
    }

    /// The outlier detection, if that is the configured feature
    pub fn outlier_detection(&self) -> Option<&OutlierDetection> {
        match self {
            Self::OutlierDetection(v) => Some(v),
            _ => None,
        }
    }

    /// The mTLS override, if that is the configured feature
    pub fn mtls(&self) -> Option<&MtlsSettings> {
        match self {
            Self::Mtls(v) => Some(v),
            _ => None,
        }
    }
}

// =============================================================================
// Request matching
// =============================================================================

/// String comparison used by URI and CORS origin matching
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum StringMatch {
    /// Exact string
    Exact(String),
    /// Prefix
    Prefix(String),
    /// RE2 regular expression
    Regex(String),
}

/// One set of request predicates; all must hold
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatcher {
    /// Request path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,
    /// Request headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,
    /// Query parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_parameters: Vec<QueryParameterMatcher>,
    /// HTTP method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Header predicate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatcher {
    /// Header name
    pub name: String,
    /// Expected value
    #[serde(default)]
    pub value: String,
    /// Treat value as a regular expression
    #[serde(default)]
    pub regex: bool,
    /// Match when the header does NOT match
    #[serde(default)]
    pub invert_match: bool,
}

/// Query parameter predicate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameterMatcher {
    /// Parameter name
    pub name: String,
    /// Expected value
    #[serde(default)]
    pub value: String,
    /// Treat value as a regular expression
    #[serde(default)]
    pub regex: bool,
}

// =============================================================================
// Features
// =============================================================================

/// Weighted backends
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficShift {
    /// Backends and their weights
    pub destinations: Vec<WeightedDestination>,
}

/// One weighted backend of a traffic shift
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightedDestination {
    /// Backing Kubernetes Service
    pub kube_service: ClusterObjectRef,
    /// Relative weight
    pub weight: u32,
    /// Pod labels selecting a subset of the service's endpoints
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subset: BTreeMap<String, String>,
    /// Target port when the service exposes several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
}

/// Retry settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Number of retries
    pub attempts: u32,
    /// Timeout per attempt, as a duration string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
}

/// Fault injection; exactly one of delay or abort
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FaultInjection {
    /// Fixed delay before forwarding, as a duration string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_delay: Option<String>,
    /// HTTP status to abort with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_http_status: Option<u32>,
    /// Share of requests affected, 0-100
    pub percentage: f64,
}

/// Traffic mirroring
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    /// Service receiving the copy
    pub kube_service: ClusterObjectRef,
    /// Share of requests mirrored, 0-100
    pub percentage: f64,
    /// Target port when the service exposes several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
}

/// Header edits on requests and responses
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderManipulation {
    /// Headers added to requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_request_headers: BTreeMap<String, String>,
    /// Headers removed from requests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_request_headers: Vec<String>,
    /// Headers added to responses
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_response_headers: BTreeMap<String, String>,
    /// Headers removed from responses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_response_headers: Vec<String>,
}

/// CORS settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    /// Allowed origins
    #[serde(default)]
    pub allow_origins: Vec<StringMatch>,
    /// Allowed methods
    #[serde(default)]
    pub allow_methods: Vec<String>,
    /// Allowed request headers
    #[serde(default)]
    pub allow_headers: Vec<String>,
    /// Headers exposed to the browser
    #[serde(default)]
    pub expose_headers: Vec<String>,
    /// Preflight cache duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    /// Whether credentials are allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_credentials: Option<bool>,
}

/// Endpoint ejection settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutlierDetection {
    /// Consecutive 5xx responses before ejection
    #[serde(default = "default_consecutive_errors")]
    pub consecutive_errors: u32,
    /// Sweep interval
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Minimum ejection duration
    #[serde(default = "default_base_ejection_time")]
    pub base_ejection_time: String,
    /// Upper bound on ejected endpoints, percent
    #[serde(default = "default_max_ejection_percent")]
    pub max_ejection_percent: u32,
}

impl Default for OutlierDetection {
    fn default() -> Self {
        Self {
            consecutive_errors: default_consecutive_errors(),
            interval: default_interval(),
            base_ejection_time: default_base_ejection_time(),
            max_ejection_percent: default_max_ejection_percent(),
        }
    }
}

fn default_consecutive_errors() -> u32 {
    5
}

fn default_interval() -> String {
    "10s".to_string()
}

fn default_base_ejection_time() -> String {
    "30s".to_string()
}

fn default_max_ejection_percent() -> u32 {
    100
}

/// Client TLS override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MtlsSettings {
    /// TLS mode used by clients of the destination
    pub mode: TlsMode,
}

/// Client TLS modes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TlsMode {
    /// Plaintext
    Disable,
    /// One-way TLS
    Simple,
    /// Mesh-issued mutual TLS
    #[default]
    IstioMutual,
}

// =============================================================================
// Status
// =============================================================================

/// Status for a TrafficPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPolicyStatus {
    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// Approval per selected destination, keyed by destination identity key
    #[serde(default)]
    pub destinations: BTreeMap<String, ApprovalStatus>,

    /// Identity keys of the source workloads the policy affects
    #[serde(default)]
    pub workloads: Vec<String>,
}

impl TrafficPolicy {
    /// Approval recorded for a destination in the last committed pass
    pub fn approval_for(&self, destination_key: &str) -> Option<&ApprovalStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.destinations.get(destination_key))
    }
}
