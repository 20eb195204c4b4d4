//! AccessPolicy CRD: which identities may call which destinations

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ApprovalStatus;
use crate::selector::{DestinationSelector, IdentitySelector};

/// Spec for an AccessPolicy
///
/// Access policies are additive: every accepted policy contributes one allow
/// rule, and none of them is dropped in favour of another.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.trellis.dev",
    version = "v1alpha1",
    kind = "AccessPolicy",
    plural = "accesspolicies",
    shortname = "ap",
    namespaced,
    status = "AccessPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicySpec {
    /// Calling identities (empty = any identity)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_selector: Vec<IdentitySelector>,

    /// Destinations being protected (empty = all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_selector: Vec<DestinationSelector>,

    /// Request paths allowed (empty = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_paths: Vec<String>,

    /// HTTP methods allowed (empty = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_methods: Vec<String>,

    /// Destination ports allowed (empty = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ports: Vec<u32>,
}

/// Status for an AccessPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicyStatus {
    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// Approval per selected destination, keyed by destination identity key
    #[serde(default)]
    pub destinations: BTreeMap<String, ApprovalStatus>,

    /// Identity keys of the workloads whose identity the policy admits
    #[serde(default)]
    pub workloads: Vec<String>,
}
