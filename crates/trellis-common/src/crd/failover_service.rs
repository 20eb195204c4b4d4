//! FailoverService CRD: one hostname backed by services in several clusters

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApprovalState, ApprovalStatus};
use crate::identity::{ClusterObjectRef, ObjectRef};

/// Spec for a FailoverService
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.trellis.dev",
    version = "v1alpha1",
    kind = "FailoverService",
    plural = "failoverservices",
    shortname = "fs",
    namespaced,
    status = "FailoverServiceStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FailoverServiceSpec {
    /// DNS name clients use
    pub hostname: String,

    /// Port clients use
    pub port: FailoverPort,

    /// Meshes the hostname is exposed in
    pub meshes: Vec<ObjectRef>,

    /// Services in priority order; later entries take over when earlier fail
    pub backing_services: Vec<ClusterObjectRef>,
}

/// Port of a FailoverService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailoverPort {
    /// Port number
    pub number: u32,
    /// Application protocol (http, grpc, tcp)
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

/// Status for a FailoverService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailoverServiceStatus {
    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// ACCEPTED iff every selected mesh accepted this FailoverService
    #[serde(default)]
    pub state: ApprovalState,

    /// Approval per selected mesh, keyed by mesh identity key
    #[serde(default)]
    pub meshes: BTreeMap<String, ApprovalStatus>,

    /// Problems found with the spec itself
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    /// Errors that apply to the FailoverService as a whole
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}
