//! VirtualMesh CRD: shared trust and access posture across meshes

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApprovalState, ApprovalStatus};
use crate::identity::ObjectRef;

/// Spec for a VirtualMesh
///
/// A mesh can belong to at most one accepted VirtualMesh at a time.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.trellis.dev",
    version = "v1alpha1",
    kind = "VirtualMesh",
    plural = "virtualmeshes",
    shortname = "vm",
    namespaced,
    status = "VirtualMeshStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMeshSpec {
    /// Meshes grouped by this VirtualMesh
    pub meshes: Vec<ObjectRef>,

    /// Trust configuration shared by the grouped meshes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls_config: Option<MtlsConfig>,

    /// Deny-by-default posture for the grouped meshes
    #[serde(default)]
    pub global_access_policy: GlobalAccessPolicy,
}

/// Trust model for cross-mesh mTLS
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MtlsConfig {
    /// How the meshes establish trust
    pub trust: TrustModel,
    /// Restart mesh pods after the root changes
    #[serde(default)]
    pub auto_restart_pods: bool,
}

/// Shared or limited trust
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum TrustModel {
    /// All meshes use intermediates of one root CA
    Shared(SharedTrust),
    /// Meshes keep their own roots and trust via gateways
    Limited(LimitedTrust),
}

/// Shared root CA settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SharedTrust {
    /// Where the root certificate comes from
    pub root_certificate_authority: RootCertificateAuthority,
}

/// Source of a shared root CA
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RootCertificateAuthority {
    /// Generated by the control plane
    Generated(GeneratedRootCa),
    /// User-provided, read from a Secret in the VirtualMesh's cluster
    Secret(ObjectRef),
}

/// Parameters for a generated root CA
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRootCa {
    /// RSA key size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_key_size_bytes: Option<u32>,
}

/// Limited trust settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LimitedTrust {}

/// Whether meshes deny traffic not explicitly allowed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalAccessPolicy {
    /// Leave the meshes' default posture alone
    #[default]
    Disabled,
    /// Deny everything not allowed by an AccessPolicy
    Enabled,
}

impl VirtualMeshSpec {
    /// Whether the meshes should enforce strict mTLS
    pub fn has_mtls(&self) -> bool {
        self.mtls_config.is_some()
    }

    /// Secret holding a user-provided root CA, if any
    pub fn root_ca_secret(&self) -> Option<&ObjectRef> {
        match self.mtls_config.as_ref().map(|m| &m.trust) {
            Some(TrustModel::Shared(SharedTrust {
                root_certificate_authority: RootCertificateAuthority::Secret(secret),
            })) => Some(secret),
            _ => None,
        }
    }
}

/// Status for a VirtualMesh
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMeshStatus {
    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// ACCEPTED iff every selected mesh accepted this VirtualMesh
    #[serde(default)]
    pub state: ApprovalState,

    /// Approval per selected mesh, keyed by mesh identity key
    #[serde(default)]
    pub meshes: BTreeMap<String, ApprovalStatus>,

    /// Errors that apply to the VirtualMesh as a whole
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl VirtualMesh {
    /// State from the last committed pass
    pub fn previous_state(&self) -> ApprovalState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::from_yaml;

    #[test]
    fn test_root_ca_secret_lookup() {
        let yaml = r#"
meshes:
  - name: istiod-istio-system-c1
    namespace: trellis-system
mtlsConfig:
  trust:
    shared:
      rootCertificateAuthority:
        secret:
          name: root-ca
          namespace: trellis-system
globalAccessPolicy: ENABLED
"#;
        let spec: VirtualMeshSpec = from_yaml(yaml);
        assert!(spec.has_mtls());
        assert_eq!(spec.global_access_policy, GlobalAccessPolicy::Enabled);
        assert_eq!(
            spec.root_ca_secret(),
            Some(&ObjectRef::new("root-ca", "trellis-system"))
        );
    }

    #[test]
    fn test_generated_root_has_no_secret() {
        let spec: VirtualMeshSpec = from_yaml(
            "meshes: []\nmtlsConfig:\n  trust:\n    shared:\n      rootCertificateAuthority:\n        generated: {}\n",
        );
        assert!(spec.root_ca_secret().is_none());
        assert_eq!(spec.global_access_policy, GlobalAccessPolicy::Disabled);
    }
}
