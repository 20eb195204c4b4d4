//! Kubernetes helpers shared by the translators and the output sync
//!
//! Output objects are plain serde structs, not kube `CustomResource` types,
//! so they carry their own [`ObjectMeta`] and declare their API coordinates
//! through [`HasApiResource`].

use std::collections::BTreeMap;

use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

// =============================================================================
// ObjectMeta - metadata for every generated output object
// =============================================================================

/// Kubernetes metadata for generated output objects.
///
/// Construction adds the managed-by label; the translator adds the owner label
/// and the parents annotation once it knows which inputs contributed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with the managed-by label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_TRELLIS.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Types with a compile-time API version and kind.
///
/// # Example
/// ```ignore
/// impl HasApiResource for VirtualService {
///     const API_VERSION: &'static str = "networking.istio.io/v1beta1";
///     const KIND: &'static str = "VirtualService";
/// }
/// let ar = VirtualService::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "networking.istio.io/v1beta1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "DestinationRule")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }

    /// `"group/version, Kind=K"` string used as a key in the parents annotation
    fn gvk_string() -> String {
        format!("{}, Kind={}", Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version); the core group is empty.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Plurals the fallback rules get wrong or that we want pinned
const KIND_PLURALS: &[(&str, &str)] = &[
    // Istio
    ("destinationrule", "destinationrules"),
    ("virtualservice", "virtualservices"),
    ("authorizationpolicy", "authorizationpolicies"),
    ("peerauthentication", "peerauthentications"),
    ("serviceentry", "serviceentries"),
    // SMI
    ("trafficsplit", "trafficsplits"),
    ("traffictarget", "traffictargets"),
    ("httproutegroup", "httproutegroups"),
    // App Mesh
    ("virtualrouter", "virtualrouters"),
    ("virtualnode", "virtualnodes"),
    // Trellis
    ("trafficpolicy", "trafficpolicies"),
    ("accesspolicy", "accesspolicies"),
    ("virtualmesh", "virtualmeshes"),
    ("failoverservice", "failoverservices"),
    ("mesh", "meshes"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for the mesh kinds we emit, falling back to simple
/// pluralization rules for anything else.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains and processes, so it can be
/// baked into object names that must not change between passes.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
