//! Record identities
//!
//! Every record the engine touches is addressed by `(namespace, name, cluster)`.
//! The owning cluster of an input record comes from the
//! [`CLUSTER_ANNOTATION`](crate::CLUSTER_ANNOTATION); records without it belong
//! to the management cluster, which is spelled as the empty string.

use std::fmt;

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::CLUSTER_ANNOTATION;

/// Globally unique reference to an object in one of the registered clusters
///
/// The derived ordering (namespace, then name, then cluster) is the total
/// order every snapshot collection is sorted by.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectRef {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
    /// Cluster the object lives in (empty for the management cluster)
    #[serde(default)]
    pub cluster_name: String,
}

impl ClusterObjectRef {
    /// Build a reference from its three parts
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            cluster_name: cluster_name.into(),
        }
    }

    /// Stable string key `name.namespace.cluster`, used for status maps
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.name, self.namespace, self.cluster_name)
    }

    /// Drop the cluster part
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl fmt::Display for ClusterObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Namespaced reference without a cluster
///
/// Resolved relative to the cluster of the record that holds it.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct ObjectRef {
    /// Name of the object
    pub name: String,
    /// Namespace of the object
    pub namespace: String,
}

impl ObjectRef {
    /// Build a reference from name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Qualify this reference with the cluster of `holder`
    pub fn within(&self, holder: &ClusterObjectRef) -> ClusterObjectRef {
        ClusterObjectRef::new(&self.name, &self.namespace, &holder.cluster_name)
    }
}

/// Anything with a cluster-qualified identity and a spec generation
pub trait Identified {
    /// Cluster-qualified identity of the record
    fn identity(&self) -> ClusterObjectRef;

    /// Current spec generation (0 when the store never assigned one)
    fn generation(&self) -> i64;
}

impl<K: Resource> Identified for K {
    fn identity(&self) -> ClusterObjectRef {
        let meta = self.meta();
        let cluster = meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(CLUSTER_ANNOTATION))
            .cloned()
            .unwrap_or_default();
        ClusterObjectRef {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            cluster_name: cluster,
        }
    }

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(name: &str, ns: &str, cluster: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                annotations: cluster.map(|c| {
                    BTreeMap::from([(CLUSTER_ANNOTATION.to_string(), c.to_string())])
                }),
                generation: Some(3),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_key_format() {
        let id = ClusterObjectRef::new("reviews", "bookinfo", "cluster-a");
        assert_eq!(id.key(), "reviews.bookinfo.cluster-a");
        assert_eq!(id.to_string(), "reviews.bookinfo.cluster-a");
    }

    #[test]
    fn test_ordering_is_namespace_then_name_then_cluster() {
        let mut ids = vec![
            ClusterObjectRef::new("b", "ns1", "c1"),
            ClusterObjectRef::new("a", "ns2", "c0"),
            ClusterObjectRef::new("a", "ns1", "c2"),
            ClusterObjectRef::new("a", "ns1", "c1"),
        ];
        ids.sort();
        let keys: Vec<_> = ids.iter().map(|i| i.key()).collect();
        assert_eq!(keys, vec!["a.ns1.c1", "a.ns1.c2", "b.ns1.c1", "a.ns2.c0"]);
    }

    #[test]
    fn test_identity_reads_cluster_annotation() {
        let s = secret("root-ca", "trellis-system", Some("cluster-a"));
        assert_eq!(
            s.identity(),
            ClusterObjectRef::new("root-ca", "trellis-system", "cluster-a")
        );
        assert_eq!(s.generation(), 3);
    }

    #[test]
    fn test_identity_without_annotation_is_management_cluster() {
        let s = secret("root-ca", "trellis-system", None);
        assert_eq!(s.identity().cluster_name, "");
    }

    #[test]
    fn test_object_ref_resolves_in_holder_cluster() {
        let holder = ClusterObjectRef::new("vm", "trellis-system", "mgmt");
        let mesh = ObjectRef::new("istiod-istio-system-c1", "trellis-system");
        assert_eq!(
            mesh.within(&holder),
            ClusterObjectRef::new("istiod-istio-system-c1", "trellis-system", "mgmt")
        );
        assert_eq!(holder.object_ref(), ObjectRef::new("vm", "trellis-system"));
    }
}
