//! The output snapshot: every backend resource produced by one pass
//!
//! Each object is stamped with the owner label (so a later pass can list and
//! garbage-collect what this instance wrote) and a parents annotation naming
//! the input records that contributed to it.

pub mod appmesh;
pub mod istio;
pub mod smi;

use std::collections::{BTreeMap, BTreeSet};

use kube::discovery::ApiResource;
use kube::Resource;
use serde::Serialize;

use trellis_common::kube_utils::{HasApiResource, ObjectMeta};
use trellis_common::{ClusterObjectRef, ObjectRef, OWNER_LABEL, PARENTS_ANNOTATION};

pub use appmesh::AppMeshOutputs;
pub use istio::IstioOutputs;
pub use smi::SmiOutputs;

/// A generated backend resource
pub trait OutputResource: HasApiResource + Serialize {
    /// Object metadata
    fn metadata(&self) -> &ObjectMeta;
    /// Mutable object metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

/// Declares an output resource type: `apiVersion`/`kind` fields filled from
/// the type's constants, a `new(metadata, spec)` constructor and the
/// [`OutputResource`] impl.
macro_rules! output_resource {
    ($ty:ident, $spec:ty, $api_version:literal, $kind:literal) => {
        #[doc = concat!("`", $kind, "` (", $api_version, ")")]
        #[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
        #[serde(rename_all = "camelCase")]
        pub struct $ty {
            /// API version
            pub api_version: String,
            /// Kind
            pub kind: String,
            /// Metadata
            pub metadata: trellis_common::kube_utils::ObjectMeta,
            /// Spec
            pub spec: $spec,
        }

        impl trellis_common::kube_utils::HasApiResource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;
        }

        impl $ty {
            /// Create a new resource
            pub fn new(metadata: trellis_common::kube_utils::ObjectMeta, spec: $spec) -> Self {
                Self {
                    api_version: $api_version.to_string(),
                    kind: $kind.to_string(),
                    metadata,
                    spec,
                }
            }
        }

        impl $crate::output::OutputResource for $ty {
            fn metadata(&self) -> &trellis_common::kube_utils::ObjectMeta {
                &self.metadata
            }
            fn metadata_mut(&mut self) -> &mut trellis_common::kube_utils::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use output_resource;

// =============================================================================
// Parents
// =============================================================================

/// Input records that contributed to an output object
///
/// Serialized as a JSON map `"group/version, Kind=K" -> [{name, namespace}]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parents {
    by_kind: BTreeMap<String, BTreeSet<ObjectRef>>,
}

impl Parents {
    /// No parents yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a contributing input of kind `K`
    pub fn add<K: Resource<DynamicType = ()>>(&mut self, id: &ClusterObjectRef) {
        let key = format!("{}, Kind={}", K::api_version(&()), K::kind(&()));
        self.by_kind.entry(key).or_default().insert(id.object_ref());
    }

    /// Builder form of [`Parents::add`]
    pub fn with<K: Resource<DynamicType = ()>>(mut self, id: &ClusterObjectRef) -> Self {
        self.add::<K>(id);
        self
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// Annotation value
    pub fn to_annotation(&self) -> String {
        let map: BTreeMap<&String, Vec<&ObjectRef>> = self
            .by_kind
            .iter()
            .map(|(k, refs)| (k, refs.iter().collect()))
            .collect();
        // A map of strings to plain structs cannot fail to serialize.
        serde_json::to_string(&map).unwrap_or_default()
    }
}

// =============================================================================
// Output wrapper
// =============================================================================

/// An output resource bound to the cluster it is written to
#[derive(Clone, Debug, PartialEq)]
pub struct Output<T> {
    /// Destination cluster
    pub cluster: String,
    /// The resource, with owner label and parents annotation applied
    pub resource: T,
}

impl<T: OutputResource> Output<T> {
    /// Stamp ownership metadata on `resource` and bind it to `cluster`
    pub fn new(
        instance_id: &str,
        cluster: impl Into<String>,
        mut resource: T,
        parents: &Parents,
    ) -> Self {
        let meta = resource.metadata_mut();
        meta.labels
            .insert(OWNER_LABEL.to_string(), instance_id.to_string());
        if !parents.is_empty() {
            meta.annotations
                .insert(PARENTS_ANNOTATION.to_string(), parents.to_annotation());
        }
        Self {
            cluster: cluster.into(),
            resource,
        }
    }

    /// Name of the resource
    pub fn name(&self) -> &str {
        &self.resource.metadata().name
    }

    /// Namespace of the resource
    pub fn namespace(&self) -> &str {
        &self.resource.metadata().namespace
    }

    fn render(&self) -> Result<RenderedObject, serde_json::Error> {
        Ok(RenderedObject {
            cluster: self.cluster.clone(),
            api_resource: T::api_resource(),
            name: self.name().to_string(),
            namespace: self.namespace().to_string(),
            json: serde_json::to_value(&self.resource)?,
        })
    }
}

/// Render a list of outputs, appending to `out`
pub(crate) fn render_all<T: OutputResource>(
    items: &[Output<T>],
    out: &mut Vec<RenderedObject>,
) -> Result<(), serde_json::Error> {
    for item in items {
        out.push(item.render()?);
    }
    Ok(())
}

/// An output object ready for server-side apply
#[derive(Clone, Debug)]
pub struct RenderedObject {
    /// Cluster to write to
    pub cluster: String,
    /// API coordinates
    pub api_resource: ApiResource,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Full object body
    pub json: serde_json::Value,
}

// =============================================================================
// OutputSnapshot
// =============================================================================

/// Everything one pass produced, grouped by backend
#[derive(Clone, Debug, Default)]
pub struct OutputSnapshot {
    /// Instance id stamped in the owner label
    pub instance_id: String,
    /// Istio resources
    pub istio: IstioOutputs,
    /// SMI resources
    pub smi: SmiOutputs,
    /// App Mesh resources
    pub appmesh: AppMeshOutputs,
}

impl OutputSnapshot {
    /// Empty snapshot for an instance
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    /// Label selector matching every object this instance owns
    pub fn owned_selector(&self) -> String {
        format!("{}={}", OWNER_LABEL, self.instance_id)
    }

    /// Every kind this engine can write, for garbage-collection listing
    pub fn managed_kinds() -> Vec<ApiResource> {
        let mut kinds = IstioOutputs::kinds();
        kinds.extend(SmiOutputs::kinds());
        kinds.extend(AppMeshOutputs::kinds());
        kinds
    }

    /// Clusters that receive at least one object
    pub fn clusters(&self) -> BTreeSet<String> {
        self.istio
            .clusters()
            .into_iter()
            .chain(self.smi.clusters())
            .chain(self.appmesh.clusters())
            .collect()
    }

    /// Total number of objects
    pub fn total_count(&self) -> usize {
        self.istio.total_count() + self.smi.total_count() + self.appmesh.total_count()
    }

    /// Whether no objects were produced
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    /// Serialize every object for apply, in a stable order
    pub fn rendered(&self) -> Result<Vec<RenderedObject>, serde_json::Error> {
        let mut out = Vec::with_capacity(self.total_count());
        self.istio.render_into(&mut out)?;
        self.smi.render_into(&mut out)?;
        self.appmesh.render_into(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::istio::{PeerAuthentication, PeerAuthenticationSpec, PeerMtls};
    use trellis_common::crd::{TrafficPolicy, VirtualMesh};

    fn id(name: &str) -> ClusterObjectRef {
        ClusterObjectRef::new(name, "trellis-system", "mgmt")
    }

    #[test]
    fn test_parents_annotation_groups_by_kind() {
        let parents = Parents::new()
            .with::<TrafficPolicy>(&id("tp2"))
            .with::<TrafficPolicy>(&id("tp1"))
            .with::<TrafficPolicy>(&id("tp1"))
            .with::<VirtualMesh>(&id("vm"));
        assert_eq!(
            parents.to_annotation(),
            r#"{"networking.trellis.dev/v1alpha1, Kind=TrafficPolicy":[{"name":"tp1","namespace":"trellis-system"},{"name":"tp2","namespace":"trellis-system"}],"networking.trellis.dev/v1alpha1, Kind=VirtualMesh":[{"name":"vm","namespace":"trellis-system"}]}"#
        );
    }

    #[test]
    fn test_output_stamps_owner_and_parents() {
        let pa = PeerAuthentication::new(
            ObjectMeta::new("default", "istio-system"),
            PeerAuthenticationSpec {
                mtls: PeerMtls {
                    mode: "STRICT".into(),
                },
            },
        );
        let out = Output::new("trellis-a", "c1", pa, &Parents::new().with::<VirtualMesh>(&id("vm")));
        let meta = &out.resource.metadata;
        assert_eq!(meta.labels.get(OWNER_LABEL).map(String::as_str), Some("trellis-a"));
        assert!(meta.annotations.contains_key(PARENTS_ANNOTATION));
        assert_eq!(out.name(), "default");
        assert_eq!(out.namespace(), "istio-system");

        let mut snapshot = OutputSnapshot::new("trellis-a");
        snapshot.istio.peer_authentications.push(out);
        assert_eq!(snapshot.owned_selector(), "owner.networking.trellis.dev=trellis-a");
        assert_eq!(snapshot.total_count(), 1);
        assert_eq!(snapshot.clusters().into_iter().collect::<Vec<_>>(), vec!["c1"]);

        let rendered = snapshot.rendered().unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].api_resource.kind, "PeerAuthentication");
        assert_eq!(rendered[0].json["apiVersion"], "security.istio.io/v1beta1");
        assert_eq!(rendered[0].json["spec"]["mtls"]["mode"], "STRICT");
    }

    #[test]
    fn test_managed_kinds_cover_every_backend() {
        let kinds: Vec<String> = OutputSnapshot::managed_kinds()
            .into_iter()
            .map(|k| k.kind)
            .collect();
        for kind in [
            "DestinationRule",
            "TrafficSplit",
            "HTTPRouteGroup",
            "VirtualRouter",
        ] {
            assert!(kinds.iter().any(|k| k == kind), "missing {kind}");
        }
    }
}
