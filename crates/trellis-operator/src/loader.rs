//! Snapshot loading and result dumping
//!
//! Input is one or more multi-document YAML streams holding any mix of the
//! records the engine reads. Documents are dispatched on `kind`; records of
//! other kinds are an error rather than silently ignored.
//!
//! Records travel through `serde_json::Value` in both directions, as they do
//! between kube and the API server, so enum-valued fields keep their plain
//! map form (`policy: {requestTimeout: 3s}`) instead of YAML tags.

use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use trellis_common::crd::{
    AccessPolicy, Destination, FailoverService, KubernetesCluster, Mesh, TrafficPolicy,
    VirtualMesh, Workload,
};
use trellis_common::{InputSnapshot, ResourceSet};
use trellis_translator::OutputSnapshot;

/// Errors loading a snapshot
#[derive(Debug, Error)]
pub enum LoadError {
    /// A file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// A document is not valid YAML
    #[error("document {index}: {source}")]
    Yaml {
        /// Zero-based document index within its stream
        index: usize,
        /// Underlying error
        source: serde_yaml::Error,
    },

    /// A document has no `kind`
    #[error("document {index}: missing kind")]
    MissingKind {
        /// Zero-based document index within its stream
        index: usize,
    },

    /// A document has a kind the engine does not read
    #[error("document {index}: unsupported kind {kind}")]
    UnknownKind {
        /// Zero-based document index within its stream
        index: usize,
        /// The kind found
        kind: String,
    },

    /// A document of a known kind failed to decode
    #[error("document {index} ({kind}): {source}")]
    Decode {
        /// Zero-based document index within its stream
        index: usize,
        /// Kind of the document
        kind: String,
        /// Underlying error
        source: serde_json::Error,
    },

    /// Results could not be serialized
    #[error("failed to serialize results: {0}")]
    Dump(String),
}

fn decode<K>(
    index: usize,
    value: serde_json::Value,
    into: &mut ResourceSet<K>,
) -> Result<(), LoadError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Clone,
{
    let record: K = serde_json::from_value(value).map_err(|source| LoadError::Decode {
        index,
        kind: K::kind(&()).to_string(),
        source,
    })?;
    into.insert(record);
    Ok(())
}

fn is_kind<K: Resource<DynamicType = ()>>(kind: &str) -> bool {
    K::kind(&()) == kind
}

/// Add every record of a YAML stream to `snapshot`
pub fn load_into(snapshot: &mut InputSnapshot, text: &str) -> Result<(), LoadError> {
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_json::Value::deserialize(document)
            .map_err(|source| LoadError::Yaml { index, source })?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .ok_or(LoadError::MissingKind { index })?
            .to_string();

        match kind.as_str() {
            k if is_kind::<TrafficPolicy>(k) => decode(index, value, &mut snapshot.traffic_policies)?,
            k if is_kind::<AccessPolicy>(k) => decode(index, value, &mut snapshot.access_policies)?,
            k if is_kind::<VirtualMesh>(k) => decode(index, value, &mut snapshot.virtual_meshes)?,
            k if is_kind::<FailoverService>(k) => {
                decode(index, value, &mut snapshot.failover_services)?
            }
            k if is_kind::<Destination>(k) => decode(index, value, &mut snapshot.destinations)?,
            k if is_kind::<Mesh>(k) => decode(index, value, &mut snapshot.meshes)?,
            k if is_kind::<Workload>(k) => decode(index, value, &mut snapshot.workloads)?,
            k if is_kind::<KubernetesCluster>(k) => decode(index, value, &mut snapshot.clusters)?,
            k if is_kind::<Secret>(k) => decode(index, value, &mut snapshot.secrets)?,
            _ => return Err(LoadError::UnknownKind { index, kind }),
        }
    }
    Ok(())
}

/// Read and merge several YAML files into one snapshot
pub async fn load_files(paths: &[impl AsRef<Path>]) -> Result<InputSnapshot, LoadError> {
    let mut snapshot = InputSnapshot::default();
    for path in paths {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| LoadError::Io {
                path: path.display().to_string(),
                source,
            })?;
        load_into(&mut snapshot, &text)?;
        debug!(path = %path.display(), records = snapshot.total_count(), "loaded snapshot file");
    }
    Ok(snapshot)
}

fn push_documents<K: serde::Serialize>(
    records: impl Iterator<Item = K>,
    out: &mut Vec<String>,
) -> Result<(), LoadError> {
    for record in records {
        let value = serde_json::to_value(&record).map_err(|e| LoadError::Dump(e.to_string()))?;
        out.push(serde_yaml::to_string(&value).map_err(|e| LoadError::Dump(e.to_string()))?);
    }
    Ok(())
}

/// Every record whose status the engine writes, then every output object,
/// as one multi-document YAML stream
pub fn dump(snapshot: &InputSnapshot, outputs: &OutputSnapshot) -> Result<String, LoadError> {
    let mut documents = Vec::new();
    push_documents(snapshot.traffic_policies.iter(), &mut documents)?;
    push_documents(snapshot.access_policies.iter(), &mut documents)?;
    push_documents(snapshot.virtual_meshes.iter(), &mut documents)?;
    push_documents(snapshot.failover_services.iter(), &mut documents)?;
    push_documents(snapshot.destinations.iter(), &mut documents)?;
    push_documents(snapshot.meshes.iter(), &mut documents)?;
    let rendered = outputs
        .rendered()
        .map_err(|e| LoadError::Dump(e.to_string()))?;
    push_documents(rendered.into_iter().map(|r| r.json), &mut documents)?;
    Ok(documents.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::{ClusterObjectRef, Identified};

    const INPUT: &str = r#"
apiVersion: discovery.trellis.dev/v1alpha1
kind: Mesh
metadata:
  name: istiod-istio-system-c1
  namespace: trellis-system
spec:
  meshType:
    istio:
      installation:
        namespace: istio-system
        cluster: c1
---
apiVersion: discovery.trellis.dev/v1alpha1
kind: Destination
metadata:
  name: reviews-bookinfo-c1
  namespace: trellis-system
  annotations:
    cluster.trellis.dev/name: c1
spec:
  kubeService:
    ref:
      name: reviews
      namespace: bookinfo
      clusterName: c1
    ports:
      - port: 9080
  mesh:
    name: istiod-istio-system-c1
    namespace: trellis-system
---
apiVersion: networking.trellis.dev/v1alpha1
kind: TrafficPolicy
metadata:
  name: reviews-timeout
  namespace: bookinfo
spec:
  policy:
    requestTimeout: 3s
---
apiVersion: v1
kind: Secret
metadata:
  name: root-ca
  namespace: trellis-system
"#;

    #[test]
    fn test_documents_are_dispatched_by_kind() {
        let mut snapshot = InputSnapshot::default();
        load_into(&mut snapshot, INPUT).unwrap();
        assert_eq!(snapshot.meshes.len(), 1);
        assert_eq!(snapshot.traffic_policies.len(), 1);
        assert_eq!(snapshot.secrets.len(), 1);
        let destination = snapshot.destinations.iter().next().unwrap();
        assert_eq!(
            destination.identity(),
            ClusterObjectRef::new("reviews-bookinfo-c1", "trellis-system", "c1")
        );
    }

    #[test]
    fn test_empty_documents_are_skipped() {
        let mut snapshot = InputSnapshot::default();
        load_into(&mut snapshot, "---\n---\n").unwrap();
        assert_eq!(snapshot.total_count(), 0);
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let mut snapshot = InputSnapshot::default();
        let err = load_into(&mut snapshot, "apiVersion: v1\nkind: ConfigMap\n").unwrap_err();
        assert!(matches!(err, LoadError::UnknownKind { index: 0, .. }));
        assert_eq!(err.to_string(), "document 0: unsupported kind ConfigMap");
    }

    #[test]
    fn test_missing_kind_is_an_error() {
        let mut snapshot = InputSnapshot::default();
        let err = load_into(&mut snapshot, "apiVersion: v1\n").unwrap_err();
        assert!(matches!(err, LoadError::MissingKind { index: 0 }));
    }

    #[test]
    fn test_malformed_record_names_its_kind() {
        let mut snapshot = InputSnapshot::default();
        let text = "apiVersion: networking.trellis.dev/v1alpha1\nkind: TrafficPolicy\nmetadata:\n  name: x\nspec: {}\n";
        let err = load_into(&mut snapshot, text).unwrap_err();
        assert!(matches!(err, LoadError::Decode { ref kind, .. } if kind == "TrafficPolicy"));
    }

    #[test]
    fn test_dump_writes_one_document_per_record() {
        let mut snapshot = InputSnapshot::default();
        load_into(&mut snapshot, INPUT).unwrap();
        let text = dump(&snapshot, &OutputSnapshot::new("trellis")).unwrap();
        assert_eq!(text.matches("kind:").count(), 3);
        assert!(text.contains("kind: TrafficPolicy"));
        assert!(text.contains("requestTimeout: 3s"));
        assert!(!text.contains('!'));
    }

    #[test]
    fn story_policy_and_trust_unions_load_from_their_map_form() {
        let text = r#"
apiVersion: networking.trellis.dev/v1alpha1
kind: TrafficPolicy
metadata:
  name: reviews-retries
  namespace: bookinfo
spec:
  policy:
    retries:
      attempts: 3
      perTryTimeout: 2s
---
apiVersion: networking.trellis.dev/v1alpha1
kind: VirtualMesh
metadata:
  name: global
  namespace: trellis-system
spec:
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
"#;
        let mut snapshot = InputSnapshot::default();
        load_into(&mut snapshot, text).unwrap();

        let policy = snapshot.traffic_policies.iter().next().unwrap();
        assert_eq!(policy.spec.policy.retries().map(|r| r.attempts), Some(3));
        let mesh = snapshot.virtual_meshes.iter().next().unwrap();
        assert!(mesh.spec.has_mtls());
        assert_eq!(
            mesh.spec.root_ca_secret(),
            Some(&trellis_common::ObjectRef::new("root-ca", "trellis-system"))
        );

        let dumped = dump(&snapshot, &OutputSnapshot::new("trellis")).unwrap();
        let mut reloaded = InputSnapshot::default();
        load_into(&mut reloaded, &dumped).unwrap();
        assert_eq!(reloaded.traffic_policies.len(), 1);
        assert_eq!(reloaded.virtual_meshes.len(), 1);
    }
}
