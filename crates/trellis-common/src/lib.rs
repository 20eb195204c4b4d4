//! Common types for Trellis: mesh CRDs, identities, selectors and the input snapshot
//!
//! Everything the policy engine reads lives here:
//!
//! - **crd**: user intent (TrafficPolicy, AccessPolicy, VirtualMesh,
//!   FailoverService) and discovered records (Destination, Mesh, Workload,
//!   KubernetesCluster)
//! - **identity**: cluster-qualified object references with a total order
//! - **selector**: label/namespace/cluster matching for policies
//! - **snapshot**: the frozen, identity-ordered view of every record in a pass

#![deny(missing_docs)]

pub mod crd;
pub mod duration;
pub mod error;
pub mod identity;
pub mod kube_utils;
pub mod selector;
pub mod snapshot;
pub mod telemetry;

pub use error::Error;
pub use identity::{ClusterObjectRef, Identified, ObjectRef};
pub use snapshot::{InputSnapshot, ResourceSet};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation carrying the name of the cluster an input record was read from
pub const CLUSTER_ANNOTATION: &str = "cluster.trellis.dev/name";

/// Label stamped on every output object with the producing instance id
pub const OWNER_LABEL: &str = "owner.networking.trellis.dev";

/// Annotation listing the input records that contributed to an output object
pub const PARENTS_ANNOTATION: &str = "parents.networking.trellis.dev";

/// Standard Kubernetes managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for the managed-by label
pub const LABEL_MANAGED_BY_TRELLIS: &str = "trellis";

/// Cluster domain used when a KubernetesCluster record does not set one
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Field manager name for server-side apply of output objects
pub const FIELD_MANAGER: &str = "trellis-networking";
