//! Writing a pass's outputs to the clusters
//!
//! Every rendered object is applied with server-side apply under the Trellis
//! field manager. Afterwards each cluster is listed per managed kind with the
//! owner label selector, and live objects the pass no longer produces are
//! deleted. Failures never stop the sync; they are collected and returned
//! together.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::join_all;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use trellis_common::{Error, FIELD_MANAGER};
use trellis_translator::{OutputSnapshot, RenderedObject};

// =============================================================================
// Errors
// =============================================================================

/// Which step of a sync failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOperation {
    /// Server-side apply of a desired object
    Apply,
    /// Listing live objects for garbage collection
    List,
    /// Deleting a stale object
    Delete,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::List => write!(f, "list"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One failed cluster operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncFailure {
    /// Operation attempted
    pub operation: SyncOperation,
    /// Target cluster
    pub cluster: String,
    /// Kind of the object (or listed kind)
    pub kind: String,
    /// `namespace/name`, empty for list failures
    pub object: String,
    /// Error text
    pub message: String,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} in cluster {:?}: {}",
            self.operation, self.kind, self.object, self.cluster, self.message
        )
    }
}

/// Errors returned by [`OutputSyncer::sync`]
#[derive(Debug, Error)]
pub enum SyncError {
    /// Outputs could not be serialized; nothing was written
    #[error("failed to render outputs: {0}")]
    Render(#[from] serde_json::Error),

    /// Some operations failed; the rest were carried out
    #[error("{} cluster operations failed", failures.len())]
    Partial {
        /// Every failure, in the order encountered
        failures: Vec<SyncFailure>,
    },
}

// =============================================================================
// ClusterWriter
// =============================================================================

/// A live object found by an owner-label list
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LiveObject {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

/// Cluster operations the syncer needs
///
/// Abstracted so the sync logic can be tested without clusters.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterWriter: Send + Sync {
    /// Server-side apply one object
    async fn apply(&self, object: &RenderedObject) -> Result<(), Error>;

    /// Objects of one kind carrying the owner label
    async fn list_owned(
        &self,
        cluster: &str,
        api_resource: &ApiResource,
        selector: &str,
    ) -> Result<Vec<LiveObject>, Error>;

    /// Delete one object
    async fn delete(
        &self,
        cluster: &str,
        api_resource: &ApiResource,
        object: &LiveObject,
    ) -> Result<(), Error>;
}

/// [`ClusterWriter`] backed by one kube client per cluster
pub struct KubeClusterWriter {
    clients: BTreeMap<String, Client>,
}

impl KubeClusterWriter {
    /// Build clients for `clusters` from kubeconfig contexts
    ///
    /// `context_for` maps a cluster name to its context; the kubeconfig is
    /// read from `path` or the default locations.
    pub async fn connect(
        clusters: &BTreeSet<String>,
        context_for: impl Fn(&str) -> String,
        path: Option<PathBuf>,
    ) -> Result<Self, Error> {
        let kubeconfig = match path {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| {
            Error::internal_with_context("connect", format!("failed to read kubeconfig: {e}"))
        })?;

        let mut clients = BTreeMap::new();
        for cluster in clusters {
            let options = KubeConfigOptions {
                context: Some(context_for(cluster)),
                ..Default::default()
            };
            let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "connect",
                        format!("failed to load context for cluster {cluster:?}: {e}"),
                    )
                })?;
            let client = Client::try_from(config).map_err(|e| {
                Error::internal_with_context(
                    "connect",
                    format!("failed to create client for cluster {cluster:?}: {e}"),
                )
            })?;
            clients.insert(cluster.clone(), client);
        }
        Ok(Self { clients })
    }

    fn client(&self, cluster: &str) -> Result<Client, Error> {
        self.clients.get(cluster).cloned().ok_or_else(|| {
            Error::internal_with_context("sync", format!("no client for cluster {cluster:?}"))
        })
    }
}

#[async_trait]
impl ClusterWriter for KubeClusterWriter {
    async fn apply(&self, object: &RenderedObject) -> Result<(), Error> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client(&object.cluster)?,
            &object.namespace,
            &object.api_resource,
        );
        api.patch(
            &object.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object.json),
        )
        .await
        .map_err(|e| Error::internal_with_context("apply", e.to_string()))?;
        Ok(())
    }

    async fn list_owned(
        &self,
        cluster: &str,
        api_resource: &ApiResource,
        selector: &str,
    ) -> Result<Vec<LiveObject>, Error> {
        let api: Api<DynamicObject> = Api::all_with(self.client(cluster)?, api_resource);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::internal_with_context("list", e.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .map(|o| LiveObject {
                name: o.metadata.name.unwrap_or_default(),
                namespace: o.metadata.namespace.unwrap_or_default(),
            })
            .collect())
    }

    async fn delete(
        &self,
        cluster: &str,
        api_resource: &ApiResource,
        object: &LiveObject,
    ) -> Result<(), Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client(cluster)?, &object.namespace, api_resource);
        api.delete(&object.name, &DeleteParams::default())
            .await
            .map_err(|e| Error::internal_with_context("delete", e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// OutputSyncer
// =============================================================================

/// Counts of a successful sync
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Objects applied
    pub applied: usize,
    /// Stale objects deleted
    pub deleted: usize,
}

/// Applies an [`OutputSnapshot`] and garbage-collects what it no longer holds
pub struct OutputSyncer<W> {
    writer: W,
}

impl<W: ClusterWriter> OutputSyncer<W> {
    /// Syncer writing through `writer`
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Apply every output and delete stale owned objects in `clusters`
    ///
    /// Clusters that receive outputs are always collected.
    #[instrument(skip_all, fields(instance = %outputs.instance_id))]
    pub async fn sync(
        &self,
        outputs: &OutputSnapshot,
        clusters: &BTreeSet<String>,
    ) -> Result<SyncReport, SyncError> {
        let rendered = outputs.rendered()?;
        let mut failures = Vec::new();
        let mut report = SyncReport::default();

        let results = join_all(rendered.iter().map(|object| self.writer.apply(object))).await;
        for (object, result) in rendered.iter().zip(results) {
            match result {
                Ok(()) => report.applied += 1,
                Err(e) => failures.push(SyncFailure {
                    operation: SyncOperation::Apply,
                    cluster: object.cluster.clone(),
                    kind: object.api_resource.kind.clone(),
                    object: format!("{}/{}", object.namespace, object.name),
                    message: e.to_string(),
                }),
            }
        }

        let desired: BTreeSet<(&str, &str, &str, &str)> = rendered
            .iter()
            .map(|o| {
                (
                    o.cluster.as_str(),
                    o.api_resource.kind.as_str(),
                    o.namespace.as_str(),
                    o.name.as_str(),
                )
            })
            .collect();
        let selector = outputs.owned_selector();
        let mut targets = clusters.clone();
        targets.extend(outputs.clusters());

        for cluster in &targets {
            for kind in OutputSnapshot::managed_kinds() {
                let live = match self.writer.list_owned(cluster, &kind, &selector).await {
                    Ok(live) => live,
                    Err(e) => {
                        warn!(cluster = %cluster, kind = %kind.kind, error = %e, "failed to list owned objects");
                        failures.push(SyncFailure {
                            operation: SyncOperation::List,
                            cluster: cluster.clone(),
                            kind: kind.kind.clone(),
                            object: String::new(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                for object in live {
                    let key = (
                        cluster.as_str(),
                        kind.kind.as_str(),
                        object.namespace.as_str(),
                        object.name.as_str(),
                    );
                    if desired.contains(&key) {
                        continue;
                    }
                    debug!(cluster = %cluster, kind = %kind.kind, name = %object.name, "deleting stale output");
                    match self.writer.delete(cluster, &kind, &object).await {
                        Ok(()) => report.deleted += 1,
                        Err(e) => failures.push(SyncFailure {
                            operation: SyncOperation::Delete,
                            cluster: cluster.clone(),
                            kind: kind.kind.clone(),
                            object: format!("{}/{}", object.namespace, object.name),
                            message: e.to_string(),
                        }),
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Err(SyncError::Partial { failures });
        }
        info!(
            applied = report.applied,
            deleted = report.deleted,
            clusters = targets.len(),
            "outputs synced"
        );
        Ok(report)
    }
}
