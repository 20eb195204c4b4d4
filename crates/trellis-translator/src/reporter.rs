//! Diagnostic sink for per-policy translation problems
//!
//! Translators and decorators never fail a pass because a policy cannot be
//! honored; they tell a [`Reporter`] and move on. The applier's dry run uses a
//! [`CollectingReporter`] to turn those reports into INVALID statuses, the
//! real pass uses a [`LoggingReporter`].

use std::collections::BTreeMap;
use std::fmt;

#[cfg(test)]
use mockall::automock;
use tracing::warn;

use trellis_common::ClusterObjectRef;

use crate::error::TranslationError;

/// Kind of record a diagnostic is attributed to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyKind {
    /// TrafficPolicy
    TrafficPolicy,
    /// AccessPolicy
    AccessPolicy,
    /// VirtualMesh
    VirtualMesh,
    /// FailoverService
    FailoverService,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrafficPolicy => write!(f, "TrafficPolicy"),
            Self::AccessPolicy => write!(f, "AccessPolicy"),
            Self::VirtualMesh => write!(f, "VirtualMesh"),
            Self::FailoverService => write!(f, "FailoverService"),
        }
    }
}

/// A typed reference to a policy-like record
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyRef {
    /// Record kind
    pub kind: PolicyKind,
    /// Record identity
    pub reference: ClusterObjectRef,
}

impl PolicyRef {
    /// Reference to a TrafficPolicy
    pub fn traffic(reference: &ClusterObjectRef) -> Self {
        Self {
            kind: PolicyKind::TrafficPolicy,
            reference: reference.clone(),
        }
    }

    /// Reference to an AccessPolicy
    pub fn access(reference: &ClusterObjectRef) -> Self {
        Self {
            kind: PolicyKind::AccessPolicy,
            reference: reference.clone(),
        }
    }

    /// Reference to a VirtualMesh
    pub fn virtual_mesh(reference: &ClusterObjectRef) -> Self {
        Self {
            kind: PolicyKind::VirtualMesh,
            reference: reference.clone(),
        }
    }

    /// Reference to a FailoverService
    pub fn failover(reference: &ClusterObjectRef) -> Self {
        Self {
            kind: PolicyKind::FailoverService,
            reference: reference.clone(),
        }
    }
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.reference)
    }
}

/// Sink for "policy X cannot be honored here because Y"
///
/// Implementations must not fail; reporting is fire-and-forget.
#[cfg_attr(test, automock)]
pub trait Reporter {
    /// A policy cannot be applied to a destination
    fn report_policy_to_target(
        &mut self,
        target: &ClusterObjectRef,
        policy: &PolicyRef,
        err: TranslationError,
    );

    /// A policy cannot be applied to a mesh
    fn report_policy_to_mesh(
        &mut self,
        mesh: &ClusterObjectRef,
        policy: &PolicyRef,
        err: TranslationError,
    );

    /// A FailoverService is invalid everywhere
    fn report_failover_service(
        &mut self,
        failover_service: &ClusterObjectRef,
        errs: Vec<TranslationError>,
    );
}

// =============================================================================
// CollectingReporter
// =============================================================================

/// Records every report, keyed by (attachment point, policy)
///
/// Messages keep report order within a key; duplicates of the same message
/// for the same key are dropped so repeated translation of one mesh does not
/// inflate status errors.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    target_errors: BTreeMap<(ClusterObjectRef, PolicyRef), Vec<String>>,
    mesh_errors: BTreeMap<(ClusterObjectRef, PolicyRef), Vec<String>>,
    failover_errors: BTreeMap<ClusterObjectRef, Vec<String>>,
}

impl CollectingReporter {
    /// Empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors reported for a policy on a destination
    pub fn target_errors(&self, target: &ClusterObjectRef, policy: &PolicyRef) -> &[String] {
        self.target_errors
            .get(&(target.clone(), policy.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Errors reported for a policy on a mesh
    pub fn mesh_errors(&self, mesh: &ClusterObjectRef, policy: &PolicyRef) -> &[String] {
        self.mesh_errors
            .get(&(mesh.clone(), policy.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Validation errors reported for a FailoverService
    pub fn failover_errors(&self, failover_service: &ClusterObjectRef) -> &[String] {
        self.failover_errors
            .get(failover_service)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether nothing was reported
    pub fn is_empty(&self) -> bool {
        self.target_errors.is_empty()
            && self.mesh_errors.is_empty()
            && self.failover_errors.is_empty()
    }
}

fn push_unique(messages: &mut Vec<String>, message: String) {
    if !messages.contains(&message) {
        messages.push(message);
    }
}

impl Reporter for CollectingReporter {
    fn report_policy_to_target(
        &mut self,
        target: &ClusterObjectRef,
        policy: &PolicyRef,
        err: TranslationError,
    ) {
        push_unique(
            self.target_errors
                .entry((target.clone(), policy.clone()))
                .or_default(),
            err.to_string(),
        );
    }

    fn report_policy_to_mesh(
        &mut self,
        mesh: &ClusterObjectRef,
        policy: &PolicyRef,
        err: TranslationError,
    ) {
        push_unique(
            self.mesh_errors
                .entry((mesh.clone(), policy.clone()))
                .or_default(),
            err.to_string(),
        );
    }

    fn report_failover_service(
        &mut self,
        failover_service: &ClusterObjectRef,
        errs: Vec<TranslationError>,
    ) {
        let messages = self
            .failover_errors
            .entry(failover_service.clone())
            .or_default();
        for err in errs {
            push_unique(messages, err.to_string());
        }
    }
}

// =============================================================================
// LoggingReporter
// =============================================================================

/// Logs reports and counts them
///
/// Used for the real translation pass, after the applier has already excluded
/// every policy the dry run rejected; anything reported here means the two
/// passes disagreed.
#[derive(Debug, Default)]
pub struct LoggingReporter {
    count: usize,
}

impl LoggingReporter {
    /// Number of reports received
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Reporter for LoggingReporter {
    fn report_policy_to_target(
        &mut self,
        target: &ClusterObjectRef,
        policy: &PolicyRef,
        err: TranslationError,
    ) {
        self.count += 1;
        warn!(target = %target, policy = %policy, error = %err, "policy rejected for destination");
    }

    fn report_policy_to_mesh(
        &mut self,
        mesh: &ClusterObjectRef,
        policy: &PolicyRef,
        err: TranslationError,
    ) {
        self.count += 1;
        warn!(mesh = %mesh, policy = %policy, error = %err, "policy rejected for mesh");
    }

    fn report_failover_service(
        &mut self,
        failover_service: &ClusterObjectRef,
        errs: Vec<TranslationError>,
    ) {
        self.count += 1;
        let errors: Vec<String> = errs.iter().map(ToString::to_string).collect();
        warn!(failover_service = %failover_service, ?errors, "failover service invalid");
    }
}
