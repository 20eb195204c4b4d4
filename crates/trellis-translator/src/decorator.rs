//! Decorator seam
//!
//! A decorator owns one policy feature on one backend. Translators hold an
//! explicit, ordered list of them and run every decorator over every applied
//! policy; a decorator that does not recognise the policy's feature does
//! nothing. Infeasibility goes to the reporter so that one decorator cannot
//! stop the others. The only error a decorator returns is a field conflict,
//! which the translator reports against the policy being applied.

use trellis_common::crd::{AppliedAccessPolicy, AppliedTrafficPolicy, Destination, Mesh, Workload};
use trellis_common::{ClusterObjectRef, Identified, InputSnapshot};

use crate::error::TranslationError;
use crate::field_ownership::{FieldConflict, FieldRegistrar};
use crate::reporter::{PolicyRef, Reporter};

/// What a decorator may read while decorating one destination's outputs
pub struct DecoratorContext<'a> {
    /// The whole input snapshot
    pub snapshot: &'a InputSnapshot,
    /// Destination being translated
    pub destination: &'a Destination,
    /// Identity of the destination record
    pub destination_id: ClusterObjectRef,
    /// Mesh managing the destination
    pub mesh: &'a Mesh,
}

impl<'a> DecoratorContext<'a> {
    /// Context for one destination
    pub fn new(snapshot: &'a InputSnapshot, destination: &'a Destination, mesh: &'a Mesh) -> Self {
        Self {
            snapshot,
            destination,
            destination_id: destination.identity(),
            mesh,
        }
    }

    /// Report a problem with `policy` on this destination
    pub fn report(&self, reporter: &mut dyn Reporter, policy: &PolicyRef, err: TranslationError) {
        reporter.report_policy_to_target(&self.destination_id, policy, err);
    }

    /// Cluster the destination's Service runs in
    pub fn cluster(&self) -> &str {
        &self.destination.service_ref().cluster_name
    }

    /// Cluster-local hostname of the destination
    pub fn local_fqdn(&self) -> String {
        self.fqdn_of(self.destination)
    }

    /// Cluster-local hostname of any destination
    pub fn fqdn_of(&self, destination: &Destination) -> String {
        let domain = self
            .snapshot
            .cluster_domain(&destination.service_ref().cluster_name);
        destination.local_fqdn(domain)
    }

    /// Destination backed by a Service referenced from a policy
    pub fn resolve_service(
        &self,
        service: &ClusterObjectRef,
    ) -> Result<&'a Destination, TranslationError> {
        self.snapshot
            .destination_for_service(service)
            .ok_or_else(|| TranslationError::missing("Service", service.key()))
    }

    /// Workloads backing the destination
    pub fn backing_workloads(&self) -> Vec<&'a Workload> {
        self.snapshot.backing_workloads(self.destination)
    }
}

/// Applies one TrafficPolicy feature to an output fragment `O`
pub trait TrafficPolicyDecorator<O>: Send + Sync {
    /// Feature handled, for logs
    fn feature(&self) -> &'static str;

    /// Apply `policy` to `output`, writing through `registrar`
    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        output: &mut O,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict>;
}

/// Contributes one AccessPolicy to an output fragment `O`
///
/// Access policies are additive, so there is nothing to conflict over.
pub trait AccessPolicyDecorator<O>: Send + Sync {
    /// Feature handled, for logs
    fn feature(&self) -> &'static str;

    /// Add the rules for `policy` to `output`
    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedAccessPolicy,
        output: &mut O,
        reporter: &mut dyn Reporter,
    );
}
