//! Policy application: selection, exclusivity, ordering and status
//!
//! The applier decides which policy records apply where. It never produces
//! outputs itself; instead it stamps every candidate onto a throwaway copy of
//! the snapshot, runs the translator over that copy with a collecting
//! reporter, and turns every reported problem into an INVALID status. What
//! survives is written back as the applied lists the real translation pass
//! consumes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, instrument};

use trellis_common::crd::{
    aggregate_state, AccessPolicyStatus, AppliedAccessPolicy, AppliedFailoverService,
    AppliedTrafficPolicy, AppliedVirtualMesh, ApprovalState, ApprovalStatus, Destination,
    DestinationStatus, FailoverServiceStatus, MeshStatus, TrafficPolicyStatus, VirtualMeshStatus,
};
use trellis_common::selector::selector_matches;
use trellis_common::{ClusterObjectRef, Identified, InputSnapshot};
use trellis_translator::{CollectingReporter, PolicyRef, Translate};

use crate::ordering::sort_for_acceptance;
use crate::virtual_mesh::{claim_meshes, missing_meshes, MeshClaims};
use crate::workloads::{access_policy_workloads, traffic_policy_workloads};

// =============================================================================
// Plans
// =============================================================================

/// Policies attached to one destination, in acceptance order
#[derive(Clone, Debug, Default)]
struct DestinationPlan {
    traffic: Vec<ClusterObjectRef>,
    access: Vec<ClusterObjectRef>,
}

/// Records attached to one mesh
#[derive(Clone, Debug, Default)]
struct MeshPlan {
    virtual_mesh: Option<ClusterObjectRef>,
    failover: Vec<ClusterObjectRef>,
}

/// What is attached where; first every candidate, then only the accepted
#[derive(Clone, Debug, Default)]
struct Plan {
    destinations: BTreeMap<ClusterObjectRef, DestinationPlan>,
    meshes: BTreeMap<ClusterObjectRef, MeshPlan>,
}

/// Approval of one record at every attachment point, keyed by attachment key
type Approvals = BTreeMap<ClusterObjectRef, BTreeMap<String, ApprovalStatus>>;

/// Counts of one pass, for logging
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// ACCEPTED approvals written
    pub accepted: usize,
    /// INVALID approvals written
    pub invalid: usize,
}

impl ApplySummary {
    fn count(&mut self, approvals: &Approvals) {
        for status in approvals.values().flat_map(|m| m.values()) {
            match status.state {
                ApprovalState::Accepted => self.accepted += 1,
                ApprovalState::Invalid => self.invalid += 1,
                ApprovalState::Pending => {}
            }
        }
    }
}

/// Verdicts of the dry run
#[derive(Debug, Default)]
struct Verdicts {
    traffic: Approvals,
    access: Approvals,
    virtual_meshes: Approvals,
    failover: Approvals,
    failover_validation: BTreeMap<ClusterObjectRef, Vec<String>>,
    accepted: Plan,
}

// =============================================================================
// Applier
// =============================================================================

/// Applies policy records to destinations and meshes
pub struct Applier<'a> {
    translator: &'a dyn Translate,
}

impl<'a> Applier<'a> {
    /// Applier validating candidates with `translator`
    pub fn new(translator: &'a dyn Translate) -> Self {
        Self { translator }
    }

    /// Rewrite the status of every policy, VirtualMesh, FailoverService,
    /// destination and mesh in the snapshot
    #[instrument(skip_all, fields(records = snapshot.total_count()))]
    pub fn apply(&self, snapshot: &mut InputSnapshot) -> ApplySummary {
        let unresolved_virtual_meshes: BTreeMap<ClusterObjectRef, Vec<String>> = snapshot
            .virtual_meshes
            .iter()
            .map(|vm| (vm.identity(), missing_meshes(snapshot, &vm.identity(), &vm.spec.meshes)))
            .filter(|(_, errors)| !errors.is_empty())
            .collect();
        let unresolved_failover: BTreeMap<ClusterObjectRef, Vec<String>> = snapshot
            .failover_services
            .iter()
            .map(|fs| (fs.identity(), missing_meshes(snapshot, &fs.identity(), &fs.spec.meshes)))
            .filter(|(_, errors)| !errors.is_empty())
            .collect();

        let skip: BTreeSet<ClusterObjectRef> = unresolved_virtual_meshes.keys().cloned().collect();
        let claims = claim_meshes(snapshot, &skip);
        let candidates = assign(snapshot, &claims, &unresolved_failover);

        let mut dry_run = snapshot.clone();
        stamp_targets(&mut dry_run, &candidates);
        let mut reporter = CollectingReporter::new();
        // Dry-run outputs are discarded; only the reports classify candidates.
        let _outputs = self.translator.translate(&dry_run, &mut reporter);
        let verdicts = judge(&candidates, &reporter);

        stamp_targets(snapshot, &verdicts.accepted);
        let summary = commit_policies(
            snapshot,
            &verdicts,
            &claims,
            &unresolved_virtual_meshes,
            &unresolved_failover,
        );
        info!(
            accepted = summary.accepted,
            invalid = summary.invalid,
            "policies applied"
        );
        summary
    }
}

// =============================================================================
// Candidate assignment
// =============================================================================

fn assign(
    snapshot: &InputSnapshot,
    claims: &MeshClaims,
    unresolved_failover: &BTreeMap<ClusterObjectRef, Vec<String>>,
) -> Plan {
    let mut plan = Plan::default();
    for destination in snapshot.destinations.iter() {
        let key = destination.identity().key();
        let mut traffic = snapshot
            .traffic_policies
            .list(|tp| selector_matches(&tp.spec.destination_selector, destination));
        sort_for_acceptance(&key, &mut traffic);
        let access = snapshot
            .access_policies
            .list(|ap| selector_matches(&ap.spec.destination_selector, destination));
        plan.destinations.insert(
            destination.identity(),
            DestinationPlan {
                traffic: traffic.iter().map(|tp| tp.identity()).collect(),
                access: access.iter().map(|ap| ap.identity()).collect(),
            },
        );
    }

    for mesh in snapshot.meshes.iter() {
        let id = mesh.identity();
        let failover = snapshot
            .failover_services
            .list(|fs| {
                let fs_id = fs.identity();
                !unresolved_failover.contains_key(&fs_id)
                    && fs.spec.meshes.iter().any(|m| m.within(&fs_id) == id)
            })
            .iter()
            .map(|fs| fs.identity())
            .collect();
        plan.meshes.insert(
            id.clone(),
            MeshPlan {
                virtual_mesh: claims.owner_of(&id).cloned(),
                failover,
            },
        );
    }
    plan
}

// =============================================================================
// Stamping
// =============================================================================

/// Replace destination and mesh statuses with the records in `plan`
fn stamp_targets(snapshot: &mut InputSnapshot, plan: &Plan) {
    let mut destination_statuses = Vec::with_capacity(plan.destinations.len());
    for (id, attached) in &plan.destinations {
        let Ok(destination) = snapshot.destinations.find(id) else {
            error!(destination = %id, "should never happen: planned destination missing");
            continue;
        };
        let applied_traffic_policies = attached
            .traffic
            .iter()
            .filter_map(|p| match snapshot.traffic_policies.find(p) {
                Ok(tp) => Some(AppliedTrafficPolicy {
                    reference: p.clone(),
                    observed_generation: tp.generation(),
                    spec: tp.spec.clone(),
                }),
                Err(err) => {
                    error!(error = %err, "should never happen: planned policy missing");
                    None
                }
            })
            .collect();
        let applied_access_policies = attached
            .access
            .iter()
            .filter_map(|p| match snapshot.access_policies.find(p) {
                Ok(ap) => Some(AppliedAccessPolicy {
                    reference: p.clone(),
                    observed_generation: ap.generation(),
                    spec: ap.spec.clone(),
                }),
                Err(err) => {
                    error!(error = %err, "should never happen: planned policy missing");
                    None
                }
            })
            .collect();
        let domain = snapshot.cluster_domain(&destination.service_ref().cluster_name);
        destination_statuses.push((
            id.clone(),
            DestinationStatus {
                observed_generation: destination.generation(),
                applied_traffic_policies,
                applied_access_policies,
                local_fqdn: destination.local_fqdn(domain),
            },
        ));
    }

    let mut mesh_statuses = Vec::with_capacity(plan.meshes.len());
    for (id, attached) in &plan.meshes {
        let Ok(mesh) = snapshot.meshes.find(id) else {
            error!(mesh = %id, "should never happen: planned mesh missing");
            continue;
        };
        let applied_virtual_mesh = attached.virtual_mesh.as_ref().and_then(|vm_id| {
            let vm = snapshot.virtual_meshes.find(vm_id).ok()?;
            Some(AppliedVirtualMesh {
                reference: vm_id.clone(),
                observed_generation: vm.generation(),
                spec: vm.spec.clone(),
            })
        });
        let applied_failover_services = attached
            .failover
            .iter()
            .filter_map(|fs_id| {
                let fs = snapshot.failover_services.find(fs_id).ok()?;
                Some(AppliedFailoverService {
                    reference: fs_id.clone(),
                    observed_generation: fs.generation(),
                    spec: fs.spec.clone(),
                })
            })
            .collect();
        mesh_statuses.push((
            id.clone(),
            MeshStatus {
                observed_generation: mesh.generation(),
                applied_virtual_mesh,
                applied_failover_services,
            },
        ));
    }

    for (id, status) in destination_statuses {
        if let Ok(destination) = snapshot.destinations.find_mut(&id) {
            destination.status = Some(status);
        }
    }
    for (id, status) in mesh_statuses {
        if let Ok(mesh) = snapshot.meshes.find_mut(&id) {
            mesh.status = Some(status);
        }
    }
}

// =============================================================================
// Dry-run verdicts
// =============================================================================

/// Approve or reject `policies` in order on one attachment point
///
/// Rejected policies take the current counter without advancing it.
fn rank(
    policies: &[ClusterObjectRef],
    errors_for: impl Fn(&ClusterObjectRef) -> Vec<String>,
    attachment_key: &str,
    approvals: &mut Approvals,
) -> Vec<ClusterObjectRef> {
    let mut counter = 0u32;
    let mut accepted = Vec::new();
    for policy in policies {
        let errors = errors_for(policy);
        let status = if errors.is_empty() {
            accepted.push(policy.clone());
            counter += 1;
            ApprovalStatus::accepted(counter - 1)
        } else {
            ApprovalStatus::invalid(counter, errors)
        };
        approvals
            .entry(policy.clone())
            .or_default()
            .insert(attachment_key.to_string(), status);
    }
    accepted
}

fn judge(candidates: &Plan, reporter: &CollectingReporter) -> Verdicts {
    let mut verdicts = Verdicts::default();

    for (id, attached) in &candidates.destinations {
        let key = id.key();
        let traffic = rank(
            &attached.traffic,
            |p| reporter.target_errors(id, &PolicyRef::traffic(p)).to_vec(),
            &key,
            &mut verdicts.traffic,
        );
        let access = rank(
            &attached.access,
            |p| reporter.target_errors(id, &PolicyRef::access(p)).to_vec(),
            &key,
            &mut verdicts.access,
        );
        if traffic.len() < attached.traffic.len() || access.len() < attached.access.len() {
            debug!(
                destination = %id,
                rejected = attached.traffic.len() + attached.access.len() - traffic.len() - access.len(),
                "policies rejected by dry run"
            );
        }
        verdicts
            .accepted
            .destinations
            .insert(id.clone(), DestinationPlan { traffic, access });
    }

    for fs_id in candidates.meshes.values().flat_map(|m| &m.failover) {
        let errors = reporter.failover_errors(fs_id);
        if !errors.is_empty() {
            verdicts
                .failover_validation
                .insert(fs_id.clone(), errors.to_vec());
        }
    }

    for (id, attached) in &candidates.meshes {
        let key = id.key();
        let virtual_mesh: Vec<ClusterObjectRef> = attached.virtual_mesh.iter().cloned().collect();
        let virtual_mesh = rank(
            &virtual_mesh,
            |vm| reporter.mesh_errors(id, &PolicyRef::virtual_mesh(vm)).to_vec(),
            &key,
            &mut verdicts.virtual_meshes,
        );
        let failover = rank(
            &attached.failover,
            |fs| match verdicts.failover_validation.get(fs) {
                Some(validation) => validation.clone(),
                None => reporter.mesh_errors(id, &PolicyRef::failover(fs)).to_vec(),
            },
            &key,
            &mut verdicts.failover,
        );
        verdicts.accepted.meshes.insert(
            id.clone(),
            MeshPlan {
                virtual_mesh: virtual_mesh.into_iter().next(),
                failover,
            },
        );
    }

    debug!(
        destinations = candidates.destinations.len(),
        meshes = candidates.meshes.len(),
        "dry run judged"
    );
    verdicts
}

// =============================================================================
// Status commit
// =============================================================================

fn commit_policies(
    snapshot: &mut InputSnapshot,
    verdicts: &Verdicts,
    claims: &MeshClaims,
    unresolved_virtual_meshes: &BTreeMap<ClusterObjectRef, Vec<String>>,
    unresolved_failover: &BTreeMap<ClusterObjectRef, Vec<String>>,
) -> ApplySummary {
    let mut summary = ApplySummary::default();
    summary.count(&verdicts.traffic);
    summary.count(&verdicts.access);

    let traffic_statuses: Vec<(ClusterObjectRef, TrafficPolicyStatus)> = snapshot
        .traffic_policies
        .iter()
        .map(|tp| {
            let id = tp.identity();
            let destinations = verdicts.traffic.get(&id).cloned().unwrap_or_default();
            let accepted_by = accepting_destinations(snapshot, &destinations);
            let status = TrafficPolicyStatus {
                observed_generation: tp.generation(),
                workloads: traffic_policy_workloads(snapshot, tp, &accepted_by),
                destinations,
            };
            (id, status)
        })
        .collect();
    let access_statuses: Vec<(ClusterObjectRef, AccessPolicyStatus)> = snapshot
        .access_policies
        .iter()
        .map(|ap| {
            let id = ap.identity();
            let destinations = verdicts.access.get(&id).cloned().unwrap_or_default();
            let accepted_by = accepting_destinations(snapshot, &destinations);
            let status = AccessPolicyStatus {
                observed_generation: ap.generation(),
                workloads: access_policy_workloads(snapshot, ap, &accepted_by),
                destinations,
            };
            (id, status)
        })
        .collect();

    let mut virtual_mesh_approvals = verdicts.virtual_meshes.clone();
    let virtual_mesh_statuses: Vec<(ClusterObjectRef, VirtualMeshStatus)> = snapshot
        .virtual_meshes
        .iter()
        .map(|vm| {
            let id = vm.identity();
            let errors = match (unresolved_virtual_meshes.get(&id), claims.rejection(&id)) {
                (Some(missing), _) => missing.clone(),
                (None, Some(conflicts)) => conflicts.to_vec(),
                (None, None) => Vec::new(),
            };
            let meshes = virtual_mesh_approvals.entry(id.clone()).or_default();
            if !errors.is_empty() {
                for mesh in vm.spec.meshes.iter().map(|m| m.within(&id)) {
                    if snapshot.meshes.contains(&mesh) {
                        meshes.insert(mesh.key(), ApprovalStatus::invalid(0, errors.clone()));
                    }
                }
            }
            let state = if errors.is_empty() {
                aggregate_state(meshes.values())
            } else {
                ApprovalState::Invalid
            };
            let status = VirtualMeshStatus {
                observed_generation: vm.generation(),
                state,
                meshes: meshes.clone(),
                errors,
            };
            (id, status)
        })
        .collect();
    summary.count(&virtual_mesh_approvals);

    let mut failover_approvals = verdicts.failover.clone();
    let failover_statuses: Vec<(ClusterObjectRef, FailoverServiceStatus)> = snapshot
        .failover_services
        .iter()
        .map(|fs| {
            let id = fs.identity();
            let errors = unresolved_failover.get(&id).cloned().unwrap_or_default();
            let meshes = failover_approvals.entry(id.clone()).or_default();
            if !errors.is_empty() {
                for mesh in fs.spec.meshes.iter().map(|m| m.within(&id)) {
                    if snapshot.meshes.contains(&mesh) {
                        meshes.insert(mesh.key(), ApprovalStatus::invalid(0, errors.clone()));
                    }
                }
            }
            let state = if errors.is_empty() {
                aggregate_state(meshes.values())
            } else {
                ApprovalState::Invalid
            };
            let status = FailoverServiceStatus {
                observed_generation: fs.generation(),
                state,
                meshes: meshes.clone(),
                validation_errors: verdicts
                    .failover_validation
                    .get(&id)
                    .cloned()
                    .unwrap_or_default(),
                errors,
            };
            (id, status)
        })
        .collect();
    summary.count(&failover_approvals);

    for (id, status) in traffic_statuses {
        match snapshot.traffic_policies.find_mut(&id) {
            Ok(tp) => tp.status = Some(status),
            Err(err) => error!(error = %err, "should never happen: record vanished during pass"),
        }
    }
    for (id, status) in access_statuses {
        match snapshot.access_policies.find_mut(&id) {
            Ok(ap) => ap.status = Some(status),
            Err(err) => error!(error = %err, "should never happen: record vanished during pass"),
        }
    }
    for (id, status) in virtual_mesh_statuses {
        match snapshot.virtual_meshes.find_mut(&id) {
            Ok(vm) => vm.status = Some(status),
            Err(err) => error!(error = %err, "should never happen: record vanished during pass"),
        }
    }
    for (id, status) in failover_statuses {
        match snapshot.failover_services.find_mut(&id) {
            Ok(fs) => fs.status = Some(status),
            Err(err) => error!(error = %err, "should never happen: record vanished during pass"),
        }
    }
    summary
}

/// Destinations whose approval of a policy is ACCEPTED
fn accepting_destinations<'s>(
    snapshot: &'s InputSnapshot,
    approvals: &BTreeMap<String, ApprovalStatus>,
) -> Vec<&'s Destination> {
    snapshot
        .destinations
        .list(|d| {
            approvals
                .get(&d.identity().key())
                .is_some_and(ApprovalStatus::is_accepted)
        })
}
