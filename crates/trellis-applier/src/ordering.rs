//! Acceptance ordering of TrafficPolicies on one destination
//!
//! Policies that were accepted for the destination last pass keep their rank
//! so that a new policy can never displace an established one. Stale
//! acceptances (the spec changed since) come next, then everything else.

use trellis_common::crd::TrafficPolicy;
use trellis_common::Identified;

/// Rank class of a policy relative to one destination
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcceptanceClass {
    /// Accepted last pass at the current generation
    Current,
    /// Accepted last pass, spec changed since
    Stale,
    /// Not accepted last pass
    New,
}

/// Classify a policy for a destination from its previous status
pub fn acceptance_class(policy: &TrafficPolicy, destination_key: &str) -> AcceptanceClass {
    match policy.approval_for(destination_key) {
        Some(approval) if approval.is_accepted() => {
            let observed = policy.status.as_ref().map(|s| s.observed_generation);
            if observed == Some(policy.generation()) {
                AcceptanceClass::Current
            } else {
                AcceptanceClass::Stale
            }
        }
        _ => AcceptanceClass::New,
    }
}

/// Sort policies into the order they are offered for acceptance
///
/// Accepted policies keep their previous relative order; ties and new
/// policies fall back to identity order.
pub fn sort_for_acceptance(destination_key: &str, policies: &mut [&TrafficPolicy]) {
    policies.sort_by_cached_key(|policy| {
        let class = acceptance_class(policy, destination_key);
        let previous_order = match class {
            AcceptanceClass::New => 0,
            _ => policy
                .approval_for(destination_key)
                .map(|a| a.acceptance_order)
                .unwrap_or_default(),
        };
        (class, previous_order, policy.identity())
    });
}
