//! FailoverService validation
//!
//! Runs once per pass, before any backend sees a FailoverService. Invalid
//! ones are reported through
//! [`Reporter::report_failover_service`](crate::Reporter::report_failover_service)
//! and skipped by every backend.

use std::collections::BTreeSet;

use tracing::debug;

use trellis_common::crd::{AppliedFailoverService, FailoverServiceSpec};
use trellis_common::{ClusterObjectRef, Identified, InputSnapshot};

use crate::error::TranslationError;
use crate::reporter::Reporter;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// DNS-1123 subdomain check
fn validate_hostname(hostname: &str) -> Option<TranslationError> {
    let invalid = |message: String| Some(TranslationError::invalid("hostname", message));
    if hostname.is_empty() {
        return invalid("must not be empty".to_string());
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return invalid(format!("must be at most {MAX_HOSTNAME_LEN} characters"));
    }
    for label in hostname.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return invalid(format!("{hostname:?} is not a valid DNS name"));
        }
    }
    None
}

/// Every problem with one FailoverService
fn validate(
    snapshot: &InputSnapshot,
    reference: &ClusterObjectRef,
    spec: &FailoverServiceSpec,
) -> Vec<TranslationError> {
    let mut errors: Vec<TranslationError> = validate_hostname(&spec.hostname).into_iter().collect();
    if spec.port.number == 0 {
        errors.push(TranslationError::invalid("port", "must be non-zero"));
    }

    let mut selected = BTreeSet::new();
    let mut virtual_meshes = BTreeSet::new();
    for mesh_ref in &spec.meshes {
        let id = mesh_ref.within(reference);
        match snapshot.meshes.find(&id) {
            Ok(mesh) => {
                virtual_meshes.insert(mesh.applied_virtual_mesh().map(|vm| vm.reference.clone()));
                selected.insert(id);
            }
            Err(_) => errors.push(TranslationError::missing("Mesh", id.key())),
        }
    }
    if selected.len() > 1 && (virtual_meshes.len() > 1 || virtual_meshes.contains(&None)) {
        errors.push(TranslationError::invalid(
            "meshes",
            "meshes must be grouped in one VirtualMesh",
        ));
    }

    if spec.backing_services.is_empty() {
        errors.push(TranslationError::invalid(
            "backingServices",
            "at least one backing service is required",
        ));
    }
    for service in &spec.backing_services {
        let Some(destination) = snapshot.destination_for_service(service) else {
            errors.push(TranslationError::missing("Service", service.key()));
            continue;
        };
        let in_selected_mesh = destination
            .spec
            .mesh
            .as_ref()
            .is_some_and(|m| selected.contains(&m.within(&destination.identity())));
        if !in_selected_mesh {
            errors.push(TranslationError::invalid(
                "backingServices",
                format!("{service} is not in a selected mesh"),
            ));
        }
    }
    errors
}

/// Validate every FailoverService applied to some mesh
///
/// Returns the identities of those that failed.
pub fn validate_failover_services(
    snapshot: &InputSnapshot,
    reporter: &mut dyn Reporter,
) -> BTreeSet<ClusterObjectRef> {
    let mut seen = BTreeSet::new();
    let mut invalid = BTreeSet::new();
    let applied = snapshot
        .meshes
        .iter()
        .flat_map(|m| m.applied_failover_services());
    for AppliedFailoverService { reference, spec, .. } in applied {
        if !seen.insert(reference.clone()) {
            continue;
        }
        let errors = validate(snapshot, reference, spec);
        if errors.is_empty() {
            continue;
        }
        debug!(failover_service = %reference, errors = errors.len(), "failover service invalid");
        reporter.report_failover_service(reference, errors);
        invalid.insert(reference.clone());
    }
    invalid
}
