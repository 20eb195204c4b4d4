//! Mesh references and VirtualMesh exclusivity
//!
//! A Mesh belongs to at most one ACCEPTED VirtualMesh. VirtualMeshes that
//! were ACCEPTED last pass claim their meshes first, so a newly created
//! VirtualMesh cannot steal a mesh from an established one. Within each group
//! claims are made in identity order and are never released during a pass.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use trellis_common::crd::{ApprovalState, VirtualMesh};
use trellis_common::{ClusterObjectRef, Error, Identified, InputSnapshot, ObjectRef};

/// Errors for every mesh reference of `holder` that is not in the snapshot
pub fn missing_meshes(
    snapshot: &InputSnapshot,
    holder: &ClusterObjectRef,
    meshes: &[ObjectRef],
) -> Vec<String> {
    meshes
        .iter()
        .map(|m| m.within(holder))
        .filter(|id| !snapshot.meshes.contains(id))
        .map(|id| Error::not_found("Mesh", id.key()).to_string())
        .collect()
}

/// Outcome of the exclusivity pass
#[derive(Debug, Default)]
pub struct MeshClaims {
    owners: BTreeMap<ClusterObjectRef, ClusterObjectRef>,
    rejected: BTreeMap<ClusterObjectRef, Vec<String>>,
}

impl MeshClaims {
    /// The VirtualMesh that claimed a mesh
    pub fn owner_of(&self, mesh: &ClusterObjectRef) -> Option<&ClusterObjectRef> {
        self.owners.get(mesh)
    }

    /// Why a VirtualMesh lost, if it did
    pub fn rejection(&self, virtual_mesh: &ClusterObjectRef) -> Option<&[String]> {
        self.rejected.get(virtual_mesh).map(Vec::as_slice)
    }

    /// Meshes claimed by a VirtualMesh
    pub fn claimed_by<'a>(
        &'a self,
        virtual_mesh: &'a ClusterObjectRef,
    ) -> impl Iterator<Item = &'a ClusterObjectRef> + 'a {
        self.owners
            .iter()
            .filter(move |(_, owner)| *owner == virtual_mesh)
            .map(|(mesh, _)| mesh)
    }
}

/// Assign meshes to VirtualMeshes
///
/// `skip` holds VirtualMeshes already rejected for other reasons; they claim
/// nothing.
pub fn claim_meshes(
    snapshot: &InputSnapshot,
    skip: &BTreeSet<ClusterObjectRef>,
) -> MeshClaims {
    let (established, rest): (Vec<&VirtualMesh>, Vec<&VirtualMesh>) = snapshot
        .virtual_meshes
        .iter()
        .filter(|vm| !skip.contains(&vm.identity()))
        .partition(|vm| vm.previous_state() == ApprovalState::Accepted);

    let mut claims = MeshClaims::default();
    for vm in established.into_iter().chain(rest) {
        let id = vm.identity();
        let meshes: Vec<ClusterObjectRef> = vm.spec.meshes.iter().map(|m| m.within(&id)).collect();
        let conflicts: Vec<String> = meshes
            .iter()
            .filter_map(|mesh| {
                claims
                    .owners
                    .get(mesh)
                    .map(|owner| format!("mesh {mesh} is already claimed by VirtualMesh {owner}"))
            })
            .collect();
        if conflicts.is_empty() {
            for mesh in meshes {
                claims.owners.insert(mesh, id.clone());
            }
        } else {
            debug!(virtual_mesh = %id, conflicts = conflicts.len(), "virtual mesh lost its claim");
            claims.rejected.insert(id, conflicts);
        }
    }
    claims
}
