//! Backend dispatch
//!
//! Every Destination and every Mesh is handed to exactly one backend, picked
//! from the Mesh's technology by exhaustive match. The [`Translate`] trait is
//! the seam the applier uses for its dry run and for the real pass.

use std::collections::BTreeSet;

use tracing::{debug, error, info, instrument};

use trellis_common::crd::{Destination, Mesh, MeshType};
use trellis_common::{ClusterObjectRef, Identified, InputSnapshot};

use crate::appmesh::AppMeshTranslator;
use crate::failover::validate_failover_services;
use crate::istio::IstioTranslator;
use crate::output::OutputSnapshot;
use crate::reporter::Reporter;
use crate::smi::SmiTranslator;

/// Mesh technology families with a translator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Istio
    Istio,
    /// Service Mesh Interface (Open Service Mesh)
    Smi,
    /// AWS App Mesh
    AppMesh,
}

impl Backend {
    /// Backend responsible for a mesh
    pub fn for_mesh(mesh: &Mesh) -> Self {
        match &mesh.spec.mesh_type {
            MeshType::Istio(_) => Self::Istio,
            MeshType::Osm(_) => Self::Smi,
            MeshType::AwsAppMesh(_) => Self::AppMesh,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Istio => write!(f, "istio"),
            Self::Smi => write!(f, "smi"),
            Self::AppMesh => write!(f, "appmesh"),
        }
    }
}

/// Read-only state shared by every backend during one pass
pub struct TranslationContext<'a> {
    /// The frozen input
    pub snapshot: &'a InputSnapshot,
    /// Owner label value for outputs
    pub instance_id: &'a str,
    /// FailoverServices that failed validation this pass
    pub invalid_failover_services: &'a BTreeSet<ClusterObjectRef>,
}

/// One backend translator
pub trait MeshTranslator: Send + Sync {
    /// Backend implemented
    fn backend(&self) -> Backend;

    /// Whether this translator handles the mesh
    fn is_applicable(&self, mesh: &Mesh) -> bool {
        Backend::for_mesh(mesh) == self.backend()
    }

    /// Outputs for one destination and the policies applied to it
    fn translate_destination(
        &self,
        ctx: &TranslationContext<'_>,
        destination: &Destination,
        mesh: &Mesh,
        out: &mut OutputSnapshot,
        reporter: &mut dyn Reporter,
    );

    /// Outputs for one mesh and the VirtualMesh/FailoverServices applied to it
    fn translate_mesh(
        &self,
        ctx: &TranslationContext<'_>,
        mesh: &Mesh,
        out: &mut OutputSnapshot,
        reporter: &mut dyn Reporter,
    );
}

/// Turns a stamped snapshot into backend outputs
pub trait Translate {
    /// Translate every destination and mesh in the snapshot
    fn translate(&self, snapshot: &InputSnapshot, reporter: &mut dyn Reporter) -> OutputSnapshot;
}

/// The production translator: one instance of each backend
pub struct Translator {
    instance_id: String,
    istio: IstioTranslator,
    smi: SmiTranslator,
    appmesh: AppMeshTranslator,
}

impl Translator {
    /// Translator with explicitly constructed backends
    pub fn new(
        instance_id: impl Into<String>,
        istio: IstioTranslator,
        smi: SmiTranslator,
        appmesh: AppMeshTranslator,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            istio,
            smi,
            appmesh,
        }
    }

    /// Translator whose backends carry their standard decorator lists
    pub fn with_default_decorators(instance_id: impl Into<String>) -> Self {
        Self::new(
            instance_id,
            IstioTranslator::with_default_decorators(),
            SmiTranslator::with_default_decorators(),
            AppMeshTranslator::with_default_decorators(),
        )
    }

    /// Instance id stamped on outputs
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend_for(&self, mesh: &Mesh) -> &dyn MeshTranslator {
        match Backend::for_mesh(mesh) {
            Backend::Istio => &self.istio,
            Backend::Smi => &self.smi,
            Backend::AppMesh => &self.appmesh,
        }
    }
}

impl Translate for Translator {
    #[instrument(skip_all, fields(instance = %self.instance_id))]
    fn translate(&self, snapshot: &InputSnapshot, reporter: &mut dyn Reporter) -> OutputSnapshot {
        let invalid_failover_services = validate_failover_services(snapshot, reporter);
        let ctx = TranslationContext {
            snapshot,
            instance_id: &self.instance_id,
            invalid_failover_services: &invalid_failover_services,
        };
        let mut out = OutputSnapshot::new(&self.instance_id);

        for destination in snapshot.destinations.iter() {
            if destination.spec.mesh.is_none() {
                debug!(destination = %destination.identity(), "destination not managed by a mesh");
                continue;
            }
            let Some(mesh) = snapshot.mesh_of(destination) else {
                error!(
                    destination = %destination.identity(),
                    "should never happen: destination references a mesh missing from the snapshot"
                );
                continue;
            };
            let backend = self.backend_for(mesh);
            debug_assert!(backend.is_applicable(mesh));
            backend.translate_destination(&ctx, destination, mesh, &mut out, reporter);
        }

        for mesh in snapshot.meshes.iter() {
            self.backend_for(mesh)
                .translate_mesh(&ctx, mesh, &mut out, reporter);
        }

        info!(
            destinations = snapshot.destinations.len(),
            meshes = snapshot.meshes.len(),
            outputs = out.total_count(),
            "translation complete"
        );
        out
    }
}
