//! Policy application for Trellis
//!
//! Decides, for every destination and mesh in an [`InputSnapshot`], which
//! policy records apply and in what order, and rewrites every status to
//! match. Conflicts are settled up front:
//!
//! - a Mesh belongs to at most one VirtualMesh, established claims first
//! - TrafficPolicies are offered in a stable acceptance order
//! - anything the translator reports during a dry run is rejected
//!
//! [`engine::run_pass`] chains the applier with the real translation.
//!
//! [`InputSnapshot`]: trellis_common::InputSnapshot

pub mod applier;
pub mod engine;
pub mod ordering;
pub mod virtual_mesh;
pub mod workloads;

pub use applier::{ApplySummary, Applier};
pub use engine::{run_pass, PassOutcome};
