//! Policy translation for Trellis
//!
//! Compiles the policies the applier has attached to Destinations and Meshes
//! into the native resources of each mesh technology:
//!
//! - **Istio**: DestinationRule, VirtualService, AuthorizationPolicy,
//!   PeerAuthentication, ServiceEntry
//! - **SMI** (Open Service Mesh): TrafficSplit, TrafficTarget, HTTPRouteGroup
//! - **App Mesh**: VirtualRouter, VirtualService
//!
//! The [`Translator`] picks one backend per Mesh. Backends hand each policy
//! feature to a decorator, and decorators write through a field ownership
//! registry so that two policies can never silently overwrite each other.
//! Anything a backend cannot honor goes to a [`Reporter`] instead of
//! failing the pass.

pub mod appmesh;
pub mod decorator;
pub mod error;
pub mod failover;
pub mod field_ownership;
pub mod istio;
pub mod output;
pub mod reporter;
pub mod smi;
pub mod translator;

#[cfg(test)]
mod testing;

pub use decorator::{AccessPolicyDecorator, DecoratorContext, TrafficPolicyDecorator};
pub use error::TranslationError;
pub use failover::validate_failover_services;
pub use field_ownership::{FieldConflict, FieldOwnershipRegistry, FieldPath, FieldRegistrar};
pub use output::{Output, OutputSnapshot, Parents, RenderedObject};
pub use reporter::{CollectingReporter, LoggingReporter, PolicyKind, PolicyRef, Reporter};
pub use translator::{Backend, MeshTranslator, Translate, TranslationContext, Translator};
