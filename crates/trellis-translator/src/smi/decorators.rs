//! SMI decorators

use trellis_common::crd::{AppliedAccessPolicy, AppliedTrafficPolicy, WeightedDestination};

use super::BACKEND;
use crate::decorator::{AccessPolicyDecorator, DecoratorContext, TrafficPolicyDecorator};
use crate::error::TranslationError;
use crate::field_ownership::{FieldConflict, FieldRegistrar};
use crate::output::smi as out;
use crate::reporter::Reporter;

/// Why a weighted backend cannot be a TrafficSplit backend, if it cannot
fn unsupported_backend(ctx: &DecoratorContext<'_>, weighted: &WeightedDestination) -> Option<&'static str> {
    let local = ctx.destination.service_ref();
    if !weighted.subset.is_empty() {
        Some("TrafficShift.subset")
    } else if weighted.kube_service.cluster_name != local.cluster_name {
        Some("cross-cluster TrafficShift")
    } else if weighted.kube_service.namespace != local.namespace {
        Some("cross-namespace TrafficShift")
    } else {
        None
    }
}

/// Weighted TrafficSplit backends
pub struct TrafficSplitDecorator;

impl TrafficPolicyDecorator<out::TrafficSplitSpec> for TrafficSplitDecorator {
    fn feature(&self) -> &'static str {
        "TrafficShift"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        split: &mut out::TrafficSplitSpec,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(shift) = policy.spec.policy.traffic_shift() else {
            return Ok(());
        };
        let owner = registrar.owner().clone();
        if shift.destinations.is_empty() {
            ctx.report(
                reporter,
                &owner,
                TranslationError::invalid("trafficShift.destinations", "must not be empty"),
            );
            return Ok(());
        }

        let mut backends = Vec::with_capacity(shift.destinations.len());
        for weighted in &shift.destinations {
            if let Some(feature) = unsupported_backend(ctx, weighted) {
                ctx.report(reporter, &owner, TranslationError::unsupported(feature, BACKEND));
                return Ok(());
            }
            if let Err(err) = ctx.resolve_service(&weighted.kube_service) {
                ctx.report(reporter, &owner, err);
                return Ok(());
            }
            backends.push(out::TrafficSplitBackend {
                service: weighted.kube_service.name.clone(),
                weight: weighted.weight,
            });
        }
        registrar.set("backends", &mut split.backends, backends)
    }
}

/// SMI matches paths by regex; a trailing `*` in a policy path is a prefix
fn path_regex(path: &str) -> String {
    match path.strip_suffix('*') {
        Some(prefix) => format!("{prefix}.*"),
        None => path.to_string(),
    }
}

/// HTTPRouteGroup matches for an AccessPolicy's paths and methods
pub struct RouteGroupDecorator;

impl AccessPolicyDecorator<out::HttpRouteGroupSpec> for RouteGroupDecorator {
    fn feature(&self) -> &'static str {
        "AllowedRequests"
    }

    fn apply(
        &self,
        _ctx: &DecoratorContext<'_>,
        policy: &AppliedAccessPolicy,
        group: &mut out::HttpRouteGroupSpec,
        _reporter: &mut dyn Reporter,
    ) {
        let spec = &policy.spec;
        let methods = if spec.allowed_methods.is_empty() {
            vec!["*".to_string()]
        } else {
            spec.allowed_methods.clone()
        };

        if spec.allowed_paths.is_empty() {
            group.matches.push(out::HttpRouteMatch {
                name: "all".to_string(),
                path_regex: Some(".*".to_string()),
                methods,
                ..Default::default()
            });
            return;
        }
        for (i, path) in spec.allowed_paths.iter().enumerate() {
            group.matches.push(out::HttpRouteMatch {
                name: format!("path-{i}"),
                path_regex: Some(path_regex(path)),
                methods: methods.clone(),
                ..Default::default()
            });
        }
    }
}
