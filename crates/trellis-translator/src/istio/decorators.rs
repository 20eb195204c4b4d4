//! Istio feature decorators
//!
//! Route decorators write one `spec.http[i]` entry of a VirtualService,
//! destination decorators write the DestinationRule, access decorators fill
//! one AuthorizationPolicy rule.

use trellis_common::crd::{
    AppliedAccessPolicy, AppliedTrafficPolicy, Destination, OutlierDetection, TlsMode,
};
use trellis_common::duration::parse_duration;
use trellis_common::selector::IdentitySelector;
use trellis_common::ClusterObjectRef;

use super::{subset_name, trust_domain_for_cluster, BACKEND};
use crate::decorator::{AccessPolicyDecorator, DecoratorContext, TrafficPolicyDecorator};
use crate::error::TranslationError;
use crate::field_ownership::{FieldConflict, FieldRegistrar};
use crate::output::istio as out;
use crate::reporter::Reporter;

fn check_duration(field: &str, value: &str) -> Result<(), TranslationError> {
    parse_duration(value)
        .map(|_| ())
        .map_err(|e| TranslationError::invalid(field, e.to_string()))
}

fn check_percentage(field: &str, value: f64) -> Result<(), TranslationError> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(TranslationError::invalid(
            field,
            format!("{value} is not between 0 and 100"),
        ))
    }
}

/// Resolve a service a route sends traffic to; it must live in the
/// destination's cluster
fn resolve_route_target<'a>(
    ctx: &DecoratorContext<'a>,
    service: &ClusterObjectRef,
    feature: &str,
) -> Result<&'a Destination, TranslationError> {
    let target = ctx.resolve_service(service)?;
    if target.service_ref().cluster_name != ctx.cluster() {
        return Err(TranslationError::unsupported(
            format!("cross-cluster {feature}"),
            BACKEND,
        ));
    }
    Ok(target)
}

fn route_destination(
    ctx: &DecoratorContext<'_>,
    target: &Destination,
    subset: Option<String>,
    port: Option<u32>,
) -> out::RouteDestination {
    out::RouteDestination {
        host: ctx.fqdn_of(target),
        subset,
        port: port.map(|number| out::PortSelector { number }),
    }
}

/// Destination-wide features cannot be narrowed to some requests or callers
fn is_destination_wide(policy: &AppliedTrafficPolicy) -> bool {
    policy.spec.http_request_matchers.is_empty() && policy.spec.source_selector.is_empty()
}

pub(crate) fn outlier_detection(od: &OutlierDetection) -> out::OutlierDetection {
    out::OutlierDetection {
        consecutive_5xx_errors: od.consecutive_errors,
        interval: od.interval.clone(),
        base_ejection_time: od.base_ejection_time.clone(),
        max_ejection_percent: od.max_ejection_percent,
    }
}

pub(crate) fn tls_mode(mode: TlsMode) -> &'static str {
    match mode {
        TlsMode::Disable => "DISABLE",
        TlsMode::Simple => "SIMPLE",
        TlsMode::IstioMutual => "ISTIO_MUTUAL",
    }
}

// =============================================================================
// VirtualService route decorators
// =============================================================================

/// Weighted route destinations
pub struct TrafficShiftDecorator;

impl TrafficPolicyDecorator<out::HttpRoute> for TrafficShiftDecorator {
    fn feature(&self) -> &'static str {
        "TrafficShift"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        route: &mut out::HttpRoute,
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

        let mut destinations = Vec::with_capacity(shift.destinations.len());
        for weighted in &shift.destinations {
            let target = match resolve_route_target(ctx, &weighted.kube_service, self.feature()) {
                Ok(target) => target,
                Err(err) => {
                    ctx.report(reporter, &owner, err);
                    return Ok(());
                }
            };
            let subset = (!weighted.subset.is_empty()).then(|| subset_name(&weighted.subset));
            destinations.push(out::HttpRouteDestination {
                destination: route_destination(ctx, target, subset, weighted.port),
                weight: Some(weighted.weight),
            });
        }
        registrar.set("route", &mut route.route, destinations)
    }
}

/// Overall request timeout
pub struct RequestTimeoutDecorator;

impl TrafficPolicyDecorator<out::HttpRoute> for RequestTimeoutDecorator {
    fn feature(&self) -> &'static str {
        "RequestTimeout"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        route: &mut out::HttpRoute,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(timeout) = policy.spec.policy.request_timeout() else {
            return Ok(());
        };
        if let Err(err) = check_duration("requestTimeout", timeout) {
            ctx.report(reporter, registrar.owner(), err);
            return Ok(());
        }
        registrar.set("timeout", &mut route.timeout, Some(timeout.to_string()))
    }
}

/// Retry attempts and per-try timeout
pub struct RetriesDecorator;

impl TrafficPolicyDecorator<out::HttpRoute> for RetriesDecorator {
    fn feature(&self) -> &'static str {
        "Retries"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        route: &mut out::HttpRoute,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(retries) = policy.spec.policy.retries() else {
            return Ok(());
        };
        if let Some(per_try) = &retries.per_try_timeout {
            if let Err(err) = check_duration("retries.perTryTimeout", per_try) {
                ctx.report(reporter, registrar.owner(), err);
                return Ok(());
            }
        }
        let value = out::HttpRetry {
            attempts: retries.attempts,
            per_try_timeout: retries.per_try_timeout.clone(),
        };
        registrar.set("retries", &mut route.retries, Some(value))
    }
}

/// Delay or abort injection
pub struct FaultInjectionDecorator;

impl TrafficPolicyDecorator<out::HttpRoute> for FaultInjectionDecorator {
    fn feature(&self) -> &'static str {
        "FaultInjection"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        route: &mut out::HttpRoute,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(fault) = policy.spec.policy.fault_injection() else {
            return Ok(());
        };
        let percentage = out::Percent {
            value: fault.percentage,
        };
        let value = match (&fault.fixed_delay, fault.abort_http_status) {
            (Some(delay), None) => check_duration("faultInjection.fixedDelay", delay).map(|_| {
                out::HttpFault {
                    delay: Some(out::FaultDelay {
                        fixed_delay: delay.clone(),
                        percentage,
                    }),
                    abort: None,
                }
            }),
            (None, Some(status)) => Ok(out::HttpFault {
                delay: None,
                abort: Some(out::FaultAbort {
                    http_status: status,
                    percentage,
                }),
            }),
            _ => Err(TranslationError::invalid(
                "faultInjection",
                "exactly one of fixedDelay or abortHttpStatus must be set",
            )),
        }
        .and_then(|v| check_percentage("faultInjection.percentage", fault.percentage).map(|_| v));

        match value {
            Ok(value) => registrar.set("fault", &mut route.fault, Some(value)),
            Err(err) => {
                ctx.report(reporter, registrar.owner(), err);
                Ok(())
            }
        }
    }
}

/// Shadow traffic to another service
pub struct MirrorDecorator;

impl TrafficPolicyDecorator<out::HttpRoute> for MirrorDecorator {
    fn feature(&self) -> &'static str {
        "Mirror"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        route: &mut out::HttpRoute,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(mirror) = policy.spec.policy.mirror() else {
            return Ok(());
        };
        let target = resolve_route_target(ctx, &mirror.kube_service, self.feature())
            .and_then(|t| check_percentage("mirror.percentage", mirror.percentage).map(|_| t));
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                ctx.report(reporter, registrar.owner(), err);
                return Ok(());
            }
        };
        registrar.set(
            "mirror",
            &mut route.mirror,
            Some(route_destination(ctx, target, None, mirror.port)),
        )?;
        registrar.set(
            "mirrorPercentage",
            &mut route.mirror_percentage,
            Some(out::Percent {
                value: mirror.percentage,
            }),
        )
    }
}

/// Request and response header edits
pub struct HeaderManipulationDecorator;

impl TrafficPolicyDecorator<out::HttpRoute> for HeaderManipulationDecorator {
    fn feature(&self) -> &'static str {
        "HeaderManipulation"
    }

    fn apply(
        &self,
        _ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        route: &mut out::HttpRoute,
        registrar: &mut FieldRegistrar<'_>,
        _reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(h) = policy.spec.policy.header_manipulation() else {
            return Ok(());
        };
        let ops = |add: &std::collections::BTreeMap<String, String>, remove: &[String]| {
            (!add.is_empty() || !remove.is_empty()).then(|| out::HeaderOperations {
                add: add.clone(),
                remove: remove.to_vec(),
            })
        };
        let value = out::Headers {
            request: ops(&h.append_request_headers, &h.remove_request_headers),
            response: ops(&h.append_response_headers, &h.remove_response_headers),
        };
        registrar.set("headers", &mut route.headers, Some(value))
    }
}

/// Cross-origin resource sharing
pub struct CorsDecorator;

impl TrafficPolicyDecorator<out::HttpRoute> for CorsDecorator {
    fn feature(&self) -> &'static str {
        "CorsPolicy"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        route: &mut out::HttpRoute,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(cors) = policy.spec.policy.cors_policy() else {
            return Ok(());
        };
        if let Some(max_age) = &cors.max_age {
            if let Err(err) = check_duration("corsPolicy.maxAge", max_age) {
                ctx.report(reporter, registrar.owner(), err);
                return Ok(());
            }
        }
        let value = out::CorsPolicy {
            allow_origins: cors.allow_origins.iter().map(Into::into).collect(),
            allow_methods: cors.allow_methods.clone(),
            allow_headers: cors.allow_headers.clone(),
            expose_headers: cors.expose_headers.clone(),
            max_age: cors.max_age.clone(),
            allow_credentials: cors.allow_credentials,
        };
        registrar.set("corsPolicy", &mut route.cors_policy, Some(value))
    }
}

// =============================================================================
// DestinationRule decorators
// =============================================================================

/// Endpoint ejection
pub struct OutlierDetectionDecorator;

impl TrafficPolicyDecorator<out::DestinationRuleSpec> for OutlierDetectionDecorator {
    fn feature(&self) -> &'static str {
        "OutlierDetection"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        rule: &mut out::DestinationRuleSpec,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(od) = policy.spec.policy.outlier_detection() else {
            return Ok(());
        };
        let checked = if is_destination_wide(policy) {
            check_duration("outlierDetection.interval", &od.interval).and_then(|_| {
                check_duration("outlierDetection.baseEjectionTime", &od.base_ejection_time)
            })
        } else {
            Err(TranslationError::unsupported(
                "OutlierDetection with request matchers or source selector",
                BACKEND,
            ))
        };
        if let Err(err) = checked {
            ctx.report(reporter, registrar.owner(), err);
            return Ok(());
        }
        let connection = rule.traffic_policy.get_or_insert_with(Default::default);
        registrar.set(
            "trafficPolicy.outlierDetection",
            &mut connection.outlier_detection,
            Some(outlier_detection(od)),
        )
    }
}

/// Client TLS mode override
pub struct MtlsDecorator;

impl TrafficPolicyDecorator<out::DestinationRuleSpec> for MtlsDecorator {
    fn feature(&self) -> &'static str {
        "Mtls"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedTrafficPolicy,
        rule: &mut out::DestinationRuleSpec,
        registrar: &mut FieldRegistrar<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), FieldConflict> {
        let Some(mtls) = policy.spec.policy.mtls() else {
            return Ok(());
        };
        if !is_destination_wide(policy) {
            ctx.report(
                reporter,
                registrar.owner(),
                TranslationError::unsupported(
                    "Mtls with request matchers or source selector",
                    BACKEND,
                ),
            );
            return Ok(());
        }
        let connection = rule.traffic_policy.get_or_insert_with(Default::default);
        registrar.set(
            "trafficPolicy.tls",
            &mut connection.tls,
            Some(out::ClientTls {
                mode: tls_mode(mtls.mode).to_string(),
            }),
        )
    }
}

// =============================================================================
// AuthorizationPolicy decorators
// =============================================================================

/// Calling identities as principals or namespaces
pub struct SourceIdentityDecorator;

impl SourceIdentityDecorator {
    fn source(ctx: &DecoratorContext<'_>, selector: &IdentitySelector) -> Option<out::Source> {
        let td = |cluster: &str| trust_domain_for_cluster(ctx.snapshot, cluster, ctx.mesh);
        if !selector.service_accounts.is_empty() {
            let principals = selector
                .service_accounts
                .iter()
                .map(|sa| {
                    format!(
                        "{}/ns/{}/sa/{}",
                        td(&sa.cluster_name),
                        sa.namespace,
                        sa.name
                    )
                })
                .collect();
            return Some(out::Source {
                principals,
                namespaces: vec![],
            });
        }
        match (selector.namespaces.is_empty(), selector.clusters.is_empty()) {
            // Matches every caller
            (true, true) => None,
            (false, true) => Some(out::Source {
                principals: vec![],
                namespaces: selector.namespaces.clone(),
            }),
            (true, false) => Some(out::Source {
                principals: selector
                    .clusters
                    .iter()
                    .map(|c| format!("{}/*", td(c)))
                    .collect(),
                namespaces: vec![],
            }),
            (false, false) => Some(out::Source {
                principals: selector
                    .clusters
                    .iter()
                    .flat_map(|c| {
                        let domain = td(c);
                        selector
                            .namespaces
                            .iter()
                            .map(move |ns| format!("{domain}/ns/{ns}/sa/*"))
                    })
                    .collect(),
                namespaces: vec![],
            }),
        }
    }
}

impl AccessPolicyDecorator<out::AuthorizationRule> for SourceIdentityDecorator {
    fn feature(&self) -> &'static str {
        "SourceSelector"
    }

    fn apply(
        &self,
        ctx: &DecoratorContext<'_>,
        policy: &AppliedAccessPolicy,
        rule: &mut out::AuthorizationRule,
        _reporter: &mut dyn Reporter,
    ) {
        let mut from = Vec::with_capacity(policy.spec.source_selector.len());
        for selector in &policy.spec.source_selector {
            match Self::source(ctx, selector) {
                Some(source) => from.push(out::RuleFrom { source }),
                None => return,
            }
        }
        rule.from = from;
    }
}

/// Allowed ports, methods and paths
pub struct OperationDecorator;

impl AccessPolicyDecorator<out::AuthorizationRule> for OperationDecorator {
    fn feature(&self) -> &'static str {
        "AllowedOperations"
    }

    fn apply(
        &self,
        _ctx: &DecoratorContext<'_>,
        policy: &AppliedAccessPolicy,
        rule: &mut out::AuthorizationRule,
        _reporter: &mut dyn Reporter,
    ) {
        let operation = out::Operation {
            ports: policy
                .spec
                .allowed_ports
                .iter()
                .map(ToString::to_string)
                .collect(),
            methods: policy.spec.allowed_methods.clone(),
            paths: policy.spec.allowed_paths.clone(),
        };
        if !operation.is_empty() {
            rule.to = vec![out::RuleTo { operation }];
        }
    }
}
