//! App Mesh route decorators

use trellis_common::crd::{AppliedTrafficPolicy, Workload};
use trellis_common::duration::parse_duration;
use trellis_common::Identified;

use super::BACKEND;
use crate::decorator::{DecoratorContext, TrafficPolicyDecorator};
use crate::error::TranslationError;
use crate::field_ownership::{FieldConflict, FieldRegistrar};
use crate::output::appmesh as out;
use crate::reporter::Reporter;

/// Per-retry timeout when a policy does not set one
pub const DEFAULT_PER_RETRY_TIMEOUT_MS: u64 = 15_000;

/// Event classes App Mesh retries on
pub const HTTP_RETRY_EVENTS: [&str; 2] = ["server-error", "gateway-error"];

fn millis(field: &str, value: &str) -> Result<u64, TranslationError> {
    parse_duration(value)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| TranslationError::invalid(field, e.to_string()))
}

/// Virtual nodes of the given workloads
pub(super) fn virtual_nodes(workloads: &[&Workload]) -> Vec<out::NodeRef> {
    workloads
        .iter()
        .filter_map(|w| {
            let node = w.spec.app_mesh.as_ref()?;
            Some(out::NodeRef {
                name: node.virtual_node_name.clone(),
                namespace: w.spec.kubernetes.controller.namespace.clone(),
            })
        })
        .collect()
}

/// Spread `weight` over `nodes`; the first nodes absorb the remainder
pub(super) fn weighted_targets(nodes: Vec<out::NodeRef>, weight: u32) -> Vec<out::WeightedTarget> {
    let n = nodes.len() as u32;
    if n == 0 {
        return Vec::new();
    }
    let (share, remainder) = (weight / n, weight % n);
    nodes
        .into_iter()
        .enumerate()
        .map(|(i, node)| out::WeightedTarget {
            virtual_node_ref: node,
            weight: share + u32::from((i as u32) < remainder),
        })
        .collect()
}

/// Weighted virtual node targets
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

        let mesh_id = ctx.mesh.identity();
        let mut targets = Vec::new();
        for weighted in &shift.destinations {
            let target = match ctx.resolve_service(&weighted.kube_service) {
                Ok(target) => target,
                Err(err) => {
                    ctx.report(reporter, &owner, err);
                    return Ok(());
                }
            };
            if ctx.snapshot.mesh_of(target).map(|m| m.identity()) != Some(mesh_id.clone()) {
                ctx.report(
                    reporter,
                    &owner,
                    TranslationError::unsupported("cross-mesh TrafficShift", BACKEND),
                );
                return Ok(());
            }
            let backing: Vec<&Workload> = ctx
                .snapshot
                .backing_workloads(target)
                .into_iter()
                .filter(|w| {
                    weighted
                        .subset
                        .iter()
                        .all(|(k, v)| w.spec.kubernetes.pod_labels.get(k) == Some(v))
                })
                .collect();
            let nodes = virtual_nodes(&backing);
            if nodes.is_empty() {
                ctx.report(
                    reporter,
                    &owner,
                    TranslationError::missing("VirtualNode", weighted.kube_service.key()),
                );
                return Ok(());
            }
            targets.extend(weighted_targets(nodes, weighted.weight));
        }
        registrar.set(
            "action",
            &mut route.action,
            out::RouteAction {
                weighted_targets: targets,
            },
        )
    }
}

/// Retry policy
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
        let per_retry = match retries.per_try_timeout.as_deref() {
            Some(value) => match millis("retries.perTryTimeout", value) {
                Ok(ms) => ms,
                Err(err) => {
                    ctx.report(reporter, registrar.owner(), err);
                    return Ok(());
                }
            },
            None => DEFAULT_PER_RETRY_TIMEOUT_MS,
        };
        let value = out::RetryPolicy {
            max_retries: retries.attempts,
            per_retry_timeout: out::AppMeshDuration::millis(per_retry),
            http_retry_events: HTTP_RETRY_EVENTS.iter().map(|e| e.to_string()).collect(),
        };
        registrar.set("retryPolicy", &mut route.retry_policy, Some(value))
    }
}

/// Whole-request timeout
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
        let ms = match millis("requestTimeout", timeout) {
            Ok(ms) => ms,
            Err(err) => {
                ctx.report(reporter, registrar.owner(), err);
                return Ok(());
            }
        };
        registrar.set(
            "timeout",
            &mut route.timeout,
            Some(out::RouteTimeout {
                per_request: out::AppMeshDuration::millis(ms),
            }),
        )
    }
}
