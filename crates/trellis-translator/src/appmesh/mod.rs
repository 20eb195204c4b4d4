//! AWS App Mesh backend
//!
//! One VirtualRouter and one VirtualService per destination backed by at
//! least one virtual node. Routes follow the same narrowing rules as the
//! Istio backend, but App Mesh only matches on path prefix, method and
//! headers, and a route carries a single match.

mod decorators;

use tracing::debug;

use trellis_common::crd::{
    AppliedTrafficPolicy, Destination, HttpMatcher, Mesh, StringMatch, TrafficPolicy,
    TrafficPolicyAction,
};
use trellis_common::kube_utils::{HasApiResource, ObjectMeta};
use trellis_common::Identified;

pub use decorators::{
    RequestTimeoutDecorator, RetriesDecorator, TrafficShiftDecorator,
    DEFAULT_PER_RETRY_TIMEOUT_MS, HTTP_RETRY_EVENTS,
};

use crate::decorator::{DecoratorContext, TrafficPolicyDecorator};
use crate::error::TranslationError;
use crate::field_ownership::{FieldOwnershipRegistry, FieldPath, FieldRegistrar, OutputObjectId};
use crate::output::appmesh as out;
use crate::output::{Output, OutputSnapshot, Parents};
use crate::reporter::{PolicyRef, Reporter};
use crate::translator::{Backend, MeshTranslator, TranslationContext};

pub(crate) const BACKEND: &str = "appmesh";

/// Features App Mesh cannot express for this policy
fn unsupported_traffic_features(policy: &AppliedTrafficPolicy) -> Vec<TranslationError> {
    let spec = &policy.spec;
    let mut errors = Vec::new();
    if !spec.source_selector.is_empty() {
        errors.push(TranslationError::unsupported("SourceSelector", BACKEND));
    }
    if spec
        .http_request_matchers
        .iter()
        .any(|m| !m.query_parameters.is_empty())
    {
        errors.push(TranslationError::unsupported(
            "HttpRequestMatchers.queryParameters",
            BACKEND,
        ));
    }
    if spec
        .http_request_matchers
        .iter()
        .any(|m| matches!(m.uri, Some(StringMatch::Exact(_) | StringMatch::Regex(_))))
    {
        errors.push(TranslationError::unsupported(
            "HttpRequestMatchers.uri other than prefix",
            BACKEND,
        ));
    }
    if !matches!(
        spec.policy,
        TrafficPolicyAction::TrafficShift(_)
            | TrafficPolicyAction::Retries(_)
            | TrafficPolicyAction::RequestTimeout(_)
    ) {
        errors.push(TranslationError::unsupported(spec.policy.feature_name(), BACKEND));
    }
    errors
}

fn route_match(matcher: &HttpMatcher) -> out::RouteMatch {
    let prefix = match &matcher.uri {
        Some(StringMatch::Prefix(p)) => p.clone(),
        _ => "/".to_string(),
    };
    out::RouteMatch {
        prefix,
        method: matcher.method.clone(),
        headers: matcher
            .headers
            .iter()
            .map(|h| out::HeaderMatch {
                name: h.name.clone(),
                header_match: if h.regex {
                    out::HeaderMatchMethod {
                        regex: Some(h.value.clone()),
                        ..Default::default()
                    }
                } else {
                    out::HeaderMatchMethod {
                        exact: Some(h.value.clone()),
                        ..Default::default()
                    }
                },
                invert: h.invert_match,
            })
            .collect(),
    }
}

/// Route-all match
fn catch_all() -> out::RouteMatch {
    out::RouteMatch {
        prefix: "/".to_string(),
        ..Default::default()
    }
}

/// The App Mesh translator and its route decorators
pub struct AppMeshTranslator {
    route_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::HttpRoute>>>,
}

impl AppMeshTranslator {
    /// Translator with an explicit decorator list, applied in the given order
    pub fn new(route_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::HttpRoute>>>) -> Self {
        Self { route_decorators }
    }

    /// Translator covering every App Mesh feature
    pub fn with_default_decorators() -> Self {
        Self::new(vec![
            Box::new(TrafficShiftDecorator),
            Box::new(RetriesDecorator),
            Box::new(RequestTimeoutDecorator),
        ])
    }
}

impl MeshTranslator for AppMeshTranslator {
    fn backend(&self) -> Backend {
        Backend::AppMesh
    }

    fn translate_destination(
        &self,
        ctx: &TranslationContext<'_>,
        destination: &Destination,
        mesh: &Mesh,
        out: &mut OutputSnapshot,
        reporter: &mut dyn Reporter,
    ) {
        let dctx = DecoratorContext::new(ctx.snapshot, destination, mesh);
        for policy in destination.applied_access_policies() {
            dctx.report(
                reporter,
                &PolicyRef::access(&policy.reference),
                TranslationError::unsupported("AccessPolicy", BACKEND),
            );
        }

        let policies = destination.applied_traffic_policies();
        let usable: Vec<usize> = policies
            .iter()
            .enumerate()
            .filter_map(|(i, policy)| {
                let errors = unsupported_traffic_features(policy);
                let owner = PolicyRef::traffic(&policy.reference);
                let usable = errors.is_empty();
                for err in errors {
                    dctx.report(reporter, &owner, err);
                }
                usable.then_some(i)
            })
            .collect();

        // Routes are built and decorated even when nothing will be written,
        // so policy problems are reported independently of backing nodes.
        let own_nodes = decorators::virtual_nodes(&dctx.backing_workloads());
        let has_nodes = !own_nodes.is_empty();
        let svc = destination.service_ref();

        // one route per matcher, grouped by matcher set in first-appearance order
        let mut groups: Vec<(&[HttpMatcher], Vec<usize>)> = Vec::new();
        let mut unconditional = Vec::new();
        for &i in &usable {
            let matchers = policies[i].spec.http_request_matchers.as_slice();
            if matchers.is_empty() {
                unconditional.push(i);
                continue;
            }
            match groups.iter_mut().find(|(m, _)| *m == matchers) {
                Some((_, members)) => members.push(i),
                None => groups.push((matchers, vec![i])),
            }
        }
        let mut planned: Vec<(out::RouteMatch, Vec<usize>)> = Vec::new();
        for (matchers, members) in &groups {
            let mut applicable: Vec<usize> = members.iter().chain(&unconditional).copied().collect();
            applicable.sort_unstable();
            for matcher in matchers.iter() {
                planned.push((route_match(matcher), applicable.clone()));
            }
        }
        planned.push((catch_all(), unconditional));

        let default_action = out::RouteAction {
            weighted_targets: decorators::weighted_targets(own_nodes, 100),
        };
        let object = OutputObjectId::new(
            out::VirtualRouter::KIND,
            &svc.name,
            &svc.namespace,
            &svc.cluster_name,
        );
        let mut registry = FieldOwnershipRegistry::new();
        let mut parents = Parents::new();
        let count = planned.len();
        let mut routes = Vec::with_capacity(count);
        for (index, (route_match, applicable)) in planned.into_iter().enumerate() {
            let mut http_route = out::HttpRoute {
                route_match,
                action: default_action.clone(),
                ..Default::default()
            };
            for i in applicable {
                let policy = &policies[i];
                let owner = PolicyRef::traffic(&policy.reference);
                let mut registrar = FieldRegistrar::new(
                    &mut registry,
                    object.clone(),
                    FieldPath::new("spec.routes").index(index).child("httpRoute"),
                    owner.clone(),
                    i as u32,
                );
                for decorator in &self.route_decorators {
                    if let Err(conflict) =
                        decorator.apply(&dctx, policy, &mut http_route, &mut registrar, reporter)
                    {
                        dctx.report(reporter, &owner, conflict.into());
                    }
                }
                parents.add::<TrafficPolicy>(&policy.reference);
            }
            routes.push(out::Route {
                name: if index + 1 == count {
                    "default".to_string()
                } else {
                    format!("route-{index}")
                },
                priority: index as u32,
                http_route,
            });
        }

        if !has_nodes {
            debug!(destination = %dctx.destination_id, "no virtual nodes back destination, skipping");
            return;
        }
        let Some(port) = destination.first_port() else {
            debug!(destination = %dctx.destination_id, "service exposes no ports, skipping");
            return;
        };
        let router_ref = out::NodeRef {
            name: svc.name.clone(),
            namespace: svc.namespace.clone(),
        };
        out.appmesh.virtual_routers.push(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::VirtualRouter::new(
                ObjectMeta::new(&svc.name, &svc.namespace),
                out::VirtualRouterSpec {
                    aws_name: format!("{}-{}-{}", svc.name, svc.namespace, svc.cluster_name),
                    listeners: vec![out::RouterListener {
                        port_mapping: out::PortMapping {
                            port,
                            protocol: "http".to_string(),
                        },
                    }],
                    routes,
                },
            ),
            &parents,
        ));
        out.appmesh.virtual_services.push(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::AppMeshVirtualService::new(
                ObjectMeta::new(&svc.name, &svc.namespace),
                out::AppMeshVirtualServiceSpec {
                    aws_name: dctx.local_fqdn(),
                    provider: out::VirtualServiceProvider {
                        virtual_router: out::RouterRef {
                            virtual_router_ref: router_ref,
                        },
                    },
                },
            ),
            &parents,
        ));
    }

    fn translate_mesh(
        &self,
        ctx: &TranslationContext<'_>,
        mesh: &Mesh,
        _out: &mut OutputSnapshot,
        reporter: &mut dyn Reporter,
    ) {
        let mesh_id = mesh.identity();
        if let Some(vm) = mesh.applied_virtual_mesh() {
            reporter.report_policy_to_mesh(
                &mesh_id,
                &PolicyRef::virtual_mesh(&vm.reference),
                TranslationError::unsupported("VirtualMesh", BACKEND),
            );
        }
        for failover in mesh.applied_failover_services() {
            if ctx.invalid_failover_services.contains(&failover.reference) {
                continue;
            }
            reporter.report_policy_to_mesh(
                &mesh_id,
                &PolicyRef::failover(&failover.reference),
                TranslationError::unsupported("FailoverService", BACKEND),
            );
        }
    }
}
