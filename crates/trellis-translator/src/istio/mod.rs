//! Istio backend
//!
//! Per destination:
//! - DestinationRule: client TLS, subsets, outlier detection
//! - VirtualService: one HTTP route per distinct request/source narrowing,
//!   then a catch-all route to the destination itself
//! - AuthorizationPolicy: one ALLOW rule per applied AccessPolicy
//!
//! Per mesh: strict PeerAuthentication and deny-by-default from the applied
//! VirtualMesh, and a ServiceEntry/DestinationRule pair per FailoverService.

mod decorators;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error};

use trellis_common::crd::{
    AccessPolicy, AppliedFailoverService, AppliedTrafficPolicy, Destination, FailoverService,
    GlobalAccessPolicy, HttpMatcher, MeshInstallation, Mesh, MeshType, OutlierDetection,
    TrafficPolicy, VirtualMesh,
};
use trellis_common::kube_utils::{HasApiResource, ObjectMeta};
use trellis_common::selector::WorkloadSelector;
use trellis_common::{ClusterObjectRef, Identified, InputSnapshot, DEFAULT_CLUSTER_DOMAIN};

pub use decorators::{
    CorsDecorator, FaultInjectionDecorator, HeaderManipulationDecorator, MirrorDecorator,
    MtlsDecorator, OperationDecorator, OutlierDetectionDecorator, RequestTimeoutDecorator,
    RetriesDecorator, SourceIdentityDecorator, TrafficShiftDecorator,
};

use crate::decorator::{AccessPolicyDecorator, DecoratorContext, TrafficPolicyDecorator};
use crate::error::TranslationError;
use crate::field_ownership::{FieldOwnershipRegistry, FieldPath, FieldRegistrar, OutputObjectId};
use crate::output::istio as out;
use crate::output::{Output, OutputSnapshot, Parents};
use crate::reporter::{PolicyRef, Reporter};
use crate::translator::{Backend, MeshTranslator, TranslationContext};

pub(crate) const BACKEND: &str = "istio";

/// Label on ServiceEntry endpoints carrying their failover rank
pub const FAILOVER_PRIORITY_LABEL: &str = "failover.networking.trellis.dev/priority";

/// Name of the deny-by-default AuthorizationPolicy
pub const GLOBAL_ACCESS_POLICY_NAME: &str = "global-access-policy";

/// Subset name derived from its labels: `k1-v1-k2-v2` in key order
pub(crate) fn subset_name(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}-{v}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Trust domain of the Istio installation in `cluster`
///
/// Falls back to the mesh being translated when no Istio mesh is installed
/// there, then to the default cluster domain.
pub(crate) fn trust_domain_for_cluster(
    snapshot: &InputSnapshot,
    cluster: &str,
    fallback: &Mesh,
) -> String {
    let istio_trust_domain = |m: &Mesh| match &m.spec.mesh_type {
        MeshType::Istio(i) => Some(i.trust_domain.clone()),
        _ => None,
    };
    snapshot
        .meshes
        .iter()
        .filter(|m| m.installation().is_some_and(|i| i.cluster == cluster))
        .find_map(istio_trust_domain)
        .or_else(|| istio_trust_domain(fallback))
        .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string())
}

/// Policies narrowed to the same requests and callers share a route
struct RouteGroup<'p> {
    matchers: &'p [HttpMatcher],
    sources: &'p [WorkloadSelector],
    members: Vec<usize>,
}

/// Group policies by narrowing in first-appearance order; un-narrowed
/// policies are returned separately and apply to every route
fn route_groups(policies: &[AppliedTrafficPolicy]) -> (Vec<RouteGroup<'_>>, Vec<usize>) {
    let mut groups: Vec<RouteGroup<'_>> = Vec::new();
    let mut catch_all = Vec::new();
    for (i, policy) in policies.iter().enumerate() {
        let matchers = policy.spec.http_request_matchers.as_slice();
        let sources = policy.spec.source_selector.as_slice();
        if matchers.is_empty() && sources.is_empty() {
            catch_all.push(i);
            continue;
        }
        match groups
            .iter_mut()
            .find(|g| g.matchers == matchers && g.sources == sources)
        {
            Some(group) => group.members.push(i),
            None => groups.push(RouteGroup {
                matchers,
                sources,
                members: vec![i],
            }),
        }
    }
    (groups, catch_all)
}

fn http_match(matcher: &HttpMatcher) -> out::HttpMatchRequest {
    let value = |v: &str, regex: bool| {
        if regex {
            out::IstioStringMatch::Regex(v.to_string())
        } else {
            out::IstioStringMatch::Exact(v.to_string())
        }
    };
    let mut req = out::HttpMatchRequest {
        uri: matcher.uri.as_ref().map(Into::into),
        method: matcher.method.clone().map(out::IstioStringMatch::Exact),
        ..Default::default()
    };
    for h in &matcher.headers {
        let m = value(&h.value, h.regex);
        if h.invert_match {
            req.without_headers.insert(h.name.clone(), m);
        } else {
            req.headers.insert(h.name.clone(), m);
        }
    }
    for q in &matcher.query_parameters {
        req.query_params.insert(q.name.clone(), value(&q.value, q.regex));
    }
    req
}

/// Route matches for a group: every request matcher crossed with every
/// source label/namespace combination
fn route_matches(group: &RouteGroup<'_>) -> Vec<out::HttpMatchRequest> {
    let requests: Vec<out::HttpMatchRequest> = if group.matchers.is_empty() {
        vec![out::HttpMatchRequest::default()]
    } else {
        group.matchers.iter().map(http_match).collect()
    };
    if group.sources.is_empty() {
        return requests;
    }
    let sources: Vec<(&BTreeMap<String, String>, Option<&String>)> = group
        .sources
        .iter()
        .flat_map(|s| {
            if s.namespaces.is_empty() {
                vec![(&s.labels, None)]
            } else {
                s.namespaces.iter().map(|ns| (&s.labels, Some(ns))).collect()
            }
        })
        .collect();

    let mut matches = Vec::with_capacity(requests.len() * sources.len());
    for request in &requests {
        for (labels, namespace) in &sources {
            let mut m = request.clone();
            m.source_labels = (*labels).clone();
            m.source_namespace = namespace.cloned();
            matches.push(m);
        }
    }
    matches
}

/// The Istio translator and its decorator lists
pub struct IstioTranslator {
    route_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::HttpRoute>>>,
    destination_rule_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::DestinationRuleSpec>>>,
    access_decorators: Vec<Box<dyn AccessPolicyDecorator<out::AuthorizationRule>>>,
}

impl IstioTranslator {
    /// Translator with explicit decorator lists, applied in the given order
    pub fn new(
        route_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::HttpRoute>>>,
        destination_rule_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::DestinationRuleSpec>>>,
        access_decorators: Vec<Box<dyn AccessPolicyDecorator<out::AuthorizationRule>>>,
    ) -> Self {
        Self {
            route_decorators,
            destination_rule_decorators,
            access_decorators,
        }
    }

    /// Translator covering every Istio feature
    pub fn with_default_decorators() -> Self {
        Self::new(
            vec![
                Box::new(TrafficShiftDecorator),
                Box::new(RequestTimeoutDecorator),
                Box::new(RetriesDecorator),
                Box::new(FaultInjectionDecorator),
                Box::new(MirrorDecorator),
                Box::new(HeaderManipulationDecorator),
                Box::new(CorsDecorator),
            ],
            vec![Box::new(OutlierDetectionDecorator), Box::new(MtlsDecorator)],
            vec![Box::new(SourceIdentityDecorator), Box::new(OperationDecorator)],
        )
    }

    /// Subsets referenced by any applied traffic shift targeting `service`
    fn subsets_for(
        snapshot: &InputSnapshot,
        service: &ClusterObjectRef,
    ) -> (Vec<out::Subset>, BTreeSet<ClusterObjectRef>) {
        let mut label_sets: BTreeSet<&BTreeMap<String, String>> = BTreeSet::new();
        let mut contributors = BTreeSet::new();
        for destination in snapshot.destinations.iter() {
            for policy in destination.applied_traffic_policies() {
                let Some(shift) = policy.spec.policy.traffic_shift() else {
                    continue;
                };
                for weighted in &shift.destinations {
                    if &weighted.kube_service == service && !weighted.subset.is_empty() {
                        label_sets.insert(&weighted.subset);
                        contributors.insert(policy.reference.clone());
                    }
                }
            }
        }
        let subsets = label_sets
            .into_iter()
            .map(|labels| out::Subset {
                name: subset_name(labels),
                labels: labels.clone(),
            })
            .collect();
        (subsets, contributors)
    }

    fn destination_rule(
        &self,
        ctx: &TranslationContext<'_>,
        dctx: &DecoratorContext<'_>,
        registry: &mut FieldOwnershipRegistry,
        reporter: &mut dyn Reporter,
    ) -> Option<Output<out::DestinationRule>> {
        let svc = dctx.destination.service_ref();
        let mut parents = Parents::new();
        let mut spec = out::DestinationRuleSpec {
            host: dctx.local_fqdn(),
            ..Default::default()
        };

        if let Some(vm) = dctx.mesh.applied_virtual_mesh().filter(|vm| vm.spec.has_mtls()) {
            spec.traffic_policy = Some(out::ConnectionPolicy {
                tls: Some(out::ClientTls {
                    mode: "ISTIO_MUTUAL".to_string(),
                }),
                outlier_detection: None,
            });
            parents.add::<VirtualMesh>(&vm.reference);
        }

        let (subsets, contributors) = Self::subsets_for(ctx.snapshot, svc);
        spec.subsets = subsets;
        for policy in &contributors {
            parents.add::<TrafficPolicy>(policy);
        }

        let object = OutputObjectId::new(
            out::DestinationRule::KIND,
            &svc.name,
            &svc.namespace,
            &svc.cluster_name,
        );
        for (priority, policy) in dctx.destination.applied_traffic_policies().iter().enumerate() {
            let owner = PolicyRef::traffic(&policy.reference);
            let before = spec.clone();
            let mut registrar = FieldRegistrar::new(
                registry,
                object.clone(),
                FieldPath::new("spec"),
                owner.clone(),
                priority as u32,
            );
            for decorator in &self.destination_rule_decorators {
                if let Err(conflict) = decorator.apply(dctx, policy, &mut spec, &mut registrar, reporter) {
                    dctx.report(reporter, &owner, conflict.into());
                }
            }
            if spec != before {
                parents.add::<TrafficPolicy>(&policy.reference);
            }
        }

        if spec.traffic_policy.is_none() && spec.subsets.is_empty() {
            return None;
        }
        let meta = ObjectMeta::new(&svc.name, &svc.namespace);
        Some(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::DestinationRule::new(meta, spec),
            &parents,
        ))
    }

    fn virtual_service(
        &self,
        ctx: &TranslationContext<'_>,
        dctx: &DecoratorContext<'_>,
        registry: &mut FieldOwnershipRegistry,
        reporter: &mut dyn Reporter,
    ) -> Option<Output<out::VirtualService>> {
        let policies = dctx.destination.applied_traffic_policies();
        if policies.is_empty() {
            return None;
        }
        let svc = dctx.destination.service_ref();
        let host = dctx.local_fqdn();
        let default_route = vec![out::HttpRouteDestination {
            destination: out::RouteDestination {
                host: host.clone(),
                ..Default::default()
            },
            weight: None,
        }];

        let (groups, catch_all) = route_groups(policies);
        for group in &groups {
            if group.sources.iter().any(|s| !s.clusters.is_empty()) {
                for &i in &group.members {
                    dctx.report(
                        reporter,
                        &PolicyRef::traffic(&policies[i].reference),
                        TranslationError::unsupported("SourceSelector.clusters", BACKEND),
                    );
                }
            }
        }

        let object = OutputObjectId::new(
            out::VirtualService::KIND,
            &svc.name,
            &svc.namespace,
            &svc.cluster_name,
        );
        let mut http = Vec::with_capacity(groups.len() + 1);
        let routes = groups
            .iter()
            .map(|g| (route_matches(g), g.members.as_slice()))
            .chain(std::iter::once((Vec::new(), &[][..])));
        for (matches, members) in routes {
            let index = http.len();
            let mut route = out::HttpRoute {
                matches,
                route: default_route.clone(),
                ..Default::default()
            };
            let mut applicable: Vec<usize> = members.iter().chain(&catch_all).copied().collect();
            applicable.sort_unstable();

            for i in applicable {
                let policy = &policies[i];
                let owner = PolicyRef::traffic(&policy.reference);
                let mut registrar = FieldRegistrar::new(
                    registry,
                    object.clone(),
                    FieldPath::new("spec.http").index(index),
                    owner.clone(),
                    i as u32,
                );
                for decorator in &self.route_decorators {
                    if let Err(conflict) =
                        decorator.apply(dctx, policy, &mut route, &mut registrar, reporter)
                    {
                        dctx.report(reporter, &owner, conflict.into());
                    }
                }
            }
            http.push(route);
        }

        let mut parents = Parents::new();
        for policy in policies {
            parents.add::<TrafficPolicy>(&policy.reference);
        }
        let meta = ObjectMeta::new(&svc.name, &svc.namespace);
        Some(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::VirtualService::new(
                meta,
                out::VirtualServiceSpec {
                    hosts: vec![host],
                    http,
                },
            ),
            &parents,
        ))
    }

    fn authorization_policy(
        &self,
        ctx: &TranslationContext<'_>,
        dctx: &DecoratorContext<'_>,
        reporter: &mut dyn Reporter,
    ) -> Option<Output<out::AuthorizationPolicy>> {
        let policies = dctx.destination.applied_access_policies();
        if policies.is_empty() {
            return None;
        }
        let svc = dctx.destination.service_ref();
        let labels = &dctx.destination.spec.kube_service.workload_selector_labels;
        let mut parents = Parents::new();
        let mut spec = out::AuthorizationPolicySpec {
            selector: (!labels.is_empty()).then(|| out::WorkloadSelector {
                match_labels: labels.clone(),
            }),
            action: "ALLOW".to_string(),
            rules: Vec::with_capacity(policies.len()),
        };
        for policy in policies {
            let mut rule = out::AuthorizationRule::default();
            for decorator in &self.access_decorators {
                decorator.apply(dctx, policy, &mut rule, reporter);
            }
            spec.rules.push(rule);
            parents.add::<AccessPolicy>(&policy.reference);
        }
        let meta = ObjectMeta::new(&svc.name, &svc.namespace);
        Some(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::AuthorizationPolicy::new(meta, spec),
            &parents,
        ))
    }

    fn failover_outputs(
        ctx: &TranslationContext<'_>,
        installation: &MeshInstallation,
        failover: &AppliedFailoverService,
        out: &mut OutputSnapshot,
    ) {
        let spec = &failover.spec;
        let endpoints = spec
            .backing_services
            .iter()
            .enumerate()
            .filter_map(|(priority, service)| {
                let backing = ctx.snapshot.destination_for_service(service)?;
                Some(out::WorkloadEntry {
                    address: backing.local_fqdn(ctx.snapshot.cluster_domain(&service.cluster_name)),
                    labels: BTreeMap::from([(
                        FAILOVER_PRIORITY_LABEL.to_string(),
                        priority.to_string(),
                    )]),
                })
            })
            .collect();
        let protocol = spec.port.protocol.to_lowercase();
        let parents = Parents::new().with::<FailoverService>(&failover.reference);
        let name = &failover.reference.name;

        out.istio.service_entries.push(Output::new(
            ctx.instance_id,
            &installation.cluster,
            out::ServiceEntry::new(
                ObjectMeta::new(name, &installation.namespace),
                out::ServiceEntrySpec {
                    hosts: vec![spec.hostname.clone()],
                    ports: vec![out::ServiceEntryPort {
                        number: spec.port.number,
                        protocol: protocol.to_uppercase(),
                        name: format!("{}-{}", protocol, spec.port.number),
                    }],
                    location: "MESH_INTERNAL".to_string(),
                    resolution: "DNS".to_string(),
                    endpoints,
                },
            ),
            &parents,
        ));
        out.istio.destination_rules.push(Output::new(
            ctx.instance_id,
            &installation.cluster,
            out::DestinationRule::new(
                ObjectMeta::new(name, &installation.namespace),
                out::DestinationRuleSpec {
                    host: spec.hostname.clone(),
                    traffic_policy: Some(out::ConnectionPolicy {
                        tls: None,
                        outlier_detection: Some(decorators::outlier_detection(
                            &OutlierDetection::default(),
                        )),
                    }),
                    subsets: vec![],
                },
            ),
            &parents,
        ));
    }
}

impl MeshTranslator for IstioTranslator {
    fn backend(&self) -> Backend {
        Backend::Istio
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
        let mut registry = FieldOwnershipRegistry::new();

        if let Some(dr) = self.destination_rule(ctx, &dctx, &mut registry, reporter) {
            out.istio.destination_rules.push(dr);
        }
        if let Some(vs) = self.virtual_service(ctx, &dctx, &mut registry, reporter) {
            out.istio.virtual_services.push(vs);
        }
        if let Some(ap) = self.authorization_policy(ctx, &dctx, reporter) {
            out.istio.authorization_policies.push(ap);
        }
        debug!(
            destination = %dctx.destination_id,
            owned_fields = registry.len(),
            "translated istio destination"
        );
    }

    fn translate_mesh(
        &self,
        ctx: &TranslationContext<'_>,
        mesh: &Mesh,
        out: &mut OutputSnapshot,
        reporter: &mut dyn Reporter,
    ) {
        let MeshType::Istio(istio) = &mesh.spec.mesh_type else {
            error!(mesh = %mesh.identity(), "should never happen: non-istio mesh in istio translator");
            return;
        };
        let installation = &istio.installation;
        let mesh_id = mesh.identity();

        if let Some(vm) = mesh.applied_virtual_mesh() {
            let vm_ref = PolicyRef::virtual_mesh(&vm.reference);
            let parents = Parents::new().with::<VirtualMesh>(&vm.reference);

            if let Some(secret) = vm.spec.root_ca_secret() {
                let secret_id = secret.within(&vm.reference);
                if !ctx.snapshot.secrets.contains(&secret_id) {
                    reporter.report_policy_to_mesh(
                        &mesh_id,
                        &vm_ref,
                        TranslationError::missing("Secret", secret_id.key()),
                    );
                }
            }
            if vm.spec.has_mtls() {
                out.istio.peer_authentications.push(Output::new(
                    ctx.instance_id,
                    &installation.cluster,
                    out::PeerAuthentication::new(
                        ObjectMeta::new("default", &installation.namespace),
                        out::PeerAuthenticationSpec {
                            mtls: out::PeerMtls {
                                mode: "STRICT".to_string(),
                            },
                        },
                    ),
                    &parents,
                ));
            }
            if vm.spec.global_access_policy == GlobalAccessPolicy::Enabled {
                out.istio.authorization_policies.push(Output::new(
                    ctx.instance_id,
                    &installation.cluster,
                    out::AuthorizationPolicy::new(
                        ObjectMeta::new(GLOBAL_ACCESS_POLICY_NAME, &installation.namespace),
                        out::AuthorizationPolicySpec::default(),
                    ),
                    &parents,
                ));
            }
        }

        for failover in mesh.applied_failover_services() {
            if ctx.invalid_failover_services.contains(&failover.reference) {
                debug!(failover_service = %failover.reference, "skipping invalid failover service");
                continue;
            }
            Self::failover_outputs(ctx, installation, failover, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{CollectingReporter, MockReporter};
    use crate::testing::*;
    use trellis_common::crd::{
        AccessPolicySpec, AppliedVirtualMesh, FailoverPort, FailoverServiceSpec, GeneratedRootCa,
        MeshStatus, MtlsConfig, RetryPolicy, RootCertificateAuthority, SharedTrust,
        TrafficPolicyAction, TrafficShift, TrustModel, VirtualMeshSpec, WeightedDestination,
    };
    use trellis_common::selector::IdentitySelector;
    use trellis_common::ObjectRef;

    fn ctx<'a>(
        snapshot: &'a InputSnapshot,
        invalid: &'a BTreeSet<ClusterObjectRef>,
    ) -> TranslationContext<'a> {
        TranslationContext {
            snapshot,
            instance_id: "trellis",
            invalid_failover_services: invalid,
        }
    }

    fn translate(
        s: &InputSnapshot,
        destination: &Destination,
        reporter: &mut dyn Reporter,
    ) -> OutputSnapshot {
        let invalid = BTreeSet::new();
        let mesh = s.mesh_of(destination).unwrap();
        let mut out = OutputSnapshot::new("trellis");
        IstioTranslator::with_default_decorators().translate_destination(
            &ctx(s, &invalid),
            destination,
            mesh,
            &mut out,
            reporter,
        );
        out
    }

    fn shift(service: ClusterObjectRef, subset: &[(&str, &str)]) -> TrafficPolicyAction {
        TrafficPolicyAction::TrafficShift(TrafficShift {
            destinations: vec![WeightedDestination {
                kube_service: service,
                weight: 100,
                subset: subset
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                port: None,
            }],
        })
    }

    fn with_vm(mut mesh: Mesh, spec: VirtualMeshSpec) -> Mesh {
        mesh.status = Some(MeshStatus {
            observed_generation: 1,
            applied_virtual_mesh: Some(AppliedVirtualMesh {
                reference: policy_id("vm"),
                observed_generation: 1,
                spec,
            }),
            applied_failover_services: vec![],
        });
        mesh
    }

    fn shared_trust() -> Option<MtlsConfig> {
        Some(MtlsConfig {
            trust: TrustModel::Shared(SharedTrust {
                root_certificate_authority: RootCertificateAuthority::Generated(
                    GeneratedRootCa::default(),
                ),
            }),
            auto_restart_pods: false,
        })
    }

    /// Story: a retried, subset-shifted destination in an mTLS virtual mesh
    #[test]
    fn story_destination_rule_and_virtual_service() {
        let mut s = snapshot();
        s.meshes.insert(with_vm(
            istio_mesh("istio", "c1"),
            VirtualMeshSpec {
                meshes: vec![ObjectRef::new("istio", NS)],
                mtls_config: shared_trust(),
                global_access_policy: GlobalAccessPolicy::Disabled,
            },
        ));
        let reviews = with_traffic(
            destination("reviews", "bookinfo", "c1", Some("istio")),
            vec![
                applied_traffic(
                    "shift",
                    traffic_spec(shift(service("reviews", "bookinfo", "c1"), &[("version", "v2")])),
                ),
                applied_traffic(
                    "retries",
                    traffic_spec(TrafficPolicyAction::Retries(RetryPolicy {
                        attempts: 3,
                        per_try_timeout: Some("2s".into()),
                    })),
                ),
            ],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = CollectingReporter::new();
        let out = translate(&s, &reviews, &mut reporter);
        assert!(reporter.is_empty());

        let dr = &out.istio.destination_rules[0];
        assert_eq!(dr.cluster, "c1");
        assert_eq!(dr.resource.spec.host, "reviews.bookinfo.svc.cluster.local");
        assert_eq!(
            dr.resource.spec.traffic_policy.as_ref().unwrap().tls,
            Some(out::ClientTls {
                mode: "ISTIO_MUTUAL".into()
            })
        );
        assert_eq!(dr.resource.spec.subsets.len(), 1);
        assert_eq!(dr.resource.spec.subsets[0].name, "version-v2");

        let vs = &out.istio.virtual_services[0].resource.spec;
        assert_eq!(vs.http.len(), 1);
        let route = &vs.http[0];
        assert!(route.matches.is_empty());
        assert_eq!(route.route[0].destination.subset.as_deref(), Some("version-v2"));
        assert_eq!(route.retries.as_ref().unwrap().attempts, 3);
    }

    /// Story: two timeouts on one route; the earlier policy keeps the field
    #[test]
    fn story_conflicting_timeouts_are_reported_against_the_later_policy() {
        let mut s = snapshot();
        s.meshes.insert(istio_mesh("istio", "c1"));
        let reviews = with_traffic(
            destination("reviews", "bookinfo", "c1", Some("istio")),
            vec![
                applied_traffic("first", traffic_spec(TrafficPolicyAction::RequestTimeout("5s".into()))),
                applied_traffic("second", traffic_spec(TrafficPolicyAction::RequestTimeout("9s".into()))),
                applied_traffic("same", traffic_spec(TrafficPolicyAction::RequestTimeout("5s".into()))),
            ],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = MockReporter::new();
        reporter
            .expect_report_policy_to_target()
            .withf(|target, policy, err| {
                target.name == "reviews-bookinfo-c1"
                    && policy.reference.name == "second"
                    && err.to_string().starts_with("field spec.http[0].timeout of VirtualService")
            })
            .times(1)
            .return_const(());
        let out = translate(&s, &reviews, &mut reporter);
        assert_eq!(
            out.istio.virtual_services[0].resource.spec.http[0].timeout.as_deref(),
            Some("5s")
        );
    }

    #[test]
    fn test_narrowed_policies_get_their_own_route_before_the_catch_all() {
        let mut s = snapshot();
        s.meshes.insert(istio_mesh("istio", "c1"));
        let mut narrowed = traffic_spec(TrafficPolicyAction::RequestTimeout("1s".into()));
        narrowed.http_request_matchers = vec![HttpMatcher {
            uri: Some(trellis_common::crd::StringMatch::Prefix("/api".into())),
            ..Default::default()
        }];
        narrowed.source_selector = vec![WorkloadSelector {
            labels: BTreeMap::from([("app".to_string(), "productpage".to_string())]),
            namespaces: vec!["web".into()],
            clusters: vec![],
        }];
        let reviews = with_traffic(
            destination("reviews", "bookinfo", "c1", Some("istio")),
            vec![
                applied_traffic("narrow", narrowed),
                applied_traffic(
                    "everywhere",
                    traffic_spec(TrafficPolicyAction::Retries(RetryPolicy {
                        attempts: 2,
                        per_try_timeout: None,
                    })),
                ),
            ],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = CollectingReporter::new();
        let out = translate(&s, &reviews, &mut reporter);
        assert!(reporter.is_empty());
        let http = &out.istio.virtual_services[0].resource.spec.http;
        assert_eq!(http.len(), 2);
        assert_eq!(http[0].matches.len(), 1);
        assert_eq!(http[0].matches[0].source_namespace.as_deref(), Some("web"));
        assert_eq!(http[0].timeout.as_deref(), Some("1s"));
        assert!(http[0].retries.is_some());
        assert!(http[1].matches.is_empty());
        assert!(http[1].timeout.is_none());
        assert!(http[1].retries.is_some());
    }

    #[test]
    fn test_authorization_policy_principals() {
        let mut s = snapshot();
        s.meshes.insert(istio_mesh("istio", "c1"));
        s.meshes.insert(istio_mesh("istio-east", "c2"));
        let reviews = with_access(
            destination("reviews", "bookinfo", "c1", Some("istio")),
            vec![applied_access(
                "ap",
                AccessPolicySpec {
                    source_selector: vec![IdentitySelector {
                        service_accounts: vec![service("productpage", "bookinfo", "c2")],
                        ..Default::default()
                    }],
                    destination_selector: vec![],
                    allowed_paths: vec!["/reviews/*".into()],
                    allowed_methods: vec![],
                    allowed_ports: vec![9080],
                },
            )],
        );
        s.destinations.insert(reviews.clone());

        let out = translate(&s, &reviews, &mut CollectingReporter::new());
        let ap = &out.istio.authorization_policies[0].resource.spec;
        assert_eq!(ap.action, "ALLOW");
        assert_eq!(
            ap.selector.as_ref().unwrap().match_labels.get("app").map(String::as_str),
            Some("reviews")
        );
        assert_eq!(
            ap.rules[0].from[0].source.principals,
            ["c2.local/ns/bookinfo/sa/productpage"]
        );
        assert_eq!(ap.rules[0].to[0].operation.ports, ["9080"]);
        assert!(out.istio.virtual_services.is_empty());
        assert!(out.istio.destination_rules.is_empty());
    }

    /// Story: mesh-level outputs for mTLS, deny-by-default and failover
    #[test]
    fn story_mesh_outputs() {
        let mut s = snapshot();
        s.destinations.insert(destination("reviews", "bookinfo", "c1", Some("istio")));
        s.destinations.insert(destination("reviews", "bookinfo", "c2", Some("istio")));
        let mut mesh = with_vm(
            istio_mesh("istio", "c1"),
            VirtualMeshSpec {
                meshes: vec![ObjectRef::new("istio", NS)],
                mtls_config: Some(MtlsConfig {
                    trust: TrustModel::Shared(SharedTrust {
                        root_certificate_authority: RootCertificateAuthority::Secret(
                            ObjectRef::new("root-ca", NS),
                        ),
                    }),
                    auto_restart_pods: true,
                }),
                global_access_policy: GlobalAccessPolicy::Enabled,
            },
        );
        let failover = |name: &str| AppliedFailoverService {
            reference: policy_id(name),
            observed_generation: 1,
            spec: FailoverServiceSpec {
                hostname: "reviews.global".into(),
                port: FailoverPort {
                    number: 9080,
                    protocol: "http".into(),
                },
                meshes: vec![ObjectRef::new("istio", NS)],
                backing_services: vec![
                    service("reviews", "bookinfo", "c1"),
                    service("reviews", "bookinfo", "c2"),
                ],
            },
        };
        if let Some(status) = mesh.status.as_mut() {
            status.applied_failover_services = vec![failover("reviews-fs"), failover("broken-fs")];
        }
        s.meshes.insert(mesh.clone());

        let invalid = BTreeSet::from([policy_id("broken-fs")]);
        let mut reporter = CollectingReporter::new();
        let mut out = OutputSnapshot::new("trellis");
        IstioTranslator::with_default_decorators().translate_mesh(
            &ctx(&s, &invalid),
            &mesh,
            &mut out,
            &mut reporter,
        );

        assert_eq!(
            reporter.mesh_errors(&mesh_id("istio"), &PolicyRef::virtual_mesh(&policy_id("vm"))),
            ["Secret root-ca.trellis-system. not found"]
        );
        let pa = &out.istio.peer_authentications[0];
        assert_eq!(pa.namespace(), "istio-system");
        assert_eq!(pa.resource.spec.mtls.mode, "STRICT");
        let deny = &out.istio.authorization_policies[0];
        assert_eq!(deny.name(), GLOBAL_ACCESS_POLICY_NAME);
        assert_eq!(deny.resource.spec, out::AuthorizationPolicySpec::default());

        assert_eq!(out.istio.service_entries.len(), 1);
        let se = &out.istio.service_entries[0].resource.spec;
        assert_eq!(se.hosts, ["reviews.global"]);
        assert_eq!(se.ports[0].protocol, "HTTP");
        assert_eq!(se.endpoints.len(), 2);
        assert_eq!(
            se.endpoints[1].labels.get(FAILOVER_PRIORITY_LABEL).map(String::as_str),
            Some("1")
        );
        let dr = &out.istio.destination_rules[0].resource.spec;
        assert_eq!(dr.host, "reviews.global");
        assert!(dr.traffic_policy.as_ref().unwrap().outlier_detection.is_some());
    }

    #[test]
    fn test_trust_domain_falls_back_to_translated_mesh() {
        let s = snapshot();
        let mesh = istio_mesh("istio", "c1");
        assert_eq!(trust_domain_for_cluster(&s, "c9", &mesh), "c1.local");
        assert_eq!(
            trust_domain_for_cluster(&s, "c9", &osm_mesh("osm", "c1")),
            DEFAULT_CLUSTER_DOMAIN
        );
    }

    #[test]
    fn test_subset_name_uses_sorted_labels() {
        let labels = BTreeMap::from([
            ("version".to_string(), "v2".to_string()),
            ("tier".to_string(), "canary".to_string()),
        ]);
        assert_eq!(subset_name(&labels), "tier-canary-version-v2");
    }
}
