//! SMI backend (Open Service Mesh)
//!
//! SMI can split traffic between Services of one namespace and grant access
//! between service accounts. Everything else a policy asks for is reported
//! as unsupported and the policy contributes nothing here.

mod decorators;

use std::collections::BTreeSet;

use tracing::debug;

use trellis_common::crd::{
    AccessPolicy, AppliedAccessPolicy, AppliedTrafficPolicy, Destination, Mesh, TrafficPolicy,
    TrustModel,
};
use trellis_common::kube_utils::{deterministic_hash, HasApiResource, ObjectMeta};
use trellis_common::selector::IdentitySelector;
use trellis_common::{ClusterObjectRef, Identified};

pub use decorators::{RouteGroupDecorator, TrafficSplitDecorator};

use crate::decorator::{AccessPolicyDecorator, DecoratorContext, TrafficPolicyDecorator};
use crate::error::TranslationError;
use crate::field_ownership::{FieldOwnershipRegistry, FieldPath, FieldRegistrar, OutputObjectId};
use crate::output::smi as out;
use crate::output::{Output, OutputSnapshot, Parents};
use crate::reporter::{PolicyRef, Reporter};
use crate::translator::{Backend, MeshTranslator, TranslationContext};

pub(crate) const BACKEND: &str = "smi";

/// Policy-level features SMI cannot express at all
fn unsupported_traffic_features(policy: &AppliedTrafficPolicy) -> Vec<TranslationError> {
    let spec = &policy.spec;
    let mut errors = Vec::new();
    if !spec.source_selector.is_empty() {
        errors.push(TranslationError::unsupported("SourceSelector", BACKEND));
    }
    if !spec.http_request_matchers.is_empty() {
        errors.push(TranslationError::unsupported("HttpRequestMatchers", BACKEND));
    }
    if spec.policy.traffic_shift().is_none() {
        errors.push(TranslationError::unsupported(spec.policy.feature_name(), BACKEND));
    }
    errors
}

/// The single service account running the destination's pods
fn destination_service_account(
    dctx: &DecoratorContext<'_>,
) -> Result<ClusterObjectRef, TranslationError> {
    let accounts: BTreeSet<ClusterObjectRef> = dctx
        .backing_workloads()
        .iter()
        .map(|w| w.service_account())
        .collect();
    let svc = dctx.destination.service_ref();
    let n = accounts.len();
    match accounts.into_iter().next() {
        Some(sa) if n == 1 => Ok(sa),
        None => Err(TranslationError::ambiguous(
            "service account",
            format!("no workloads back {svc}"),
        )),
        Some(_) => Err(TranslationError::ambiguous(
            "service account",
            format!("{n} service accounts back {svc}"),
        )),
    }
}

/// TrafficTarget sources; SMI has no namespace or cluster wildcards
fn source_subjects(
    selectors: &[IdentitySelector],
) -> Result<Vec<out::IdentityBindingSubject>, TranslationError> {
    let unsupported =
        || TranslationError::unsupported("IdentitySelector without serviceAccounts", BACKEND);
    if selectors.is_empty() {
        return Err(unsupported());
    }
    let mut subjects = BTreeSet::new();
    for selector in selectors {
        if selector.service_accounts.is_empty() {
            return Err(unsupported());
        }
        subjects.extend(
            selector
                .service_accounts
                .iter()
                .map(|sa| out::IdentityBindingSubject::service_account(&sa.name, &sa.namespace)),
        );
    }
    Ok(subjects.into_iter().collect())
}

/// Name shared by the TrafficTarget and HTTPRouteGroup of one
/// (policy, destination) pair; stable across passes
pub fn access_object_name(policy: &ClusterObjectRef, destination: &ClusterObjectRef) -> String {
    let hash = deterministic_hash(&format!("{}/{}", policy.key(), destination.key()));
    format!("{}-{}", policy.name, hash)
}

/// The SMI translator and its decorator lists
pub struct SmiTranslator {
    split_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::TrafficSplitSpec>>>,
    route_group_decorators: Vec<Box<dyn AccessPolicyDecorator<out::HttpRouteGroupSpec>>>,
}

impl SmiTranslator {
    /// Translator with explicit decorator lists, applied in the given order
    pub fn new(
        split_decorators: Vec<Box<dyn TrafficPolicyDecorator<out::TrafficSplitSpec>>>,
        route_group_decorators: Vec<Box<dyn AccessPolicyDecorator<out::HttpRouteGroupSpec>>>,
    ) -> Self {
        Self {
            split_decorators,
            route_group_decorators,
        }
    }

    /// Translator covering every SMI feature
    pub fn with_default_decorators() -> Self {
        Self::new(
            vec![Box::new(TrafficSplitDecorator)],
            vec![Box::new(RouteGroupDecorator)],
        )
    }

    fn traffic_split(
        &self,
        ctx: &TranslationContext<'_>,
        dctx: &DecoratorContext<'_>,
        reporter: &mut dyn Reporter,
    ) -> Option<Output<out::TrafficSplit>> {
        let svc = dctx.destination.service_ref();
        let object = OutputObjectId::new(
            out::TrafficSplit::KIND,
            &svc.name,
            &svc.namespace,
            &svc.cluster_name,
        );
        let mut registry = FieldOwnershipRegistry::new();
        let mut spec = out::TrafficSplitSpec {
            service: svc.name.clone(),
            backends: Vec::new(),
        };
        let mut parents = Parents::new();
        // A TrafficSplit holds one weighting; equal backends from a second
        // policy are still a second policy.
        let mut shifted_by: Option<PolicyRef> = None;

        for (priority, policy) in dctx.destination.applied_traffic_policies().iter().enumerate() {
            let owner = PolicyRef::traffic(&policy.reference);
            let errors = unsupported_traffic_features(policy);
            if !errors.is_empty() {
                for err in errors {
                    dctx.report(reporter, &owner, err);
                }
                continue;
            }
            if policy.spec.policy.traffic_shift().is_some() {
                if let Some(first) = &shifted_by {
                    dctx.report(
                        reporter,
                        &owner,
                        TranslationError::invalid(
                            "trafficShift",
                            format!(
                                "multiple TrafficShift policies on one TrafficSplit, \
                                 {first} already applies"
                            ),
                        ),
                    );
                    continue;
                }
            }
            let before = spec.backends.clone();
            let mut registrar = FieldRegistrar::new(
                &mut registry,
                object.clone(),
                FieldPath::new("spec"),
                owner.clone(),
                priority as u32,
            );
            for decorator in &self.split_decorators {
                if let Err(conflict) = decorator.apply(dctx, policy, &mut spec, &mut registrar, reporter) {
                    dctx.report(reporter, &owner, conflict.into());
                }
            }
            if spec.backends != before {
                parents.add::<TrafficPolicy>(&policy.reference);
                shifted_by = Some(owner);
            }
        }

        if spec.backends.is_empty() {
            return None;
        }
        Some(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::TrafficSplit::new(ObjectMeta::new(&svc.name, &svc.namespace), spec),
            &parents,
        ))
    }

    /// TrafficTarget and HTTPRouteGroup for one AccessPolicy
    fn access_outputs(
        &self,
        ctx: &TranslationContext<'_>,
        dctx: &DecoratorContext<'_>,
        destination_sa: &ClusterObjectRef,
        policy: &AppliedAccessPolicy,
        out: &mut OutputSnapshot,
        reporter: &mut dyn Reporter,
    ) {
        let owner = PolicyRef::access(&policy.reference);
        if !policy.spec.allowed_ports.is_empty() {
            dctx.report(
                reporter,
                &owner,
                TranslationError::unsupported("AccessPolicy.allowedPorts", BACKEND),
            );
            return;
        }
        let sources = match source_subjects(&policy.spec.source_selector) {
            Ok(sources) => sources,
            Err(err) => {
                dctx.report(reporter, &owner, err);
                return;
            }
        };

        let svc = dctx.destination.service_ref();
        let name = access_object_name(&policy.reference, &dctx.destination_id);
        let parents = Parents::new().with::<AccessPolicy>(&policy.reference);

        let mut group = out::HttpRouteGroupSpec::default();
        for decorator in &self.route_group_decorators {
            decorator.apply(dctx, policy, &mut group, reporter);
        }
        let target = out::TrafficTargetSpec {
            destination: out::IdentityBindingSubject::service_account(
                &destination_sa.name,
                &destination_sa.namespace,
            ),
            sources,
            rules: vec![out::TrafficTargetRule {
                kind: out::HttpRouteGroup::KIND.to_string(),
                name: name.clone(),
                matches: group.matches.iter().map(|m| m.name.clone()).collect(),
            }],
        };

        out.smi.http_route_groups.push(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::HttpRouteGroup::new(ObjectMeta::new(&name, &svc.namespace), group),
            &parents,
        ));
        out.smi.traffic_targets.push(Output::new(
            ctx.instance_id,
            &svc.cluster_name,
            out::TrafficTarget::new(ObjectMeta::new(&name, &svc.namespace), target),
            &parents,
        ));
    }
}

impl MeshTranslator for SmiTranslator {
    fn backend(&self) -> Backend {
        Backend::Smi
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

        if let Some(split) = self.traffic_split(ctx, &dctx, reporter) {
            out.smi.traffic_splits.push(split);
        }

        let policies = destination.applied_access_policies();
        if policies.is_empty() {
            return;
        }
        let destination_sa = match destination_service_account(&dctx) {
            Ok(sa) => sa,
            Err(err) => {
                for policy in policies {
                    dctx.report(reporter, &PolicyRef::access(&policy.reference), err.clone());
                }
                return;
            }
        };
        for policy in policies {
            self.access_outputs(ctx, &dctx, &destination_sa, policy, out, reporter);
        }
        debug!(destination = %dctx.destination_id, "translated smi destination");
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
            let shared_trust = matches!(
                vm.spec.mtls_config.as_ref().map(|m| &m.trust),
                Some(TrustModel::Shared(_))
            );
            if shared_trust {
                reporter.report_policy_to_mesh(
                    &mesh_id,
                    &PolicyRef::virtual_mesh(&vm.reference),
                    TranslationError::unsupported("VirtualMesh shared trust", BACKEND),
                );
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{CollectingReporter, MockReporter};
    use crate::testing::*;
    use trellis_common::crd::{
        AccessPolicySpec, RetryPolicy, TrafficPolicyAction, TrafficShift, WeightedDestination,
    };
    use trellis_common::InputSnapshot;

    fn translate(s: &InputSnapshot, destination: &Destination, reporter: &mut dyn Reporter) -> OutputSnapshot {
        let invalid = BTreeSet::new();
        let ctx = TranslationContext {
            snapshot: s,
            instance_id: "trellis",
            invalid_failover_services: &invalid,
        };
        let mut out = OutputSnapshot::new("trellis");
        SmiTranslator::with_default_decorators().translate_destination(
            &ctx,
            destination,
            s.mesh_of(destination).unwrap(),
            &mut out,
            reporter,
        );
        out
    }

    fn local_shift(name: &str) -> trellis_common::crd::TrafficPolicySpec {
        traffic_spec(TrafficPolicyAction::TrafficShift(TrafficShift {
            destinations: vec![WeightedDestination {
                kube_service: service(name, "bookinfo", "c1"),
                weight: 100,
                ..Default::default()
            }],
        }))
    }

    fn osm_snapshot() -> InputSnapshot {
        let mut s = snapshot();
        s.meshes.insert(osm_mesh("osm", "c1"));
        s.destinations.insert(destination("reviews-v2", "bookinfo", "c1", Some("osm")));
        s
    }

    /// Story: a source-scoped policy reaching OSM is rejected with exactly one report
    #[test]
    fn story_source_selector_is_unsupported() {
        let mut s = osm_snapshot();
        let mut scoped = local_shift("reviews-v2");
        scoped.source_selector = vec![Default::default()];
        let reviews = with_traffic(
            destination("reviews", "bookinfo", "c1", Some("osm")),
            vec![applied_traffic("scoped", scoped)],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = MockReporter::new();
        reporter
            .expect_report_policy_to_target()
            .withf(|target, policy, err| {
                target.name == "reviews-bookinfo-c1"
                    && policy.reference.name == "scoped"
                    && err.to_string() == "unsupported feature: SourceSelector"
            })
            .times(1)
            .return_const(());
        let out = translate(&s, &reviews, &mut reporter);
        assert!(out.smi.traffic_splits.is_empty());
    }

    #[test]
    fn test_second_traffic_shift_conflicts() {
        let mut s = osm_snapshot();
        let reviews = with_traffic(
            destination("reviews", "bookinfo", "c1", Some("osm")),
            vec![
                applied_traffic("first", local_shift("reviews-v2")),
                applied_traffic("second", local_shift("reviews")),
                applied_traffic(
                    "retries",
                    traffic_spec(TrafficPolicyAction::Retries(RetryPolicy {
                        attempts: 1,
                        per_try_timeout: None,
                    })),
                ),
            ],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = CollectingReporter::new();
        let out = translate(&s, &reviews, &mut reporter);
        let id = reviews.identity();
        assert!(reporter
            .target_errors(&id, &PolicyRef::traffic(&policy_id("first")))
            .is_empty());
        assert_eq!(
            reporter.target_errors(&id, &PolicyRef::traffic(&policy_id("second"))),
            ["invalid trafficShift: multiple TrafficShift policies on one TrafficSplit, \
              TrafficPolicy first.trellis-system. already applies"]
        );
        assert_eq!(
            reporter.target_errors(&id, &PolicyRef::traffic(&policy_id("retries"))),
            ["unsupported feature: Retries"]
        );

        let split = &out.smi.traffic_splits[0].resource.spec;
        assert_eq!(split.service, "reviews");
        assert_eq!(split.backends[0].service, "reviews-v2");
    }

    #[test]
    fn test_identical_second_traffic_shift_is_still_reported() {
        let mut s = osm_snapshot();
        let reviews = with_traffic(
            destination("reviews", "bookinfo", "c1", Some("osm")),
            vec![
                applied_traffic("first", local_shift("reviews-v2")),
                applied_traffic("same", local_shift("reviews-v2")),
            ],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = CollectingReporter::new();
        let out = translate(&s, &reviews, &mut reporter);
        let id = reviews.identity();
        assert!(reporter
            .target_errors(&id, &PolicyRef::traffic(&policy_id("first")))
            .is_empty());
        assert_eq!(
            reporter
                .target_errors(&id, &PolicyRef::traffic(&policy_id("same")))
                .len(),
            1
        );
        assert_eq!(out.smi.traffic_splits.len(), 1);
    }

    /// Story: an AccessPolicy with explicit service accounts becomes a
    /// TrafficTarget/HTTPRouteGroup pair
    #[test]
    fn story_access_policy_becomes_traffic_target() {
        let mut s = osm_snapshot();
        s.workloads.insert(workload("reviews-v1", "bookinfo", "c1", &[("app", "reviews")], "reviews"));
        let spec = AccessPolicySpec {
            source_selector: vec![IdentitySelector {
                service_accounts: vec![service("productpage", "bookinfo", "c1")],
                ..Default::default()
            }],
            allowed_paths: vec!["/reviews".into()],
            ..Default::default()
        };
        let reviews = with_access(
            destination("reviews", "bookinfo", "c1", Some("osm")),
            vec![applied_access("allow-productpage", spec)],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = CollectingReporter::new();
        let out = translate(&s, &reviews, &mut reporter);
        assert!(reporter.is_empty());

        let tt = &out.smi.traffic_targets[0];
        let rg = &out.smi.http_route_groups[0];
        assert_eq!(tt.name(), rg.name());
        assert_eq!(
            tt.name(),
            access_object_name(&policy_id("allow-productpage"), &reviews.identity())
        );
        assert!(tt.name().starts_with("allow-productpage-"));
        assert_eq!(tt.resource.spec.destination.name, "reviews");
        assert_eq!(tt.resource.spec.sources[0].name, "productpage");
        assert_eq!(tt.resource.spec.rules[0].kind, "HTTPRouteGroup");
        assert_eq!(tt.resource.spec.rules[0].matches, ["path-0"]);
    }

    #[test]
    fn test_access_requires_unambiguous_service_accounts() {
        let mut s = osm_snapshot();
        s.workloads.insert(workload("reviews-v1", "bookinfo", "c1", &[("app", "reviews")], "reviews-a"));
        s.workloads.insert(workload("reviews-v2", "bookinfo", "c1", &[("app", "reviews")], "reviews-b"));
        let reviews = with_access(
            destination("reviews", "bookinfo", "c1", Some("osm")),
            vec![applied_access("open", AccessPolicySpec::default())],
        );
        s.destinations.insert(reviews.clone());

        let mut reporter = CollectingReporter::new();
        let out = translate(&s, &reviews, &mut reporter);
        assert!(out.smi.traffic_targets.is_empty());
        assert_eq!(
            reporter.target_errors(&reviews.identity(), &PolicyRef::access(&policy_id("open"))),
            ["ambiguous service account: 2 service accounts back reviews.bookinfo.c1"]
        );
    }

    #[test]
    fn test_sources_need_service_accounts() {
        assert!(source_subjects(&[]).is_err());
        assert!(source_subjects(&[IdentitySelector {
            namespaces: vec!["bookinfo".into()],
            ..Default::default()
        }])
        .is_err());
    }

    #[test]
    fn test_access_object_name_is_stable() {
        let a = access_object_name(&policy_id("ap"), &policy_id("reviews"));
        assert_eq!(a, access_object_name(&policy_id("ap"), &policy_id("reviews")));
        assert_ne!(a, access_object_name(&policy_id("ap"), &policy_id("ratings")));
    }
}
