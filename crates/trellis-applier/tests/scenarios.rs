//! End-to-end applier scenarios
//!
//! A scripted translator stands in for the backends where a test needs exact
//! control over what is reported; the rest run the production translator.

use std::collections::BTreeMap;

use trellis_applier::{run_pass, Applier};
use trellis_common::crd::{
    ApprovalState, ApprovalStatus, Destination, DestinationSpec, FailoverPort, FailoverService,
    FailoverServiceSpec, FaultInjection, IstioMesh, KubeService, KubeServicePort,
    KubernetesWorkload, Mesh, MeshInstallation, MeshSpec, MeshType, Mirror, OsmMesh, RetryPolicy,
    TrafficPolicy, TrafficPolicyAction, TrafficPolicySpec, VirtualMesh, VirtualMeshSpec,
    VirtualMeshStatus, Workload, WorkloadSpec,
};
use trellis_common::selector::WorkloadSelector;
use trellis_common::{ClusterObjectRef, Identified, InputSnapshot, ObjectRef};
use trellis_translator::{
    OutputSnapshot, PolicyRef, Reporter, Translate, TranslationError, Translator,
};
use uuid::Uuid;

const NS: &str = "trellis-system";

// =============================================================================
// Fixtures
// =============================================================================

fn id(name: &str) -> ClusterObjectRef {
    ClusterObjectRef::new(name, NS, "")
}

fn istio_mesh(name: &str, cluster: &str) -> Mesh {
    let mut m = Mesh::new(
        name,
        MeshSpec {
            mesh_type: MeshType::Istio(IstioMesh {
                installation: MeshInstallation {
                    namespace: "istio-system".into(),
                    cluster: cluster.into(),
                    version: "1.20".into(),
                },
                trust_domain: format!("{cluster}.local"),
            }),
        },
    );
    m.metadata.namespace = Some(NS.into());
    m
}

fn osm_mesh(name: &str, cluster: &str) -> Mesh {
    let mut m = Mesh::new(
        name,
        MeshSpec {
            mesh_type: MeshType::Osm(OsmMesh {
                installation: MeshInstallation {
                    namespace: "osm-system".into(),
                    cluster: cluster.into(),
                    version: "1.2".into(),
                },
            }),
        },
    );
    m.metadata.namespace = Some(NS.into());
    m
}

/// Destination `name` for Service reviews.bookinfo in `cluster`
fn destination(name: &str, cluster: &str, mesh: &str) -> Destination {
    let mut d = Destination::new(
        name,
        DestinationSpec {
            kube_service: KubeService {
                reference: ClusterObjectRef::new("reviews", "bookinfo", cluster),
                workload_selector_labels: BTreeMap::from([("app".into(), "reviews".into())]),
                labels: BTreeMap::from([("app".into(), "reviews".into())]),
                ports: vec![KubeServicePort {
                    port: 9080,
                    name: "http".into(),
                    protocol: "TCP".into(),
                }],
                subsets: BTreeMap::new(),
            },
            mesh: Some(ObjectRef::new(mesh, NS)),
        },
    );
    d.metadata.namespace = Some(NS.into());
    d
}

fn workload(name: &str, cluster: &str, mesh: &str) -> Workload {
    let mut w = Workload::new(
        name,
        WorkloadSpec {
            kubernetes: KubernetesWorkload {
                controller: ClusterObjectRef::new(name, "bookinfo", cluster),
                pod_labels: BTreeMap::from([("app".into(), name.into())]),
                service_account_name: name.into(),
            },
            mesh: Some(ObjectRef::new(mesh, NS)),
            app_mesh: None,
        },
    );
    w.metadata.namespace = Some(NS.into());
    w
}

fn traffic_policy(name: &str, policy: TrafficPolicyAction) -> TrafficPolicy {
    let mut tp = TrafficPolicy::new(
        name,
        TrafficPolicySpec {
            source_selector: vec![],
            destination_selector: vec![],
            http_request_matchers: vec![],
            policy,
        },
    );
    tp.metadata.namespace = Some(NS.into());
    tp
}

fn retries() -> TrafficPolicyAction {
    TrafficPolicyAction::Retries(RetryPolicy {
        attempts: 3,
        per_try_timeout: Some("2s".into()),
    })
}

fn virtual_mesh(name: &str, meshes: &[&str], previous: ApprovalState) -> VirtualMesh {
    let mut vm = VirtualMesh::new(
        name,
        VirtualMeshSpec {
            meshes: meshes.iter().map(|m| ObjectRef::new(*m, NS)).collect(),
            mtls_config: None,
            global_access_policy: Default::default(),
        },
    );
    vm.metadata.namespace = Some(NS.into());
    vm.status = Some(VirtualMeshStatus {
        state: previous,
        ..Default::default()
    });
    vm
}

fn failover_service(name: &str, hostname: &str) -> FailoverService {
    let mut fs = FailoverService::new(
        name,
        FailoverServiceSpec {
            hostname: hostname.into(),
            port: FailoverPort {
                number: 9080,
                protocol: "http".into(),
            },
            meshes: vec![ObjectRef::new("mesh1", NS)],
            backing_services: vec![ClusterObjectRef::new("reviews", "bookinfo", "c1")],
        },
    );
    fs.metadata.namespace = Some(NS.into());
    fs
}

fn traffic_approval(snapshot: &InputSnapshot, policy: &str, destination: &str) -> ApprovalStatus {
    snapshot
        .traffic_policies
        .find(&id(policy))
        .unwrap()
        .approval_for(&id(destination).key())
        .cloned()
        .unwrap()
}

fn applied_traffic(snapshot: &InputSnapshot, destination: &str) -> Vec<String> {
    snapshot
        .destinations
        .find(&id(destination))
        .unwrap()
        .applied_traffic_policies()
        .iter()
        .map(|p| p.reference.name.clone())
        .collect()
}

fn virtual_mesh_state(snapshot: &InputSnapshot, name: &str) -> ApprovalState {
    snapshot
        .virtual_meshes
        .find(&id(name))
        .unwrap()
        .status
        .as_ref()
        .unwrap()
        .state
}

// =============================================================================
// Scripted translator
// =============================================================================

/// Reports fixed errors for policies applied where the script says
#[derive(Default)]
struct ScriptedTranslator {
    target_errors: Vec<(ClusterObjectRef, PolicyRef, String)>,
}

impl ScriptedTranslator {
    fn reject(mut self, destination: &str, policy: &str, message: &str) -> Self {
        self.target_errors.push((
            id(destination),
            PolicyRef::traffic(&id(policy)),
            message.to_string(),
        ));
        self
    }
}

impl Translate for ScriptedTranslator {
    fn translate(&self, snapshot: &InputSnapshot, reporter: &mut dyn Reporter) -> OutputSnapshot {
        for destination in snapshot.destinations.iter() {
            let target = destination.identity();
            for applied in destination.applied_traffic_policies() {
                let policy = PolicyRef::traffic(&applied.reference);
                for (t, p, message) in &self.target_errors {
                    if *t == target && *p == policy {
                        reporter.report_policy_to_target(
                            &target,
                            &policy,
                            TranslationError::invalid("policy", message.clone()),
                        );
                    }
                }
            }
        }
        OutputSnapshot::new("test")
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn story_two_compatible_policies_are_both_accepted_in_identity_order() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.destinations.insert(destination("ms1", "c1", "mesh1"));
    s.traffic_policies.insert(traffic_policy(
        "tp1",
        TrafficPolicyAction::Mirror(Mirror {
            kube_service: ClusterObjectRef::new("reviews", "bookinfo", "c1"),
            percentage: 10.0,
            port: None,
        }),
    ));
    s.traffic_policies.insert(traffic_policy(
        "tp2",
        TrafficPolicyAction::FaultInjection(FaultInjection {
            fixed_delay: Some("1s".into()),
            abort_http_status: None,
            percentage: 5.0,
        }),
    ));

    let translator = ScriptedTranslator::default();
    Applier::new(&translator).apply(&mut s);

    assert_eq!(traffic_approval(&s, "tp1", "ms1"), ApprovalStatus::accepted(0));
    assert_eq!(traffic_approval(&s, "tp2", "ms1"), ApprovalStatus::accepted(1));
    assert_eq!(applied_traffic(&s, "ms1"), vec!["tp1", "tp2"]);
}

#[test]
fn story_reported_policy_is_invalid_and_not_applied() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.destinations.insert(destination("ms1", "c1", "mesh1"));
    s.traffic_policies.insert(traffic_policy("tp1", retries()));

    let translator = ScriptedTranslator::default().reject("ms1", "tp1", "cannot honor retries");
    Applier::new(&translator).apply(&mut s);

    let approval = traffic_approval(&s, "tp1", "ms1");
    assert_eq!(approval.state, ApprovalState::Invalid);
    assert_eq!(approval.errors, ["invalid policy: cannot honor retries"]);
    assert!(applied_traffic(&s, "ms1").is_empty());
}

#[test]
fn story_virtual_mesh_exclusivity() {
    let mut s = InputSnapshot::default();
    for mesh in ["mesh1", "mesh2", "mesh3"] {
        s.meshes.insert(istio_mesh(mesh, "c1"));
    }
    s.virtual_meshes.insert(virtual_mesh("vm1", &["mesh1"], ApprovalState::Accepted));
    s.virtual_meshes.insert(virtual_mesh("vm2", &["mesh1", "mesh2"], ApprovalState::Pending));
    s.virtual_meshes.insert(virtual_mesh("vm3", &["mesh2"], ApprovalState::Pending));
    s.virtual_meshes.insert(virtual_mesh("vm4", &["mesh2"], ApprovalState::Pending));
    s.virtual_meshes.insert(virtual_mesh("vm5", &["mesh3"], ApprovalState::Pending));

    let translator = ScriptedTranslator::default();
    Applier::new(&translator).apply(&mut s);

    assert_eq!(virtual_mesh_state(&s, "vm1"), ApprovalState::Accepted);
    assert_eq!(virtual_mesh_state(&s, "vm2"), ApprovalState::Invalid);
    assert_eq!(virtual_mesh_state(&s, "vm3"), ApprovalState::Accepted);
    assert_eq!(virtual_mesh_state(&s, "vm4"), ApprovalState::Invalid);
    assert_eq!(virtual_mesh_state(&s, "vm5"), ApprovalState::Accepted);

    let vm2 = s.virtual_meshes.find(&id("vm2")).unwrap();
    assert_eq!(
        vm2.status.as_ref().unwrap().errors,
        ["mesh mesh1.trellis-system. is already claimed by VirtualMesh vm1.trellis-system."]
    );
    let mesh2 = s.meshes.find(&id("mesh2")).unwrap();
    assert_eq!(mesh2.applied_virtual_mesh().unwrap().reference, id("vm3"));
}

#[test]
fn story_source_selector_is_rejected_only_where_the_backend_cannot_honor_it() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("istio", "c1"));
    s.meshes.insert(osm_mesh("osm", "c2"));
    s.destinations.insert(destination("reviews-c1", "c1", "istio"));
    s.destinations.insert(destination("reviews-c2", "c2", "osm"));
    s.workloads.insert(workload("productpage", "c1", "istio"));
    s.workloads.insert(workload("details", "c1", "istio"));
    let mut tp = traffic_policy("retries", retries());
    tp.spec.source_selector = vec![WorkloadSelector {
        labels: BTreeMap::from([("app".into(), "productpage".into())]),
        ..Default::default()
    }];
    s.traffic_policies.insert(tp);

    let translator = Translator::with_default_decorators("trellis");
    let outcome = run_pass(&mut s, &translator, Uuid::new_v4());

    assert_eq!(traffic_approval(&s, "retries", "reviews-c1"), ApprovalStatus::accepted(0));
    let rejected = traffic_approval(&s, "retries", "reviews-c2");
    assert_eq!(rejected.state, ApprovalState::Invalid);
    assert!(rejected
        .errors
        .contains(&"unsupported feature: SourceSelector".to_string()));

    assert_eq!(applied_traffic(&s, "reviews-c1"), vec!["retries"]);
    assert!(applied_traffic(&s, "reviews-c2").is_empty());

    let status = s.traffic_policies.find(&id("retries")).unwrap().status.clone().unwrap();
    assert_eq!(status.workloads, vec!["productpage.trellis-system."]);
    assert!(!outcome.outputs.istio.virtual_services.is_empty());
    assert!(outcome.outputs.smi.traffic_splits.is_empty());
    assert_eq!(outcome.late_reports, 0);
}

// =============================================================================
// Properties
// =============================================================================

#[test]
fn test_established_virtual_mesh_beats_identity_order() {
    let build = |incumbent: ApprovalState| {
        let mut s = InputSnapshot::default();
        s.meshes.insert(istio_mesh("mesh1", "c1"));
        s.virtual_meshes.insert(virtual_mesh("vm-a", &["mesh1"], ApprovalState::Pending));
        s.virtual_meshes.insert(virtual_mesh("vm-b", &["mesh1"], incumbent));
        s
    };
    let translator = ScriptedTranslator::default();

    let mut with_history = build(ApprovalState::Accepted);
    Applier::new(&translator).apply(&mut with_history);
    assert_eq!(virtual_mesh_state(&with_history, "vm-b"), ApprovalState::Accepted);
    assert_eq!(virtual_mesh_state(&with_history, "vm-a"), ApprovalState::Invalid);

    let mut without_history = build(ApprovalState::Pending);
    Applier::new(&translator).apply(&mut without_history);
    assert_eq!(virtual_mesh_state(&without_history, "vm-a"), ApprovalState::Accepted);
    assert_eq!(virtual_mesh_state(&without_history, "vm-b"), ApprovalState::Invalid);
}

#[test]
fn test_rejected_policy_does_not_advance_the_counter() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.destinations.insert(destination("ms1", "c1", "mesh1"));
    for name in ["tp1", "tp2", "tp3"] {
        s.traffic_policies.insert(traffic_policy(name, retries()));
    }

    let translator = ScriptedTranslator::default().reject("ms1", "tp2", "conflict");
    Applier::new(&translator).apply(&mut s);

    assert_eq!(traffic_approval(&s, "tp1", "ms1").acceptance_order, 0);
    assert_eq!(traffic_approval(&s, "tp2", "ms1").acceptance_order, 1);
    assert_eq!(traffic_approval(&s, "tp3", "ms1").acceptance_order, 1);
    assert_eq!(applied_traffic(&s, "ms1"), vec!["tp1", "tp3"]);
}

#[test]
fn test_accepted_policy_keeps_its_rank_when_a_new_one_sorts_before_it() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.destinations.insert(destination("ms1", "c1", "mesh1"));
    s.traffic_policies.insert(traffic_policy("tp-b", retries()));

    let translator = ScriptedTranslator::default();
    Applier::new(&translator).apply(&mut s);
    s.traffic_policies.insert(traffic_policy("tp-a", retries()));
    Applier::new(&translator).apply(&mut s);

    assert_eq!(traffic_approval(&s, "tp-b", "ms1"), ApprovalStatus::accepted(0));
    assert_eq!(traffic_approval(&s, "tp-a", "ms1"), ApprovalStatus::accepted(1));
    assert_eq!(applied_traffic(&s, "ms1"), vec!["tp-b", "tp-a"]);
}

/// Story: an accepted policy edited since its acceptance falls behind the
/// up-to-date ones, even those it outranked, but stays ahead of new policies
#[test]
fn story_stale_acceptance_ranks_after_current_ones() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.destinations.insert(destination("ms1", "c1", "mesh1"));
    for name in ["tp-a", "tp-b"] {
        let mut tp = traffic_policy(name, retries());
        tp.metadata.generation = Some(1);
        s.traffic_policies.insert(tp);
    }

    let translator = ScriptedTranslator::default();
    Applier::new(&translator).apply(&mut s);
    assert_eq!(traffic_approval(&s, "tp-a", "ms1"), ApprovalStatus::accepted(0));
    assert_eq!(traffic_approval(&s, "tp-b", "ms1"), ApprovalStatus::accepted(1));

    s.traffic_policies.find_mut(&id("tp-a")).unwrap().metadata.generation = Some(2);
    s.traffic_policies.insert(traffic_policy("tp-0", retries()));
    Applier::new(&translator).apply(&mut s);

    assert_eq!(traffic_approval(&s, "tp-b", "ms1"), ApprovalStatus::accepted(0));
    assert_eq!(traffic_approval(&s, "tp-a", "ms1"), ApprovalStatus::accepted(1));
    assert_eq!(traffic_approval(&s, "tp-0", "ms1"), ApprovalStatus::accepted(2));
    assert_eq!(applied_traffic(&s, "ms1"), vec!["tp-b", "tp-a", "tp-0"]);
    let tp_a = s.traffic_policies.find(&id("tp-a")).unwrap();
    assert_eq!(tp_a.status.as_ref().unwrap().observed_generation, 2);

    // once re-accepted at the new generation, the ranking holds
    Applier::new(&translator).apply(&mut s);
    assert_eq!(traffic_approval(&s, "tp-b", "ms1"), ApprovalStatus::accepted(0));
    assert_eq!(traffic_approval(&s, "tp-a", "ms1"), ApprovalStatus::accepted(1));
    assert_eq!(traffic_approval(&s, "tp-0", "ms1"), ApprovalStatus::accepted(2));
}

#[test]
fn test_passes_are_idempotent() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.destinations.insert(destination("ms1", "c1", "mesh1"));
    s.traffic_policies.insert(traffic_policy("tp1", retries()));
    s.virtual_meshes.insert(virtual_mesh("vm", &["mesh1"], ApprovalState::Pending));
    let translator = Translator::with_default_decorators("trellis");

    let first = run_pass(&mut s, &translator, Uuid::new_v4());
    let after_first = s.clone();
    let second = run_pass(&mut s, &translator, Uuid::new_v4());

    let json = |o: &OutputSnapshot| -> Vec<serde_json::Value> {
        o.rendered().unwrap().into_iter().map(|r| r.json).collect()
    };
    assert_eq!(json(&first.outputs), json(&second.outputs));
    assert_eq!(first.summary, second.summary);
    for (a, b) in after_first.traffic_policies.iter().zip(s.traffic_policies.iter()) {
        assert_eq!(a.status, b.status);
    }
    for (a, b) in after_first.destinations.iter().zip(s.destinations.iter()) {
        assert_eq!(a.status, b.status);
    }
    for (a, b) in after_first.virtual_meshes.iter().zip(s.virtual_meshes.iter()) {
        assert_eq!(a.status, b.status);
    }
}

#[test]
fn test_virtual_mesh_with_missing_mesh_is_invalid() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.virtual_meshes.insert(virtual_mesh("vm", &["mesh1", "gone"], ApprovalState::Accepted));

    let translator = ScriptedTranslator::default();
    Applier::new(&translator).apply(&mut s);

    let status = s.virtual_meshes.find(&id("vm")).unwrap().status.clone().unwrap();
    assert_eq!(status.state, ApprovalState::Invalid);
    assert_eq!(status.errors, ["Mesh gone.trellis-system. not found"]);
    assert_eq!(status.meshes[&id("mesh1").key()].state, ApprovalState::Invalid);
    assert!(s.meshes.find(&id("mesh1")).unwrap().applied_virtual_mesh().is_none());
}

#[test]
fn story_failover_service_validation_flows_into_status() {
    let mut s = InputSnapshot::default();
    s.meshes.insert(istio_mesh("mesh1", "c1"));
    s.destinations.insert(destination("reviews", "c1", "mesh1"));
    s.failover_services.insert(failover_service("bad", "Reviews"));
    s.failover_services.insert(failover_service("good", "reviews.global"));

    let translator = Translator::with_default_decorators("trellis");
    let outcome = run_pass(&mut s, &translator, Uuid::new_v4());

    let bad = s.failover_services.find(&id("bad")).unwrap().status.clone().unwrap();
    assert_eq!(bad.state, ApprovalState::Invalid);
    assert_eq!(
        bad.validation_errors,
        ["invalid hostname: \"Reviews\" is not a valid DNS name"]
    );

    let good = s.failover_services.find(&id("good")).unwrap().status.clone().unwrap();
    assert_eq!(good.state, ApprovalState::Accepted);
    assert_eq!(good.meshes[&id("mesh1").key()], ApprovalStatus::accepted(0));

    let applied: Vec<_> = s
        .meshes
        .find(&id("mesh1"))
        .unwrap()
        .applied_failover_services()
        .iter()
        .map(|fs| fs.reference.name.clone())
        .collect();
    assert_eq!(applied, vec!["good"]);
    assert_eq!(outcome.outputs.istio.service_entries.len(), 1);
}
