//! End-to-end exercises of the classify/plan/report pipeline against the
//! concrete scenarios described for the reconcile algorithm, without a
//! live cluster or cloud API (those phases are the only ones that need
//! either, and are covered by their own driver-level unit tests).

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use ip_address_controller::cluster_view::ClusterSnapshot;
use ip_address_controller::crd::{CloudDescriptor, CloudProvider, NetIPAllocationSpec, WorkloadKind, WorkloadRef};
use ip_address_controller::reconciler::{classify, plan, report, IpLocation, PlannedAction};

fn node(name: &str, zone: &str, unschedulable: bool, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(format!("gce://proj/{zone}/{name}")),
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn running_pod(name: &str, namespace: &str, node_name: &str, owner_kind: &str, owner_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![OwnerReference {
                kind: owner_kind.to_string(),
                name: owner_name.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

fn pool_spec(reserved: &[&str], workload: Option<WorkloadRef>) -> NetIPAllocationSpec {
    NetIPAllocationSpec {
        reserved_ips: reserved.iter().map(|s| s.to_string()).collect(),
        workload_ref: workload,
        deployment_ref: None,
        node_selector: BTreeMap::new(),
        cloud: CloudDescriptor {
            provider: CloudProvider::Gcp,
            region: None,
            zones: vec![],
        },
        reconcile_interval_seconds: 30,
    }
}

/// A node holding a reserved IP gets cordoned while its workload pod has
/// already drained. The IP should move to the other eligible node within
/// one planning pass, and the resulting status should already report the
/// pool as healthy once that plan is applied.
#[test]
fn cordoned_node_without_pods_releases_ip_to_sibling_node() {
    let workload = WorkloadRef {
        kind: WorkloadKind::Deployment,
        name: "edge-proxy".to_string(),
        namespace: "prod".to_string(),
    };
    let spec = pool_spec(&["34.1.1.1"], Some(workload.clone()));

    let n1 = node("n1", "us-central1-a", true, &[("ip.ready", "true")]);
    let n2 = node("n2", "us-central1-a", false, &[]);
    let snapshot = ClusterSnapshot::from_parts(vec![n1, n2], vec![]);
    let eligible = snapshot.list_eligible_nodes(&spec.node_selector);

    let mut location = HashMap::new();
    location.insert("34.1.1.1".to_string(), "n1".to_string());
    let states = classify(&spec.reserved_ips, &eligible, &location);
    assert_eq!(states[0].location, IpLocation::BoundDraining { node: "n1".to_string() });

    let actions = plan(&spec, &states, &snapshot, &eligible);
    assert_eq!(
        actions,
        vec![
            PlannedAction::Detach { ip: "34.1.1.1".to_string(), node: "n1".to_string() },
            PlannedAction::Unlabel { node: "n1".to_string() },
            PlannedAction::Attach { ip: "34.1.1.1".to_string(), node: "n2".to_string() },
            PlannedAction::Label { node: "n2".to_string() },
        ]
    );

    // Simulate all planned actions succeeding and re-report.
    let outcomes: Vec<_> = actions.into_iter().map(|a| (a, Ok(()))).collect();
    let status = report(&spec, &states, &outcomes, Some(1), "2026-07-26T00:00:00Z");
    assert_eq!(status.healthy, Some(true));
    assert_eq!(status.attached, Some(1));
    assert_eq!(status.unattached, Some(0));
}

/// A cordoned node still running the pool's workload keeps its IP — no
/// detach is planned while a running pod remains.
#[test]
fn cordoned_node_with_running_pod_keeps_its_ip() {
    let workload = WorkloadRef {
        kind: WorkloadKind::Deployment,
        name: "edge-proxy".to_string(),
        namespace: "prod".to_string(),
    };
    let spec = pool_spec(&["34.1.1.1"], Some(workload));

    let n1 = node("n1", "us-central1-a", true, &[("ip.ready", "true")]);
    let pod = running_pod("edge-proxy-abc-xyz", "prod", "n1", "ReplicaSet", "edge-proxy-abc");
    let snapshot = ClusterSnapshot::from_parts(vec![n1], vec![pod]);
    let eligible = snapshot.list_eligible_nodes(&spec.node_selector);

    let mut location = HashMap::new();
    location.insert("34.1.1.1".to_string(), "n1".to_string());
    let states = classify(&spec.reserved_ips, &eligible, &location);

    let actions = plan(&spec, &states, &snapshot, &eligible);
    assert!(actions.is_empty());

    let status = report(&spec, &states, &[], Some(1), "2026-07-26T00:00:00Z");
    // The IP is still draining (cordoned node) so the pool isn't healthy
    // yet, even though no action could be taken this tick.
    assert_eq!(status.healthy, Some(false));
    assert_eq!(status.attached, Some(0));
}

/// A multi-IP pool with more reserved IPs than free eligible nodes: the
/// extra IP stays unattached and the pool is reported unhealthy, without
/// the Reconciler panicking or double-assigning a node.
#[test]
fn pool_reports_unhealthy_when_it_has_more_ips_than_free_nodes() {
    let spec = pool_spec(&["203.0.113.1", "203.0.113.2"], None);

    let n1 = node("n1", "us-central1-a", false, &[("ip.ready", "true")]);
    let snapshot = ClusterSnapshot::from_parts(vec![n1], vec![]);
    let eligible = snapshot.list_eligible_nodes(&spec.node_selector);

    let mut location = HashMap::new();
    location.insert("203.0.113.1".to_string(), "n1".to_string());
    let states = classify(&spec.reserved_ips, &eligible, &location);

    let actions = plan(&spec, &states, &snapshot, &eligible);
    assert!(actions.is_empty());

    let status = report(&spec, &states, &[], Some(2), "2026-07-26T00:00:00Z");
    assert_eq!(status.healthy, Some(false));
    assert_eq!(status.attached, Some(1));
    assert_eq!(status.unattached, Some(1));
}

/// Zone-preference ordering: when a pool names preferred zones, a free
/// node in a preferred zone wins attachment over a free node outside it,
/// even when the out-of-zone node sorts first alphabetically.
#[test]
fn attach_prefers_node_in_preferred_zone_over_alphabetically_earlier_node() {
    let mut spec = pool_spec(&["203.0.113.5"], None);
    spec.cloud.zones = vec!["us-central1-b".to_string()];

    let a_node = node("a-node", "us-central1-a", false, &[]);
    let b_node = node("b-node", "us-central1-b", false, &[]);
    let snapshot = ClusterSnapshot::from_parts(vec![a_node, b_node], vec![]);
    let eligible = snapshot.list_eligible_nodes(&spec.node_selector);

    let states = classify(&spec.reserved_ips, &eligible, &HashMap::new());
    let actions = plan(&spec, &states, &snapshot, &eligible);
    assert_eq!(
        actions,
        vec![
            PlannedAction::Attach { ip: "203.0.113.5".to_string(), node: "b-node".to_string() },
            PlannedAction::Label { node: "b-node".to_string() },
        ]
    );
}
