//! Read-through cache over `Node` and `Pod` objects, backed by
//! `kube_runtime`'s reflector/watcher pairing. The Reconciler calls
//! [`ClusterView::snapshot`] once per tick so a single tick always sees one
//! consistent view of the cluster, never a mix of states observed at
//! different instants.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::crd::{CloudProvider, WorkloadKind, WorkloadRef};

pub struct ClusterView {
    node_store: Store<Node>,
    pod_store: Store<Pod>,
}

pub struct ClusterViewHandles {
    pub node_watcher: JoinHandle<()>,
    pub pod_watcher: JoinHandle<()>,
}

impl ClusterView {
    /// Starts the background watchers and returns a handle that can be
    /// snapshotted immediately; callers should wait for `is_synced` before
    /// trusting the first snapshot.
    pub fn start(client: Client) -> (Self, ClusterViewHandles) {
        let nodes: Api<Node> = Api::all(client.clone());
        let (node_reader, node_writer) = reflector::store();
        let node_watcher = tokio::spawn(async move {
            let stream = watcher(nodes, watcher::Config::default())
                .default_backoff()
                .reflect(node_writer)
                .applied_objects();
            futures::pin_mut!(stream);
            loop {
                match stream.try_next().await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => warn!(error = %e, "node watch stream error"),
                }
            }
        });

        let pods: Api<Pod> = Api::all(client);
        let (pod_reader, pod_writer) = reflector::store();
        let pod_watcher = tokio::spawn(async move {
            let stream = watcher(pods, watcher::Config::default())
                .default_backoff()
                .reflect(pod_writer)
                .applied_objects();
            futures::pin_mut!(stream);
            loop {
                match stream.try_next().await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => warn!(error = %e, "pod watch stream error"),
                }
            }
        });

        (
            ClusterView {
                node_store: node_reader,
                pod_store: pod_reader,
            },
            ClusterViewHandles {
                node_watcher,
                pod_watcher,
            },
        )
    }

    pub fn is_synced(&self) -> bool {
        !self.node_store.state().is_empty() || !self.pod_store.state().is_empty()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: self.node_store.state(),
            pods: self.pod_store.state(),
        }
    }
}

pub struct ClusterSnapshot {
    nodes: Vec<Arc<Node>>,
    pods: Vec<Arc<Pod>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub name: String,
    pub provider_id: Option<String>,
    pub schedulable: bool,
    pub labels: BTreeMap<String, String>,
}

impl NodeView {
    fn from_node(node: &Node) -> Option<NodeView> {
        let name = node.metadata.name.clone()?;
        let schedulable = !node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        let provider_id = node.spec.as_ref().and_then(|s| s.provider_id.clone());
        let labels = node
            .metadata
            .labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        Some(NodeView {
            name,
            provider_id,
            schedulable,
            labels,
        })
    }
}

fn selector_matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|lv| lv == v).unwrap_or(false))
}

pub(crate) fn node_ip_ready(node: &NodeView) -> bool {
    node.labels
        .get("ip.ready")
        .map(|v| v == "true")
        .unwrap_or(false)
}

impl ClusterSnapshot {
    /// Builds a snapshot directly from object lists, bypassing the
    /// watcher/reflector pipeline. Used by tests and by the `list`/`check`
    /// CLI commands, which take a single point-in-time read rather than
    /// running a background watch.
    pub fn from_parts(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        ClusterSnapshot {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            pods: pods.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn empty_for_test() -> Self {
        ClusterSnapshot::from_parts(Vec::new(), Vec::new())
    }

    /// Nodes matching `selector`, sorted by name for deterministic
    /// planning. Schedulability and the
    /// `ip.ready=true` label are properties of an eligible node tracked by
    /// the Reconciler's classify/plan phases, not a precondition for
    /// eligibility itself — excluding unlabeled nodes here would make it
    /// impossible for the Reconciler to ever attach to a fresh node.
    pub fn list_eligible_nodes(&self, selector: &BTreeMap<String, String>) -> Vec<NodeView> {
        let mut views: Vec<NodeView> = self
            .nodes
            .iter()
            .filter_map(|n| NodeView::from_node(n))
            .filter(|n| selector_matches(&n.labels, selector))
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    pub fn get_node(&self, name: &str) -> Option<NodeView> {
        self.nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .and_then(|n| NodeView::from_node(n))
    }

    /// All live pods whose owner chain resolves to `workload_ref`, restricted
    /// to pods scheduled on `node_name`.
    pub fn pods_on_node_for_workload(&self, node_name: &str, workload_ref: &WorkloadRef) -> Vec<String> {
        self.pods
            .iter()
            .filter(|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    == Some(node_name)
            })
            .filter(|p| is_running(p))
            .filter(|p| resolve_owner_offline(p).as_ref() == Some(workload_ref))
            .filter_map(|p| p.metadata.name.clone())
            .collect()
    }

    /// Non-system pods currently scheduled on `node_name`, as
    /// (namespace, name) pairs. Used by the Reconciler's misconfigured-node
    /// eviction path for misconfigured nodes — system namespaces are
    /// excluded so the controller never evicts cluster-critical daemons.
    pub fn pods_on_node(&self, node_name: &str) -> Vec<(String, String)> {
        self.pods
            .iter()
            .filter(|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    == Some(node_name)
            })
            .filter(|p| {
                let ns = p.metadata.namespace.as_deref().unwrap_or_default();
                !SYSTEM_NAMESPACES.contains(&ns)
            })
            .filter_map(|p| {
                let ns = p.metadata.namespace.clone().unwrap_or_default();
                p.metadata.name.clone().map(|name| (ns, name))
            })
            .collect()
    }
}

const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Running")
        .unwrap_or(false)
}

/// Walks a pod's `ownerReferences` to find its controlling workload,
/// without any API calls (ReplicaSet names are stripped of their
/// generated hash suffix rather than resolved via the API). Reused from
/// the pod-owner resolution logic this controller's ancestry already used
/// for policy enforcement, applied here to decide which pods belong to a
/// pool's `workloadRef`.
pub fn resolve_owner_offline(pod: &Pod) -> Option<WorkloadRef> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let owners = pod.metadata.owner_references.as_ref()?;
    for owner in owners {
        match owner.kind.as_str() {
            "Deployment" => {
                return Some(WorkloadRef {
                    kind: WorkloadKind::Deployment,
                    name: owner.name.clone(),
                    namespace,
                });
            }
            "StatefulSet" => {
                return Some(WorkloadRef {
                    kind: WorkloadKind::StatefulSet,
                    name: owner.name.clone(),
                    namespace,
                });
            }
            "DaemonSet" => {
                return Some(WorkloadRef {
                    kind: WorkloadKind::DaemonSet,
                    name: owner.name.clone(),
                    namespace,
                });
            }
            "ReplicaSet" => {
                return Some(WorkloadRef {
                    kind: WorkloadKind::Deployment,
                    name: strip_replicaset_hash(&owner.name),
                    namespace,
                });
            }
            _ => continue,
        }
    }
    None
}

fn strip_replicaset_hash(name: &str) -> String {
    match name.rfind('-') {
        Some(idx) => name[..idx].to_string(),
        None => name.to_string(),
    }
}

/// Returns the provider the instance identity on this node implies, purely
/// from its `providerID` scheme prefix, for diagnostics/CLI use.
pub fn guess_provider(node: &NodeView) -> Option<CloudProvider> {
    let id = node.provider_id.as_deref()?;
    if id.starts_with("gce://") {
        Some(CloudProvider::Gcp)
    } else if id.starts_with("aws://") {
        Some(CloudProvider::Aws)
    } else if id.starts_with("azure://") {
        Some(CloudProvider::Azure)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, ObjectMeta};
    use k8s_openapi::api::core::v1::{NodeSpec, PodSpec};

    fn labeled_node(name: &str, labels: &[(&str, &str)], unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(format!("gce://proj/us-central1-a/{name}")),
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_view_reports_schedulable_by_default() {
        let node = labeled_node("a", &[("ip.ready", "true")], false);
        let view = NodeView::from_node(&node).unwrap();
        assert!(view.schedulable);
    }

    #[test]
    fn node_view_reports_cordoned() {
        let node = labeled_node("a", &[("ip.ready", "true")], true);
        let view = NodeView::from_node(&node).unwrap();
        assert!(!view.schedulable);
    }

    #[test]
    fn selector_matches_requires_all_keys() {
        let mut labels = BTreeMap::new();
        labels.insert("pool".to_string(), "edge".to_string());
        labels.insert("zone".to_string(), "a".to_string());
        let mut selector = BTreeMap::new();
        selector.insert("pool".to_string(), "edge".to_string());
        assert!(selector_matches(&labels, &selector));
        selector.insert("zone".to_string(), "b".to_string());
        assert!(!selector_matches(&labels, &selector));
    }

    #[test]
    fn empty_selector_matches_any_node() {
        let labels = BTreeMap::new();
        let selector = BTreeMap::new();
        assert!(selector_matches(&labels, &selector));
    }

    #[test]
    fn node_without_ip_ready_label_is_excluded_by_eligibility() {
        let node = labeled_node("a", &[], false);
        let view = NodeView::from_node(&node).unwrap();
        assert!(!node_ip_ready(&view));
    }

    #[test]
    fn resolve_owner_offline_strips_replicaset_hash() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("edge-proxy-abc123-xyz".to_string()),
                namespace: Some("prod".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".to_string(),
                    name: "edge-proxy-abc123".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        let owner = resolve_owner_offline(&pod).unwrap();
        assert_eq!(owner.name, "edge-proxy");
        assert_eq!(owner.kind, WorkloadKind::Deployment);
    }

    #[test]
    fn resolve_owner_offline_handles_daemonset_directly() {
        let pod = Pod {
            metadata: ObjectMeta {
                namespace: Some("kube-system".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "DaemonSet".to_string(),
                    name: "node-exporter".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        let owner = resolve_owner_offline(&pod).unwrap();
        assert_eq!(owner.kind, WorkloadKind::DaemonSet);
        assert_eq!(owner.name, "node-exporter");
    }

    #[test]
    fn resolve_owner_offline_none_without_owner_refs() {
        let pod = Pod::default();
        assert!(resolve_owner_offline(&pod).is_none());
    }

    #[test]
    fn guess_provider_from_gce_provider_id() {
        let node = labeled_node("a", &[], false);
        let view = NodeView::from_node(&node).unwrap();
        assert_eq!(guess_provider(&view), Some(CloudProvider::Gcp));
    }

    #[test]
    fn list_eligible_nodes_includes_unlabeled_nodes() {
        let node = labeled_node("a", &[("role", "pub")], false);
        let snapshot = ClusterSnapshot::from_parts(vec![node], vec![]);
        let mut selector = BTreeMap::new();
        selector.insert("role".to_string(), "pub".to_string());
        let eligible = snapshot.list_eligible_nodes(&selector);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "a");
    }

    #[test]
    fn list_eligible_nodes_excludes_selector_mismatch() {
        let node = labeled_node("a", &[("role", "internal")], false);
        let snapshot = ClusterSnapshot::from_parts(vec![node], vec![]);
        let mut selector = BTreeMap::new();
        selector.insert("role".to_string(), "pub".to_string());
        assert!(snapshot.list_eligible_nodes(&selector).is_empty());
    }

    fn scheduled_pod(name: &str, namespace: &str, node_name: &str, phase: &str, owner_kind: &str, owner_name: &str) -> Pod {
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
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn pods_on_node_for_workload_excludes_non_running_pods() {
        let pod = scheduled_pod("edge-proxy-abc-xyz", "prod", "a", "Pending", "ReplicaSet", "edge-proxy-abc");
        let snapshot = ClusterSnapshot::from_parts(vec![], vec![pod]);
        let workload = WorkloadRef {
            kind: WorkloadKind::Deployment,
            name: "edge-proxy".to_string(),
            namespace: "prod".to_string(),
        };
        assert!(snapshot.pods_on_node_for_workload("a", &workload).is_empty());
    }

    #[test]
    fn pods_on_node_for_workload_includes_running_matching_pods() {
        let pod = scheduled_pod("edge-proxy-abc-xyz", "prod", "a", "Running", "ReplicaSet", "edge-proxy-abc");
        let snapshot = ClusterSnapshot::from_parts(vec![], vec![pod]);
        let workload = WorkloadRef {
            kind: WorkloadKind::Deployment,
            name: "edge-proxy".to_string(),
            namespace: "prod".to_string(),
        };
        assert_eq!(snapshot.pods_on_node_for_workload("a", &workload), vec!["edge-proxy-abc-xyz".to_string()]);
    }

    #[test]
    fn pods_on_node_excludes_system_namespaces() {
        let pod = scheduled_pod("node-exporter-xyz", "kube-system", "a", "Running", "DaemonSet", "node-exporter");
        let snapshot = ClusterSnapshot::from_parts(vec![], vec![pod]);
        assert!(snapshot.pods_on_node("a").is_empty());
    }

    #[test]
    fn pods_on_node_includes_non_system_pods() {
        let pod = scheduled_pod("stray-abc", "prod", "a", "Running", "ReplicaSet", "stray-abc");
        let snapshot = ClusterSnapshot::from_parts(vec![], vec![pod]);
        assert_eq!(snapshot.pods_on_node("a"), vec![("prod".to_string(), "stray-abc".to_string())]);
    }
}
