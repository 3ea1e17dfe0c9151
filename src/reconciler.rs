//! The five-phase reconcile algorithm: Discover, Classify, Plan, Actuate,
//! Report. Each phase is a separate function so it can be tested without a
//! live cluster or cloud API; only [`discover`] and [`actuate`] need a
//! [`Client`]/[`CloudDriver`] at all.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tracing::{info, warn};

use crate::cloud::{parse_provider_id, CloudDriver, CloudError, InstanceRef};
use crate::cluster_view::{node_ip_ready, ClusterSnapshot, NodeView};
use crate::crd::{CloudProvider, NetIPAllocationSpec, NetIPAllocationStatus, SpecError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid pool spec: {0}")]
    InvalidSpec(#[from] SpecError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

impl ReconcileError {
    /// Classification used for metrics/backoff.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::InvalidSpec(_) => "invalid_spec",
            ReconcileError::Cloud(CloudError::Transient(_)) => "transient",
            ReconcileError::Cloud(CloudError::Auth(_)) => "auth",
            ReconcileError::Cloud(
                CloudError::NotFound(_)
                | CloudError::AlreadyAttached
                | CloudError::InUseElsewhere(_)
                | CloudError::NotAttached,
            ) => "conflict",
            ReconcileError::Kube(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpLocation {
    /// Bound to a schedulable eligible node: steady state.
    BoundHealthy { node: String },
    /// Bound to a node that has since been cordoned: must drain and move.
    BoundDraining { node: String },
    /// Not currently bound to any eligible node.
    Unbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpState {
    pub ip: String,
    pub location: IpLocation,
}

/// Phase 1. Queries the cloud driver for the IPs currently bound to each
/// eligible node's instance and returns a map of reserved IP -> node name,
/// for every reserved IP found bound somewhere among those nodes.
pub async fn discover(
    reserved_ips: &[String],
    eligible_nodes: &[NodeView],
    provider: CloudProvider,
    driver: &CloudDriver,
) -> Result<HashMap<String, String>, ReconcileError> {
    let reserved: HashSet<&str> = reserved_ips.iter().map(String::as_str).collect();
    let mut location = HashMap::new();
    for node in eligible_nodes {
        let Some(provider_id) = node.provider_id.as_deref() else {
            warn!(node = %node.name, "node has no providerID, skipping in discover");
            continue;
        };
        let instance = match parse_provider_id(provider, provider_id) {
            Ok(i) => i,
            Err(e) => {
                warn!(node = %node.name, error = %e, "could not parse providerID, skipping");
                continue;
            }
        };
        let bound = driver.get_external_ips(&instance).await?;
        for ip in bound.into_iter().filter(|ip| reserved.contains(ip.as_str())) {
            location.insert(ip, node.name.clone());
        }
    }
    Ok(location)
}

/// Phase 2. Combines discovery output with node schedulability to produce
/// one [`IpState`] per reserved IP, sorted by IP for deterministic
/// downstream planning.
pub fn classify(
    reserved_ips: &[String],
    eligible_nodes: &[NodeView],
    location: &HashMap<String, String>,
) -> Vec<IpState> {
    let schedulable: HashMap<&str, bool> = eligible_nodes
        .iter()
        .map(|n| (n.name.as_str(), n.schedulable))
        .collect();

    let mut states: Vec<IpState> = reserved_ips
        .iter()
        .map(|ip| {
            let loc = match location.get(ip) {
                Some(node) if schedulable.get(node.as_str()).copied().unwrap_or(false) => {
                    IpLocation::BoundHealthy { node: node.clone() }
                }
                Some(node) => IpLocation::BoundDraining { node: node.clone() },
                None => IpLocation::Unbound,
            };
            IpState {
                ip: ip.clone(),
                location: loc,
            }
        })
        .collect();
    states.sort_by(|a, b| a.ip.cmp(&b.ip));
    states
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Evict { namespace: String, pod: String },
    Detach { ip: String, node: String },
    Attach { ip: String, node: String },
    Label { node: String },
    Unlabel { node: String },
}

fn node_zone(node: &NodeView, provider: CloudProvider) -> Option<String> {
    let provider_id = node.provider_id.as_deref()?;
    parse_provider_id(provider, provider_id).ok()?.zone
}

/// Phase 3. Pure function: never calls the cloud API or Kubernetes API.
///
/// Action groups are emitted in this fixed order:
/// 1. misconfigured-node eviction + stale-label cleanup,
/// 2. `Detach`+`Unlabel` for drainable cordoned-bound nodes (pod-holding
///    cordoned-bound nodes get no action at all — the IP is retained),
/// 3. `Attach`+`Label` for unattached IPs, where the unattached set includes
///    both originally-unbound IPs and IPs freed by step 2's detaches, and
/// 4. self-heal `Label` for any healthy-bound node still missing the label.
/// Detaches strictly precede attaches; within a group actions are ordered
/// by (node, ip) ascending so the plan is deterministic across ticks.
pub fn plan(
    spec: &NetIPAllocationSpec,
    states: &[IpState],
    snapshot: &ClusterSnapshot,
    eligible_nodes: &[NodeView],
) -> Vec<PlannedAction> {
    let workload_ref = spec.effective_workload_ref();
    let mut evictions = Vec::new();
    let mut drains = Vec::new();
    let mut attaches = Vec::new();
    let mut selfheal = Vec::new();

    let mut occupied: HashSet<String> = states
        .iter()
        .filter_map(|s| match &s.location {
            IpLocation::BoundHealthy { node } => Some(node.clone()),
            _ => None,
        })
        .collect();

    // Step 1: misconfigured nodes — schedulable, carry `ip.ready=true`, but
    // this tick's discovery found no reserved IP bound to them (a stale
    // pointer left by a previous tick or an operator mistake).
    let bound_nodes: HashSet<&str> = states
        .iter()
        .filter_map(|s| match &s.location {
            IpLocation::BoundHealthy { node } | IpLocation::BoundDraining { node } => Some(node.as_str()),
            IpLocation::Unbound => None,
        })
        .collect();
    let mut stale: Vec<&NodeView> = eligible_nodes
        .iter()
        .filter(|n| n.schedulable && node_ip_ready(n) && !bound_nodes.contains(n.name.as_str()))
        .collect();
    stale.sort_by(|a, b| a.name.cmp(&b.name));
    for node in stale {
        let mut pods = snapshot.pods_on_node(&node.name);
        pods.sort();
        for (namespace, pod) in pods {
            evictions.push(PlannedAction::Evict { namespace, pod });
        }
        evictions.push(PlannedAction::Unlabel { node: node.name.clone() });
    }

    // Step 2: drainable vs pod-holding cordoned-bound nodes.
    let mut drainable: Vec<&IpState> = Vec::new();
    for state in states {
        if let IpLocation::BoundDraining { node } = &state.location {
            let remaining_pods = workload_ref
                .as_ref()
                .map(|w| snapshot.pods_on_node_for_workload(node, w))
                .unwrap_or_default();
            if remaining_pods.is_empty() {
                drainable.push(state);
            }
            // pod-holding: no action, the IP is retained until the workload leaves.
        }
    }
    drainable.sort_by(|a, b| {
        let node_a = node_of(a);
        let node_b = node_of(b);
        node_a.cmp(node_b).then(a.ip.cmp(&b.ip))
    });
    for state in &drainable {
        let node = node_of(state).to_string();
        drains.push(PlannedAction::Detach {
            ip: state.ip.clone(),
            node: node.clone(),
        });
        drains.push(PlannedAction::Unlabel { node });
    }

    // Step 3/4: unattached IPs = originally-unbound + just-detached.
    let mut unbound: Vec<&IpState> = states
        .iter()
        .filter(|s| matches!(s.location, IpLocation::Unbound))
        .collect();
    unbound.extend(drainable.iter().copied());
    unbound.sort_by(|a, b| a.ip.cmp(&b.ip));

    if !unbound.is_empty() {
        let mut candidates: Vec<&NodeView> = eligible_nodes
            .iter()
            .filter(|n| n.schedulable && !occupied.contains(&n.name))
            .collect();
        candidates.sort_by(|a, b| {
            let a_zone_pref = node_matches_preferred_zone(a, &spec.cloud.zones, spec.cloud.provider);
            let b_zone_pref = node_matches_preferred_zone(b, &spec.cloud.zones, spec.cloud.provider);
            b_zone_pref.cmp(&a_zone_pref).then(a.name.cmp(&b.name))
        });

        let mut candidates = candidates.into_iter();
        for state in unbound {
            if let Some(node) = candidates.next() {
                occupied.insert(node.name.clone());
                attaches.push(PlannedAction::Attach {
                    ip: state.ip.clone(),
                    node: node.name.clone(),
                });
                attaches.push(PlannedAction::Label { node: node.name.clone() });
            } else {
                warn!(ip = %state.ip, "no free eligible node available to attach this tick");
            }
        }
    }

    // Step 5/6: self-heal — a healthy-bound node that somehow lost its label.
    let mut unlabeled_bound: Vec<&str> = states
        .iter()
        .filter_map(|s| match &s.location {
            IpLocation::BoundHealthy { node } => Some(node.as_str()),
            _ => None,
        })
        .filter(|name| {
            eligible_nodes
                .iter()
                .find(|n| n.name == *name)
                .map(|n| !node_ip_ready(n))
                .unwrap_or(false)
        })
        .collect();
    unlabeled_bound.sort();
    unlabeled_bound.dedup();
    for name in unlabeled_bound {
        selfheal.push(PlannedAction::Label { node: name.to_string() });
    }

    evictions
        .into_iter()
        .chain(drains)
        .chain(attaches)
        .chain(selfheal)
        .collect()
}

fn node_of(state: &IpState) -> &str {
    match &state.location {
        IpLocation::BoundDraining { node } | IpLocation::BoundHealthy { node } => node.as_str(),
        IpLocation::Unbound => "",
    }
}

fn node_matches_preferred_zone(node: &NodeView, zones: &[String], provider: CloudProvider) -> bool {
    if zones.is_empty() {
        return true;
    }
    match node_zone(node, provider) {
        Some(z) => zones.iter().any(|pz| pz == &z),
        None => false,
    }
}

/// Phase 4. Executes planned actions in order. An `Attach`/`Detach`
/// failure aborts the remainder of the plan;
/// `Label`/`Unlabel`/`Evict` failures are logged and counted but never
/// abort the tick.
pub async fn actuate(
    actions: &[PlannedAction],
    client: &Client,
    driver: &CloudDriver,
    nodes: &[NodeView],
    provider: CloudProvider,
) -> Vec<(PlannedAction, Result<(), ReconcileError>)> {
    let mut results = Vec::with_capacity(actions.len());
    for action in actions {
        let outcome = actuate_one(action, client, driver, nodes, provider).await;
        match &outcome {
            Ok(()) => info!(?action, "action applied"),
            Err(e) => warn!(?action, error = %e, "action failed"),
        }
        let abort_worthy = outcome.is_err() && matches!(action, PlannedAction::Attach { .. } | PlannedAction::Detach { .. });
        results.push((action.clone(), outcome));
        if abort_worthy {
            warn!("aborting remainder of plan after attach/detach failure");
            break;
        }
    }
    results
}

async fn actuate_one(
    action: &PlannedAction,
    client: &Client,
    driver: &CloudDriver,
    nodes: &[NodeView],
    provider: CloudProvider,
) -> Result<(), ReconcileError> {
    match action {
        PlannedAction::Evict { namespace, pod } => {
            let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
            match api.delete(pod, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        PlannedAction::Detach { ip, node } => {
            let instance = instance_ref_for(node, nodes, provider)?;
            match driver.detach_ip(&instance, ip).await {
                Ok(()) | Err(CloudError::NotAttached) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        PlannedAction::Attach { ip, node } => {
            let instance = instance_ref_for(node, nodes, provider)?;
            match driver.attach_ip(&instance, ip).await {
                Ok(()) | Err(CloudError::AlreadyAttached) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        PlannedAction::Label { node } => set_ip_ready_label(client, node, true).await,
        PlannedAction::Unlabel { node } => set_ip_ready_label(client, node, false).await,
    }
}

/// Patches the `ip.ready` label on `node`. Setting it to `null` in a JSON
/// merge patch removes the key entirely (RFC 7396), so `Unlabel` leaves no
/// `ip.ready=false` residue behind — the label is present (`true`) or
/// absent, never any other value.
async fn set_ip_ready_label(client: &Client, node: &str, ready: bool) -> Result<(), ReconcileError> {
    let api: Api<Node> = Api::all(client.clone());
    let label_value = if ready {
        serde_json::Value::String("true".to_string())
    } else {
        serde_json::Value::Null
    };
    let patch = serde_json::json!({
        "metadata": {
            "labels": {
                "ip.ready": label_value,
            }
        }
    });
    match api
        .patch(node, &PatchParams::apply("ip-address-controller"), &Patch::Merge(patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn instance_ref_for(
    node_name: &str,
    nodes: &[NodeView],
    provider: CloudProvider,
) -> Result<InstanceRef, ReconcileError> {
    let node = nodes
        .iter()
        .find(|n| n.name == node_name)
        .ok_or_else(|| ReconcileError::Cloud(CloudError::NotFound(node_name.to_string())))?;
    let provider_id = node
        .provider_id
        .as_deref()
        .ok_or_else(|| ReconcileError::Cloud(CloudError::NotFound(node_name.to_string())))?;
    Ok(parse_provider_id(provider, provider_id)?)
}

/// Phase 5. Builds the status the Controller Runtime will patch onto the
/// `NetIPAllocation` object, from the pre-actuation classification plus
/// which actions actually succeeded.
pub fn report(
    spec: &NetIPAllocationSpec,
    states: &[IpState],
    outcomes: &[(PlannedAction, Result<(), ReconcileError>)],
    observed_generation: Option<i64>,
    now: &str,
) -> NetIPAllocationStatus {
    let mut attached = states
        .iter()
        .filter(|s| matches!(s.location, IpLocation::BoundHealthy { .. }))
        .count();
    let mut draining = states
        .iter()
        .filter(|s| matches!(s.location, IpLocation::BoundDraining { .. }))
        .count();

    for (action, result) in outcomes {
        if result.is_err() {
            continue;
        }
        match action {
            PlannedAction::Attach { .. } => attached += 1,
            PlannedAction::Detach { .. } => draining = draining.saturating_sub(1),
            PlannedAction::Evict { .. } | PlannedAction::Label { .. } | PlannedAction::Unlabel { .. } => {}
        }
    }

    let reserved = spec.reserved_ips.len();
    let unattached = reserved.saturating_sub(attached);
    let any_action_failed = outcomes.iter().any(|(_, r)| r.is_err());
    // Healthy iff every reserved IP is attached at tick end.
    let healthy = unattached == 0;

    NetIPAllocationStatus {
        observed_generation,
        healthy: Some(healthy),
        reserved: Some(reserved as u32),
        attached: Some(attached as u32),
        unattached: Some(unattached as u32),
        last_reconciled: Some(now.to_string()),
        message: any_action_failed.then(|| "one or more actions failed this tick".to_string()),
    }
}
