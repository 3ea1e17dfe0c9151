use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::TryStreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ip_address_controller::cloud::CloudDriver;
use ip_address_controller::cluster_view::ClusterView;
use ip_address_controller::crd::{CloudProvider, NetIPAllocation};
use ip_address_controller::leader::{self, LeaderGateConfig};
use ip_address_controller::reconciler;
use ip_address_controller::reconciler::{IpLocation, PlannedAction};

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("netipallocation_reconcile_total", "Total reconcile ticks per pool"),
        &["pool"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("netipallocation_reconcile_errors_total", "Total reconcile errors per pool and kind"),
        &["pool", "kind"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static POOL_RESERVED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("netipallocation_reserved_ips", "Reserved IP count per pool"),
        &["pool"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static POOL_ATTACHED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("netipallocation_attached_ips", "Attached IP count per pool"),
        &["pool"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static POOL_HEALTHY: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("netipallocation_healthy", "1 if pool is fully attached and error-free"),
        &["pool"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static RECONCILE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new("netipallocation_reconcile_duration_seconds", "Reconcile tick duration per pool"),
        &["pool"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static IS_LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("netipallocation_is_leader", "1 if this replica currently holds the lease")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/// Per-IP gauge (spec.md §4.1 Phase 5): 1 while `ip` is bound to a
/// schedulable eligible node for `pool`, 0 otherwise (unbound or draining).
static IP_BOUND: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("netipallocation_ip_bound", "1 if this reserved IP is currently bound to a healthy node"),
        &["pool", "ip"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/// spec.md §8 scenario 3 names this metric directly:
/// `ip_attach_total{status="error"}`.
static IP_ATTACH_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("ip_attach_total", "Total Attach actions issued per pool/ip, by outcome"),
        &["pool", "ip", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static IP_DETACH_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("ip_detach_total", "Total Detach actions issued per pool/ip, by outcome"),
        &["pool", "ip", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/// Build-info gauge populated from the `CONTROLLER_VERSION`/`CLUSTER_NAME`
/// env vars named in spec.md §6, following the common `*_build_info{...} 1`
/// Prometheus idiom so either value can be sliced on in queries/dashboards
/// without a dedicated series per field.
static BUILD_INFO: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("netipallocation_build_info", "Always 1; labels carry build/deployment identity"),
        &["version", "cluster"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

struct RunState {
    cluster_synced: bool,
    is_leader: bool,
    leader_tick_completed: bool,
}

impl RunState {
    /// Per spec: ready once the cluster view has synced and, for leaders,
    /// after the first reconcile tick has completed. Non-leaders are ready
    /// as soon as the cluster view syncs.
    fn ready(&self) -> bool {
        self.cluster_synced && (!self.is_leader || self.leader_tick_completed)
    }
}

pub async fn run() -> Result<()> {
    println!("Starting NetIPAllocation controller...\n");

    let client = Client::try_default().await.context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&POOL_RESERVED);
    LazyLock::force(&POOL_ATTACHED);
    LazyLock::force(&POOL_HEALTHY);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&IS_LEADER);
    LazyLock::force(&IP_BOUND);
    LazyLock::force(&IP_ATTACH_TOTAL);
    LazyLock::force(&IP_DETACH_TOTAL);

    let controller_version = std::env::var("CONTROLLER_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
    let cluster_name = std::env::var("CLUSTER_NAME").unwrap_or_default();
    BUILD_INFO.with_label_values(&[&controller_version, &cluster_name]).set(1);

    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9999);
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));

    let run_state = Arc::new(Mutex::new(RunState {
        cluster_synced: false,
        is_leader: false,
        leader_tick_completed: false,
    }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = run_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move { start_http_server(http_state, http_shutdown, addr).await });

    let (cluster_view, view_handles) = ClusterView::start(client.clone());
    let cluster_view = Arc::new(cluster_view);

    tokio::spawn(wait_for_cluster_sync(cluster_view.clone(), run_state.clone()));

    let leader_rx = leader::start(client.clone(), LeaderGateConfig::default(), shutdown_tx.subscribe());
    tokio::spawn(watch_leader_metric(leader_rx.clone()));
    tokio::spawn(watch_leader_transitions(leader_rx.clone(), run_state.clone()));

    println!("  Metrics server .............. http://{addr}");
    println!("  Leader lease ................. {}", LeaderGateConfig::default().lease_name);
    println!("\nController running. Press Ctrl+C to stop.\n");
    info!("controller_started");

    let pools: Api<NetIPAllocation> = Api::all(client.clone());
    let mut tasks: HashMap<String, PoolTask> = HashMap::new();

    let watch_stream = watcher(pools, watcher::Config::default()).default_backoff();
    futures::pin_mut!(watch_stream);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
            next = watch_stream.try_next() => {
                match next {
                    Ok(Some(watcher::Event::Applied(pool))) => {
                        upsert_pool_task(&mut tasks, pool, &client, &cluster_view, &leader_rx, &run_state);
                    }
                    Ok(Some(watcher::Event::Deleted(pool))) => {
                        let name = pool.name_any();
                        remove_pool_task(&mut tasks, &name);
                        info!(pool = %name, "pool deleted, reconcile task stopped");
                    }
                    Ok(Some(watcher::Event::Restarted(pools))) => {
                        reconcile_task_set(&mut tasks, pools, &client, &cluster_view, &leader_rx, &run_state);
                    }
                    Ok(None) => {
                        warn!("pool watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "pool watch stream error");
                    }
                }
            }
        }
    }

    for (_, task) in tasks {
        task.handle.abort();
    }
    view_handles.node_watcher.abort();
    view_handles.pod_watcher.abort();
    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("controller_stopped");
    println!("Controller stopped.");
    Ok(())
}

async fn watch_leader_metric(mut rx: watch::Receiver<bool>) {
    loop {
        IS_LEADER.set(if *rx.borrow() { 1 } else { 0 });
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Polls the cluster view until its watches have delivered at least one
/// object (or the watch loop has had a chance to settle), then marks the
/// process ready-for-traffic on the non-leader path.
async fn wait_for_cluster_sync(cluster_view: Arc<ClusterView>, run_state: Arc<Mutex<RunState>>) {
    let mut interval = tokio::time::interval(Duration::from_millis(250));
    loop {
        interval.tick().await;
        if cluster_view.is_synced() {
            let mut s = run_state.lock().await;
            s.cluster_synced = true;
            break;
        }
    }
}

/// Tracks the leader edge so `/readyz` can require a completed tick after
/// each new acquisition rather than trusting a tick completed under a
/// previous, already-lost leadership term.
async fn watch_leader_transitions(mut rx: watch::Receiver<bool>, run_state: Arc<Mutex<RunState>>) {
    loop {
        let is_leader = *rx.borrow();
        {
            let mut s = run_state.lock().await;
            s.is_leader = is_leader;
            // Losing leadership invalidates any prior completed-tick claim;
            // the next acquisition must earn readiness again.
            if !is_leader {
                s.leader_tick_completed = false;
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

struct PoolTask {
    handle: JoinHandle<()>,
    generation: Option<i64>,
}

/// A pool's task only needs to restart when its spec actually changed.
/// `metadata.generation` only moves on a spec write, never on a status-only
/// patch, so this is immune to the watch event a pool's own `patch_status`
/// call produces every tick.
fn should_respawn(existing: Option<&PoolTask>, generation: Option<i64>) -> bool {
    match existing {
        None => true,
        Some(task) => task.generation != generation,
    }
}

fn upsert_pool_task(
    tasks: &mut HashMap<String, PoolTask>,
    pool: NetIPAllocation,
    client: &Client,
    cluster_view: &Arc<ClusterView>,
    leader_rx: &watch::Receiver<bool>,
    run_state: &Arc<Mutex<RunState>>,
) {
    let name = pool.name_any();
    let generation = pool.metadata.generation;
    if !should_respawn(tasks.get(&name), generation) {
        return;
    }
    if let Some(old) = tasks.remove(&name) {
        old.handle.abort();
    }
    let handle = spawn_pool_task(
        name.clone(),
        pool,
        client.clone(),
        cluster_view.clone(),
        leader_rx.clone(),
        run_state.clone(),
    );
    tasks.insert(name, PoolTask { handle, generation });
}

fn remove_pool_task(tasks: &mut HashMap<String, PoolTask>, name: &str) {
    if let Some(old) = tasks.remove(name) {
        old.handle.abort();
    }
}

/// Reconciles the full task set against a `Restarted` relist: spawns/updates
/// a task for every pool present and cancels any task for a pool that is no
/// longer in the list.
fn reconcile_task_set(
    tasks: &mut HashMap<String, PoolTask>,
    pools: Vec<NetIPAllocation>,
    client: &Client,
    cluster_view: &Arc<ClusterView>,
    leader_rx: &watch::Receiver<bool>,
    run_state: &Arc<Mutex<RunState>>,
) {
    let present: std::collections::HashSet<String> = pools.iter().map(|p| p.name_any()).collect();
    for pool in pools {
        upsert_pool_task(tasks, pool, client, cluster_view, leader_rx, run_state);
    }
    tasks.retain(|name, task| {
        if present.contains(name) {
            true
        } else {
            task.handle.abort();
            false
        }
    });
}

fn spawn_pool_task(
    name: String,
    pool: NetIPAllocation,
    client: Client,
    cluster_view: Arc<ClusterView>,
    mut leader_rx: watch::Receiver<bool>,
    run_state: Arc<Mutex<RunState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut spec = pool.spec.clone();
        if let Err(e) = spec.validate() {
            warn!(pool = %name, error = %e, "pool spec is invalid, not reconciling");
            RECONCILE_ERRORS.with_label_values(&[&name, "invalid_spec"]).inc();
            return;
        }

        let driver = match build_driver(spec.cloud.provider).await {
            Ok(d) => d,
            Err(e) => {
                warn!(pool = %name, error = %e, "could not build cloud driver for pool");
                return;
            }
        };

        let mut interval = tokio::time::interval(Duration::from_secs(spec.reconcile_interval_seconds));
        loop {
            interval.tick().await;
            if !*leader_rx.borrow() {
                continue;
            }
            let name = name.clone();
            let timer = RECONCILE_DURATION.with_label_values(&[&name]).start_timer();
            RECONCILE_TOTAL.with_label_values(&[&name]).inc();

            let snapshot = cluster_view.snapshot();
            let eligible = snapshot.list_eligible_nodes(&spec.node_selector);

            let outcome = run_one_tick(&spec, &snapshot, &eligible, &client, &driver, pool.metadata.generation).await;
            timer.observe_duration();

            match outcome {
                Ok((status, states, outcomes)) => {
                    POOL_RESERVED.with_label_values(&[&name]).set(status.reserved.unwrap_or(0) as i64);
                    POOL_ATTACHED.with_label_values(&[&name]).set(status.attached.unwrap_or(0) as i64);
                    POOL_HEALTHY
                        .with_label_values(&[&name])
                        .set(status.healthy.unwrap_or(false) as i64);

                    for state in &states {
                        let bound = matches!(state.location, IpLocation::BoundHealthy { .. });
                        IP_BOUND.with_label_values(&[&name, &state.ip]).set(bound as i64);
                    }
                    for (action, result) in &outcomes {
                        let status_label = if result.is_ok() { "ok" } else { "error" };
                        match action {
                            PlannedAction::Attach { ip, .. } => {
                                IP_ATTACH_TOTAL.with_label_values(&[&name, ip, status_label]).inc();
                            }
                            PlannedAction::Detach { ip, .. } => {
                                IP_DETACH_TOTAL.with_label_values(&[&name, ip, status_label]).inc();
                            }
                            PlannedAction::Evict { .. } | PlannedAction::Label { .. } | PlannedAction::Unlabel { .. } => {}
                        }
                    }

                    let pools: Api<NetIPAllocation> = Api::all(client.clone());
                    let patch = serde_json::json!({ "status": status });
                    if let Err(e) = pools
                        .patch_status(
                            &name,
                            &kube::api::PatchParams::apply("ip-address-controller"),
                            &kube::api::Patch::Merge(patch),
                        )
                        .await
                    {
                        warn!(pool = %name, error = %e, "failed to patch pool status");
                    }
                    run_state.lock().await.leader_tick_completed = true;
                }
                Err(e) => {
                    warn!(pool = %name, error = %e, "reconcile tick failed");
                    RECONCILE_ERRORS.with_label_values(&[&name, e.kind()]).inc();
                }
            }

            // re-select leadership promptly if it changes mid-interval
            if leader_rx.has_changed().unwrap_or(false) {
                let _ = leader_rx.changed().await;
            }
        }
    })
}

type TickOutcome = (
    ip_address_controller::crd::NetIPAllocationStatus,
    Vec<ip_address_controller::reconciler::IpState>,
    Vec<(PlannedAction, std::result::Result<(), reconciler::ReconcileError>)>,
);

async fn run_one_tick(
    spec: &ip_address_controller::crd::NetIPAllocationSpec,
    snapshot: &ip_address_controller::cluster_view::ClusterSnapshot,
    eligible: &[ip_address_controller::cluster_view::NodeView],
    client: &Client,
    driver: &CloudDriver,
    generation: Option<i64>,
) -> std::result::Result<TickOutcome, reconciler::ReconcileError> {
    spec.validate()?;
    let location = reconciler::discover(&spec.reserved_ips, eligible, spec.cloud.provider, driver).await?;
    let states = reconciler::classify(&spec.reserved_ips, eligible, &location);
    let actions = reconciler::plan(spec, &states, snapshot, eligible);
    let outcomes = reconciler::actuate(&actions, client, driver, eligible, spec.cloud.provider).await;
    let now = Utc::now().to_rfc3339();
    let status = reconciler::report(spec, &states, &outcomes, generation, &now);
    Ok((status, states, outcomes))
}

async fn build_driver(provider: CloudProvider) -> anyhow::Result<CloudDriver> {
    match provider {
        CloudProvider::Gcp => {
            let project = std::env::var("GCP_PROJECT").context("GCP_PROJECT must be set for gcp pools")?;
            Ok(CloudDriver::gcp(project))
        }
        CloudProvider::Aws => {
            let config = aws_config::load_from_env().await;
            Ok(CloudDriver::aws(aws_sdk_ec2::Client::new(&config)))
        }
        CloudProvider::Azure => {
            let subscription_id =
                std::env::var("AZURE_SUBSCRIPTION_ID").context("AZURE_SUBSCRIPTION_ID must be set for azure pools")?;
            let resource_group =
                std::env::var("AZURE_RESOURCE_GROUP").context("AZURE_RESOURCE_GROUP must be set for azure pools")?;
            Ok(CloudDriver::azure(subscription_id, resource_group))
        }
    }
}

pub(crate) fn build_router(state: Arc<Mutex<RunState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn start_http_server(state: Arc<Mutex<RunState>>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind http server")?;
    info!(addr = %addr, "http_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn ready_handler(state: Arc<Mutex<RunState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}
