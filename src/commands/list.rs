use anyhow::Context;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

use ip_address_controller::crd::NetIPAllocation;

pub async fn run(resource: String) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    match resource.as_str() {
        "pools" => list_pools(client).await,
        "nodes" => list_nodes(client).await,
        other => anyhow::bail!("Unsupported resource '{other}'. Supported: pools, nodes"),
    }
}

async fn list_pools(client: Client) -> anyhow::Result<()> {
    let pools: Api<NetIPAllocation> = Api::all(client);
    let pool_list = pools
        .list(&ListParams::default())
        .await
        .context("Failed to list NetIPAllocation pools. Check RBAC permissions.")?;

    let mut rows: Vec<(String, usize, i64, i64, bool)> = pool_list
        .iter()
        .map(|p| {
            let name = p.name_any();
            let reserved = p.spec.reserved_ips.len();
            let attached = p.status.as_ref().and_then(|s| s.attached).unwrap_or(0);
            let unattached = p.status.as_ref().and_then(|s| s.unattached).unwrap_or(0);
            let healthy = p.status.as_ref().and_then(|s| s.healthy).unwrap_or(false);
            (name, reserved, attached, unattached, healthy)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!("{:<30} {:<10} {:<10} {:<12} {:<8}", "NAME", "RESERVED", "ATTACHED", "UNATTACHED", "HEALTHY");
    println!("{}", "-".repeat(72));
    for (name, reserved, attached, unattached, healthy) in &rows {
        println!("{:<30} {:<10} {:<10} {:<12} {:<8}", name, reserved, attached, unattached, healthy);
    }
    println!("\nTotal: {} pools", rows.len());
    Ok(())
}

async fn list_nodes(client: Client) -> anyhow::Result<()> {
    let nodes: Api<Node> = Api::all(client);
    let node_list = nodes
        .list(&ListParams::default())
        .await
        .context("Failed to list nodes. Check RBAC permissions.")?;

    let mut rows: Vec<(String, bool, String, String)> = node_list
        .iter()
        .map(|n| {
            let name = n.name_any();
            let unschedulable = n.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
            let ip_ready = n
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("ip.ready"))
                .cloned()
                .unwrap_or_else(|| "-".to_string());
            let provider_id = n
                .spec
                .as_ref()
                .and_then(|s| s.provider_id.clone())
                .unwrap_or_else(|| "-".to_string());
            (name, unschedulable, ip_ready, provider_id)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!("{:<40} {:<14} {:<10} {:<50}", "NAME", "UNSCHEDULABLE", "IP.READY", "PROVIDER ID");
    println!("{}", "-".repeat(114));
    for (name, unschedulable, ip_ready, provider_id) in &rows {
        println!("{:<40} {:<14} {:<10} {:<50}", name, unschedulable, ip_ready, provider_id);
    }
    println!("\nTotal: {} nodes", rows.len());
    Ok(())
}
