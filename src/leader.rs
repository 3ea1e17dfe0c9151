//! Leader election against a `coordination.v1/Lease`, exposed as an
//! edge-triggered `watch::Receiver<bool>` the Controller Runtime can react
//! to (`false -> true` = acquired, `true -> false` = lost) rather than a
//! blocking acquire call.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct LeaderGateConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i64,
    pub identity: String,
}

impl Default for LeaderGateConfig {
    fn default() -> Self {
        LeaderGateConfig {
            lease_name: std::env::var("LEASE_NAME")
                .unwrap_or_else(|_| "ip-address-controller-leader".to_string()),
            lease_namespace: std::env::var("LEASE_NAMESPACE")
                .unwrap_or_else(|_| "kube-system".to_string()),
            lease_duration_seconds: std::env::var("LEASE_DURATION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            identity: std::env::var("HOSTNAME").unwrap_or_else(|_| "ip-address-controller".to_string()),
        }
    }
}

impl LeaderGateConfig {
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs((self.lease_duration_seconds as u64 * 2) / 3)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs((self.lease_duration_seconds as u64) / 4)
    }
}

/// Spawns the acquire/renew loop and returns a receiver that flips to
/// `true` whenever this process holds the lease. The loop runs until
/// `shutdown` fires.
pub fn start(
    client: Client,
    config: LeaderGateConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("leader gate shutting down");
                    let _ = tx.send(false);
                    break;
                }
                result = try_acquire_or_renew(&client, &config, *tx.borrow()) => {
                    match result {
                        Ok(is_leader) => {
                            if is_leader != *tx.borrow() {
                                info!(is_leader, "leadership state changed");
                            }
                            let _ = tx.send(is_leader);
                            let wait = if is_leader { config.renew_interval() } else { config.retry_interval() };
                            tokio::select! {
                                _ = shutdown.recv() => { let _ = tx.send(false); break; }
                                _ = sleep(wait) => {}
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "leader gate error, will retry");
                            let _ = tx.send(false);
                            tokio::select! {
                                _ = shutdown.recv() => { break; }
                                _ = sleep(config.retry_interval()) => {}
                            }
                        }
                    }
                }
            }
        }
    });
    rx
}

async fn try_acquire_or_renew(
    client: &Client,
    config: &LeaderGateConfig,
    currently_leader: bool,
) -> Result<bool, kube::Error> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), &config.lease_namespace);
    let now = Utc::now();

    let desired = Lease {
        metadata: ObjectMeta {
            name: Some(config.lease_name.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(config.identity.clone()),
            lease_duration_seconds: Some(config.lease_duration_seconds as i32),
            renew_time: Some(MicroTime(now)),
            acquire_time: Some(MicroTime(now)),
            ..Default::default()
        }),
    };

    match leases.create(&PostParams::default(), &desired).await {
        Ok(_) => return Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => return Err(e),
    }

    let existing = leases.get(&config.lease_name).await?;
    let spec = existing.spec.unwrap_or_default();
    let is_ours = spec.holder_identity.as_deref() == Some(config.identity.as_str());
    let is_expired = match spec.renew_time {
        Some(renew) => is_lease_expired(renew.0, spec.lease_duration_seconds.unwrap_or(0), now),
        None => true,
    };

    if !is_ours && !is_expired {
        return Ok(false);
    }
    if is_ours && !currently_leader {
        info!("resuming leadership from existing lease record");
    }

    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": config.identity,
            "renewTime": now.to_rfc3339(),
            "leaseDurationSeconds": config.lease_duration_seconds,
        }
    });
    leases
        .patch(
            &config.lease_name,
            &PatchParams::apply("ip-address-controller"),
            &Patch::Merge(patch),
        )
        .await?;
    Ok(true)
}

fn is_lease_expired(renew_time: DateTime<Utc>, duration_seconds: i32, now: DateTime<Utc>) -> bool {
    let expiry = renew_time + ChronoDuration::seconds(duration_seconds as i64);
    now > expiry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_not_expired_within_duration() {
        let now = Utc::now();
        let renew = now - ChronoDuration::seconds(10);
        assert!(!is_lease_expired(renew, 60, now));
    }

    #[test]
    fn lease_expired_past_duration() {
        let now = Utc::now();
        let renew = now - ChronoDuration::seconds(90);
        assert!(is_lease_expired(renew, 60, now));
    }

    #[test]
    fn renew_interval_is_two_thirds_of_duration() {
        let config = LeaderGateConfig {
            lease_name: "x".to_string(),
            lease_namespace: "default".to_string(),
            lease_duration_seconds: 60,
            identity: "x".to_string(),
        };
        assert_eq!(config.renew_interval(), Duration::from_secs(40));
    }

    #[test]
    fn retry_interval_is_one_quarter_of_duration() {
        let config = LeaderGateConfig {
            lease_name: "x".to_string(),
            lease_namespace: "default".to_string(),
            lease_duration_seconds: 60,
            identity: "x".to_string(),
        };
        assert_eq!(config.retry_interval(), Duration::from_secs(15));
    }

    #[test]
    fn default_config_reads_lease_name_from_env() {
        std::env::remove_var("LEASE_NAME");
        let config = LeaderGateConfig::default();
        assert_eq!(config.lease_name, "ip-address-controller-leader");
    }
}
