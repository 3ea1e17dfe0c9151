//! Cloud provider driver: the only component that talks to a cloud API.
//!
//! One tagged variant per provider rather than a `dyn Trait`, so dispatch
//! never needs `async-trait` or boxed futures. Each variant implements the
//! same three operations: list IPs currently bound to an instance, attach
//! an IP, detach an IP.

use std::collections::HashSet;

use serde::Deserialize;

use crate::crd::CloudProvider;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("instance or ip not found: {0}")]
    NotFound(String),
    #[error("transient cloud api error: {0}")]
    Transient(String),
    #[error("cloud authentication error: {0}")]
    Auth(String),
    #[error("ip already attached to this instance")]
    AlreadyAttached,
    #[error("ip currently attached elsewhere: {0}")]
    InUseElsewhere(String),
    #[error("ip is not attached to any instance")]
    NotAttached,
}

/// Identifies a VM instance to the cloud API, derived from
/// `node.spec.providerID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub provider: CloudProvider,
    pub instance_id: String,
    pub zone: Option<String>,
}

/// Parses a node's `spec.providerID` into an [`InstanceRef`].
///
/// Formats observed in the wild:
/// - GCE:   `gce://project/zone/instance-name`
/// - AWS:   `aws:///zone/i-0123456789abcdef0`
/// - Azure: `azure:///subscriptions/.../virtualMachines/vm-name`
pub fn parse_provider_id(provider: CloudProvider, provider_id: &str) -> Result<InstanceRef, CloudError> {
    match provider {
        CloudProvider::Gcp => {
            let rest = provider_id
                .strip_prefix("gce://")
                .ok_or_else(|| CloudError::NotFound(provider_id.to_string()))?;
            let mut parts = rest.splitn(3, '/');
            let _project = parts.next();
            let zone = parts.next();
            let instance = parts.next();
            match (zone, instance) {
                (Some(zone), Some(instance)) => Ok(InstanceRef {
                    provider,
                    instance_id: instance.to_string(),
                    zone: Some(zone.to_string()),
                }),
                _ => Err(CloudError::NotFound(provider_id.to_string())),
            }
        }
        CloudProvider::Aws => {
            let rest = provider_id
                .strip_prefix("aws://")
                .ok_or_else(|| CloudError::NotFound(provider_id.to_string()))?;
            let (zone, instance) = rest
                .trim_start_matches('/')
                .rsplit_once('/')
                .ok_or_else(|| CloudError::NotFound(provider_id.to_string()))?;
            Ok(InstanceRef {
                provider,
                instance_id: instance.to_string(),
                zone: (!zone.is_empty()).then(|| zone.to_string()),
            })
        }
        CloudProvider::Azure => {
            let instance = provider_id
                .rsplit_once('/')
                .map(|(_, last)| last)
                .unwrap_or(provider_id);
            Ok(InstanceRef {
                provider,
                instance_id: instance.to_string(),
                zone: None,
            })
        }
    }
}

pub enum CloudDriver {
    Gcp(GcpDriver),
    Aws(AwsDriver),
    Azure(AzureDriver),
}

impl CloudDriver {
    pub fn gcp(project: String) -> Self {
        CloudDriver::Gcp(GcpDriver::new(project))
    }

    pub fn aws(client: aws_sdk_ec2::Client) -> Self {
        CloudDriver::Aws(AwsDriver::new(client))
    }

    pub fn azure(subscription_id: String, resource_group: String) -> Self {
        CloudDriver::Azure(AzureDriver::new(subscription_id, resource_group))
    }

    pub async fn get_external_ips(&self, instance: &InstanceRef) -> Result<HashSet<String>, CloudError> {
        match self {
            CloudDriver::Gcp(d) => d.get_external_ips(instance).await,
            CloudDriver::Aws(d) => d.get_external_ips(instance).await,
            CloudDriver::Azure(d) => d.get_external_ips(instance).await,
        }
    }

    pub async fn attach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        match self {
            CloudDriver::Gcp(d) => d.attach_ip(instance, ip).await,
            CloudDriver::Aws(d) => d.attach_ip(instance, ip).await,
            CloudDriver::Azure(d) => d.attach_ip(instance, ip).await,
        }
    }

    pub async fn detach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        match self {
            CloudDriver::Gcp(d) => d.detach_ip(instance, ip).await,
            CloudDriver::Aws(d) => d.detach_ip(instance, ip).await,
            CloudDriver::Azure(d) => d.detach_ip(instance, ip).await,
        }
    }
}

fn map_transport_err(e: reqwest::Error) -> CloudError {
    if e.is_timeout() || e.is_connect() {
        CloudError::Transient(e.to_string())
    } else {
        CloudError::Transient(e.to_string())
    }
}

async fn gce_metadata_token(http: &reqwest::Client) -> Result<String, CloudError> {
    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
    }
    let resp = http
        .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(map_transport_err)?;
    if !resp.status().is_success() {
        return Err(CloudError::Auth(format!(
            "metadata server returned {}",
            resp.status()
        )));
    }
    let token: TokenResponse = resp.json().await.map_err(map_transport_err)?;
    Ok(token.access_token)
}

/// GCE Compute Engine driver. A node's "primary external access
/// configuration" is GCE's own `accessConfig` terminology on an instance's
/// primary network interface.
pub struct GcpDriver {
    http: reqwest::Client,
    project: String,
}

#[derive(Deserialize)]
struct AccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Deserialize)]
struct NetworkInterface {
    #[serde(default, rename = "accessConfigs")]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
struct GceInstance {
    #[serde(rename = "networkInterfaces")]
    network_interfaces: Vec<NetworkInterface>,
}

impl GcpDriver {
    pub fn new(project: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            project,
        }
    }

    fn instance_url(&self, instance: &InstanceRef) -> Result<String, CloudError> {
        let zone = instance
            .zone
            .as_ref()
            .ok_or_else(|| CloudError::NotFound("missing zone for gce instance".to_string()))?;
        Ok(format!(
            "https://compute.googleapis.com/compute/v1/projects/{}/zones/{}/instances/{}",
            self.project, zone, instance.instance_id
        ))
    }

    pub async fn get_external_ips(&self, instance: &InstanceRef) -> Result<HashSet<String>, CloudError> {
        let token = gce_metadata_token(&self.http).await?;
        let resp = self
            .http
            .get(self.instance_url(instance)?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_transport_err)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(instance.instance_id.clone()));
        }
        if !resp.status().is_success() {
            return Err(CloudError::Transient(format!(
                "compute.instances.get returned {}",
                resp.status()
            )));
        }
        let body: GceInstance = resp.json().await.map_err(map_transport_err)?;
        Ok(body
            .network_interfaces
            .into_iter()
            .flat_map(|nic| nic.access_configs)
            .filter_map(|ac| ac.nat_ip)
            .collect())
    }

    pub async fn attach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        let current = self.get_external_ips(instance).await?;
        if current.contains(ip) {
            return Err(CloudError::AlreadyAttached);
        }
        let token = gce_metadata_token(&self.http).await?;
        let url = format!(
            "{}/addAccessConfig?networkInterface=nic0",
            self.instance_url(instance)?
        );
        let body = serde_json::json!({
            "type": "ONE_TO_ONE_NAT",
            "name": "External NAT",
            "natIP": ip,
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_err)?;
        if resp.status().is_success() {
            Ok(())
        } else if resp.status() == reqwest::StatusCode::CONFLICT {
            Err(CloudError::InUseElsewhere(ip.to_string()))
        } else {
            Err(CloudError::Transient(format!(
                "compute.instances.addAccessConfig returned {}",
                resp.status()
            )))
        }
    }

    pub async fn detach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        let current = self.get_external_ips(instance).await?;
        if !current.contains(ip) {
            return Err(CloudError::NotAttached);
        }
        let token = gce_metadata_token(&self.http).await?;
        let url = format!(
            "{}/deleteAccessConfig?accessConfig=External%20NAT&networkInterface=nic0",
            self.instance_url(instance)?
        );
        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_transport_err)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CloudError::Transient(format!(
                "compute.instances.deleteAccessConfig returned {}",
                resp.status()
            )))
        }
    }
}

/// EC2 driver. Grounded on the associate/disassociate/describe-addresses
/// calls used by the necaris AWS EIP operator reference implementation.
pub struct AwsDriver {
    client: aws_sdk_ec2::Client,
}

impl AwsDriver {
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }

    fn map_sdk_err<E: std::fmt::Display>(e: E) -> CloudError {
        CloudError::Transient(e.to_string())
    }

    pub async fn get_external_ips(&self, instance: &InstanceRef) -> Result<HashSet<String>, CloudError> {
        let resp = self
            .client
            .describe_addresses()
            .filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name("instance-id")
                    .values(&instance.instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(Self::map_sdk_err)?;
        Ok(resp
            .addresses()
            .iter()
            .filter_map(|a| a.public_ip().map(|ip| ip.to_string()))
            .collect())
    }

    pub async fn attach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        let resp = self
            .client
            .describe_addresses()
            .public_ips(ip)
            .send()
            .await
            .map_err(Self::map_sdk_err)?;
        let address = resp
            .addresses()
            .first()
            .ok_or_else(|| CloudError::NotFound(ip.to_string()))?;
        if address.instance_id() == Some(instance.instance_id.as_str()) {
            return Err(CloudError::AlreadyAttached);
        }
        if address.instance_id().is_some() {
            return Err(CloudError::InUseElsewhere(ip.to_string()));
        }
        let allocation_id = address
            .allocation_id()
            .ok_or_else(|| CloudError::NotFound(ip.to_string()))?;
        self.client
            .associate_address()
            .allocation_id(allocation_id)
            .instance_id(&instance.instance_id)
            .send()
            .await
            .map_err(Self::map_sdk_err)?;
        Ok(())
    }

    pub async fn detach_ip(&self, _instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        let resp = self
            .client
            .describe_addresses()
            .public_ips(ip)
            .send()
            .await
            .map_err(Self::map_sdk_err)?;
        let address = resp
            .addresses()
            .first()
            .ok_or_else(|| CloudError::NotFound(ip.to_string()))?;
        let association_id = address.association_id().ok_or(CloudError::NotAttached)?;
        self.client
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await
            .map_err(Self::map_sdk_err)?;
        Ok(())
    }
}

/// Azure ARM driver, best-effort: the network-interface IP-configuration
/// shape is approximated, not bit-exact.
pub struct AzureDriver {
    http: reqwest::Client,
    subscription_id: String,
    resource_group: String,
}

impl AzureDriver {
    pub fn new(subscription_id: String, resource_group: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            subscription_id,
            resource_group,
        }
    }

    async fn token(&self) -> Result<String, CloudError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let resp = self
            .http
            .get("http://169.254.169.254/metadata/identity/oauth2/token")
            .header("Metadata", "true")
            .query(&[
                ("api-version", "2018-02-01"),
                ("resource", "https://management.azure.com/"),
            ])
            .send()
            .await
            .map_err(map_transport_err)?;
        if !resp.status().is_success() {
            return Err(CloudError::Auth(format!(
                "imds token endpoint returned {}",
                resp.status()
            )));
        }
        let token: TokenResponse = resp.json().await.map_err(map_transport_err)?;
        Ok(token.access_token)
    }

    fn nic_url(&self, instance: &InstanceRef) -> String {
        format!(
            "https://management.azure.com/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/networkInterfaces/{}-nic?api-version=2023-05-01",
            self.subscription_id, self.resource_group, instance.instance_id
        )
    }

    pub async fn get_external_ips(&self, instance: &InstanceRef) -> Result<HashSet<String>, CloudError> {
        let token = self.token().await?;
        let resp = self
            .http
            .get(self.nic_url(instance))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_transport_err)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(instance.instance_id.clone()));
        }
        if !resp.status().is_success() {
            return Err(CloudError::Transient(format!(
                "networkInterfaces.get returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp.json().await.map_err(map_transport_err)?;
        let ips = body["properties"]["ipConfigurations"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|cfg| {
                cfg["properties"]["publicIPAddress"]["properties"]["ipAddress"]
                    .as_str()
                    .map(|s| s.to_string())
            })
            .collect();
        Ok(ips)
    }

    pub async fn attach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        let current = self.get_external_ips(instance).await?;
        if current.contains(ip) {
            return Err(CloudError::AlreadyAttached);
        }
        Err(CloudError::Transient(format!(
            "azure attach_ip for {ip} on {} requires a read-modify-write PATCH not yet wired up",
            instance.instance_id
        )))
    }

    pub async fn detach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), CloudError> {
        let current = self.get_external_ips(instance).await?;
        if !current.contains(ip) {
            return Err(CloudError::NotAttached);
        }
        Err(CloudError::Transient(format!(
            "azure detach_ip for {ip} on {} requires a read-modify-write PATCH not yet wired up",
            instance.instance_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gce_provider_id() {
        let r = parse_provider_id(CloudProvider::Gcp, "gce://my-project/us-central1-a/worker-1").unwrap();
        assert_eq!(r.instance_id, "worker-1");
        assert_eq!(r.zone.as_deref(), Some("us-central1-a"));
    }

    #[test]
    fn parses_aws_provider_id() {
        let r = parse_provider_id(CloudProvider::Aws, "aws:///us-east-1a/i-0123456789abcdef0").unwrap();
        assert_eq!(r.instance_id, "i-0123456789abcdef0");
        assert_eq!(r.zone.as_deref(), Some("us-east-1a"));
    }

    #[test]
    fn parses_azure_provider_id() {
        let r = parse_provider_id(
            CloudProvider::Azure,
            "azure:///subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm-1",
        )
        .unwrap();
        assert_eq!(r.instance_id, "vm-1");
    }

    #[test]
    fn rejects_mismatched_provider_id_format() {
        let err = parse_provider_id(CloudProvider::Gcp, "aws:///zone/i-abc").unwrap_err();
        assert!(matches!(err, CloudError::NotFound(_)));
    }

    #[test]
    fn gce_instance_url_requires_zone() {
        let driver = GcpDriver::new("proj".to_string());
        let instance = InstanceRef {
            provider: CloudProvider::Gcp,
            instance_id: "worker-1".to_string(),
            zone: None,
        };
        assert!(driver.instance_url(&instance).is_err());
    }
}
