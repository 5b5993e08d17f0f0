// # AWS EC2 Compute Provider
//
// Public-IP capabilities of EC2 instances through VPC Elastic IPs.
//
// ## Identities
//
// An Elastic IP carries two ids. The allocation id (`eipalloc-...`) owns the
// address; release and associate take it, and it is what `IpResource::id`
// holds. The association id (`eipassoc-...`) binds the address to one
// instance; only disassociate takes it, so the adapter looks it up with
// DescribeAddresses right before disassociating.
//
// ## API
//
// Query protocol (`Action=...&Version=2016-11-15`, form encoded) over
// `POST https://ec2.<region>.amazonaws.com/`, signed with SigV4. Responses
// are XML. Operations used: DescribeInstances, DescribeAddresses,
// DisassociateAddress, ReleaseAddress, AllocateAddress, AssociateAddress.
//
// Hostname labels are not supported.

use async_trait::async_trait;
use ipfleet_aws_sigv4::{Credentials, Scope};
use ipfleet_core::config::{AccountConfig, ComputeConfig};
use ipfleet_core::traits::{ComputeProvider, ComputeProviderFactory};
use ipfleet_core::{Error, IpResource, ManagedInstance, ProviderRegistry, ResolvedAddress, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::net::IpAddr;
use std::time::Duration;

const API_VERSION: &str = "2016-11-15";
const SERVICE: &str = "ec2";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const PROVIDER: &str = "ec2";

/// `<xxxSet><item>...</item></xxxSet>`
#[derive(Debug, Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

impl<T> ItemSet<T> {
    fn into_items(set: Option<Self>) -> Vec<T> {
        set.map(|s| s.items).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResponse {
    reservation_set: Option<ItemSet<Reservation>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reservation {
    instances_set: Option<ItemSet<Instance>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeAddressesResponse {
    addresses_set: Option<ItemSet<Address>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Address {
    allocation_id: Option<String>,
    association_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocateAddressResponse {
    allocation_id: String,
    public_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Errors")]
    errors: ErrorList,
}

#[derive(Debug, Deserialize)]
struct ErrorList {
    #[serde(rename = "Error", default = "Vec::new")]
    error: Vec<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

/// EC2 compute provider (one account, one region)
pub struct Ec2Provider {
    access_key_id: String,
    secret_access_key: String,
    region: String,
    base_url: String,
    host: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for Ec2Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ec2Provider")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<REDACTED>")
            .field("region", &self.region)
            .finish()
    }
}

impl Ec2Provider {
    pub fn new(access_key_id: &str, secret_access_key: &str, region: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        let host = format!("ec2.{}.amazonaws.com", region);
        Ok(Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            region: region.to_string(),
            base_url: format!("https://{}", host),
            host,
            client,
        })
    }

    /// Point the provider at a different endpoint (`scheme://host[:port]`)
    pub fn with_endpoint(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self.host = self
            .base_url
            .split_once("://")
            .map(|(_, host)| host.to_string())
            .unwrap_or_else(|| self.base_url.clone());
        self
    }

    /// Call `action` and return the raw XML body
    async fn call(&self, action: &str, params: &[(&str, &str)]) -> Result<String> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Action", action)
            .append_pair("Version", API_VERSION)
            .extend_pairs(params.iter().copied())
            .finish();

        let signature = Credentials {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
        }
        .sign(
            chrono::Utc::now(),
            &Scope {
                host: &self.host,
                region: &self.region,
                service: SERVICE,
            },
            &[("content-type", CONTENT_TYPE)],
            body.as_bytes(),
        )?;

        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", signature.amz_date)
            .header("authorization", signature.authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::compute(PROVIDER, action, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::compute(PROVIDER, action, format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            let error = quick_xml::de::from_str::<ErrorResponse>(&text)
                .ok()
                .and_then(|r| r.errors.error.into_iter().next())
                .unwrap_or(ApiError {
                    code: String::new(),
                    message: text.clone(),
                });
            return Err(map_error(status.as_u16(), &error, action));
        }

        Ok(text)
    }

    async fn query<T: DeserializeOwned>(&self, action: &str, params: &[(&str, &str)]) -> Result<T> {
        let text = self.call(action, params).await?;
        quick_xml::de::from_str(&text)
            .map_err(|e| Error::compute(PROVIDER, action, format!("invalid response: {}", e)))
    }

    /// Elastic IPs currently associated with an instance
    async fn addresses_of(&self, instance_id: &str) -> Result<Vec<Address>> {
        let response: DescribeAddressesResponse = self
            .query(
                "DescribeAddresses",
                &[
                    ("Filter.1.Name", "instance-id"),
                    ("Filter.1.Value.1", instance_id),
                ],
            )
            .await?;
        Ok(ItemSet::into_items(response.addresses_set))
    }
}

fn map_error(status: u16, error: &ApiError, action: &str) -> Error {
    let code = error.code.as_str();
    let detail = format!("{}: {} {}", action, code, error.message);

    match code {
        // InvalidAllocationID.NotFound, InvalidAssociationID.NotFound, InvalidInstanceID.NotFound
        _ if code.ends_with(".NotFound") => Error::not_found(detail),
        "AuthFailure" | "UnauthorizedOperation" | "InvalidClientTokenId" | "SignatureDoesNotMatch"
        | "OptInRequired" | "Blocked" => Error::auth(detail),
        "RequestLimitExceeded" | "Throttling" => Error::rate_limited(detail),
        "Resource.AlreadyAssociated" => Error::conflict(detail),
        _ if status == 429 => Error::rate_limited(detail),
        _ if status == 401 || status == 403 => Error::auth(detail),
        _ => Error::compute(PROVIDER, action, format!("{} (status {})", detail, status)),
    }
}

#[async_trait]
impl ComputeProvider for Ec2Provider {
    async fn resolve_current_ip(&self, instance: &ManagedInstance) -> Result<ResolvedAddress> {
        let response: DescribeInstancesResponse = self
            .query("DescribeInstances", &[("InstanceId.1", instance.id.as_str())])
            .await?;
        let found = ItemSet::into_items(response.reservation_set)
            .into_iter()
            .flat_map(|r| ItemSet::into_items(r.instances_set))
            .next()
            .ok_or_else(|| Error::not_found(format!("instance {}", instance.id)))?;

        let ip = found
            .ip_address
            .as_deref()
            .and_then(|s| s.parse::<IpAddr>().ok());

        // A public IP without an Elastic IP is an auto-assigned address
        let resource = self
            .addresses_of(instance.id.as_str())
            .await?
            .into_iter()
            .find_map(|a| a.allocation_id)
            .map(IpResource::new);

        Ok(ResolvedAddress::new(ip, resource))
    }

    async fn disassociate(&self, instance: &ManagedInstance) -> Result<()> {
        let association_id = self
            .addresses_of(instance.id.as_str())
            .await?
            .into_iter()
            .find_map(|a| a.association_id)
            .ok_or_else(|| Error::not_found(format!("no Elastic IP associated with {}", instance.id)))?;

        self.call("DisassociateAddress", &[("AssociationId", association_id.as_str())])
            .await?;
        tracing::info!("Disassociated {} from {}", association_id, instance.id);
        Ok(())
    }

    async fn release(&self, resource: &IpResource) -> Result<()> {
        self.call("ReleaseAddress", &[("AllocationId", resource.id.as_str())])
            .await?;
        tracing::info!("Released Elastic IP {}", resource.id);
        Ok(())
    }

    async fn allocate(
        &self,
        _instance: &ManagedInstance,
        _previous: Option<&IpResource>,
    ) -> Result<IpResource> {
        let response: AllocateAddressResponse = self
            .query("AllocateAddress", &[("Domain", "vpc")])
            .await?;
        tracing::info!(
            "Allocated Elastic IP {} ({})",
            response.allocation_id,
            response.public_ip.as_deref().unwrap_or("unknown address")
        );
        Ok(IpResource::new(response.allocation_id))
    }

    async fn associate(&self, instance: &ManagedInstance, resource: &IpResource) -> Result<()> {
        self.call(
            "AssociateAddress",
            &[("InstanceId", instance.id.as_str()), ("AllocationId", resource.id.as_str())],
        )
        .await?;
        tracing::info!("Associated Elastic IP {} with {}", resource.id, instance.id);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// Factory for creating EC2 providers
pub struct Ec2Factory;

impl ComputeProviderFactory for Ec2Factory {
    fn create(&self, config: &AccountConfig) -> Result<Box<dyn ComputeProvider>> {
        match &config.provider {
            ComputeConfig::Ec2 {
                access_key_id,
                secret_access_key,
            } => {
                config.provider.validate()?;
                Ok(Box::new(Ec2Provider::new(
                    access_key_id,
                    secret_access_key,
                    &config.region,
                )?))
            }
            _ => Err(Error::config("Invalid config for EC2 provider")),
        }
    }
}

/// Register the EC2 provider with a registry
pub fn register(registry: &ProviderRegistry) {
    registry.register_compute(PROVIDER, Box::new(Ec2Factory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    /// Serve canned XML replies in order, recording each request body
    async fn serve(replies: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            while let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                log.lock().unwrap().push(request);
                let (status, body) = replies.next().unwrap_or((500, "<Response/>"));
                let response = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: text/xml;charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (base, seen)
    }

    fn provider(base: &str) -> Ec2Provider {
        Ec2Provider::new("AKIDEXAMPLE", "secret-key", "us-east-1")
            .unwrap()
            .with_endpoint(base)
    }

    fn instance() -> ManagedInstance {
        ManagedInstance::new("i-0abc", "ec2", "us-east-1")
    }

    fn body_of(request: &str) -> &str {
        request.split("\r\n\r\n").nth(1).unwrap_or_default()
    }

    const INSTANCE: &str = r#"<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>req-1</requestId>
    <reservationSet>
        <item>
            <reservationId>r-1</reservationId>
            <groupSet/>
            <instancesSet>
                <item>
                    <instanceId>i-0abc</instanceId>
                    <instanceState><code>16</code><name>running</name></instanceState>
                    <privateIpAddress>10.0.0.12</privateIpAddress>
                    <ipAddress>54.1.2.3</ipAddress>
                    <tagSet><item><key>Name</key><value>node-1</value></item></tagSet>
                </item>
            </instancesSet>
        </item>
    </reservationSet>
</DescribeInstancesResponse>"#;

    const ADDRESS: &str = r#"<DescribeAddressesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>req-2</requestId>
    <addressesSet>
        <item>
            <publicIp>54.1.2.3</publicIp>
            <allocationId>eipalloc-old</allocationId>
            <domain>vpc</domain>
            <instanceId>i-0abc</instanceId>
            <associationId>eipassoc-old</associationId>
        </item>
    </addressesSet>
</DescribeAddressesResponse>"#;

    const NO_ADDRESS: &str = r#"<DescribeAddressesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>req-3</requestId>
    <addressesSet/>
</DescribeAddressesResponse>"#;

    const RETURN_TRUE: &str = r#"<Response><requestId>req</requestId><return>true</return></Response>"#;

    #[test]
    fn test_factory_creation() {
        let config = AccountConfig {
            name: "virginia".to_string(),
            region: "us-east-1".to_string(),
            provider: ComputeConfig::Ec2 {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
            },
            instances: vec!["i-0abc".to_string()],
        };
        assert!(Ec2Factory.create(&config).is_ok());

        let lightsail = AccountConfig {
            provider: ComputeConfig::Lightsail {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
            },
            ..config
        };
        assert!(Ec2Factory.create(&lightsail).is_err());
    }

    #[test]
    fn test_secret_not_exposed_in_debug() {
        let provider = Ec2Provider::new("AKID", "secret-key", "us-east-1").unwrap();
        assert!(!format!("{:?}", provider).contains("secret-key"));
        assert!(!provider.supports_hostname_labels());
        assert_eq!(provider.host, "ec2.us-east-1.amazonaws.com");
    }

    #[test]
    fn test_error_mapping() {
        let err = |status: u16, code: &str| {
            map_error(
                status,
                &ApiError {
                    code: code.to_string(),
                    message: "detail".to_string(),
                },
                "Op",
            )
        };
        assert!(matches!(err(400, "InvalidAssociationID.NotFound"), Error::NotFound(_)));
        assert!(matches!(err(400, "InvalidAllocationID.NotFound"), Error::NotFound(_)));
        assert!(matches!(err(401, "AuthFailure"), Error::Authentication(_)));
        assert!(matches!(err(503, "RequestLimitExceeded"), Error::RateLimited(_)));
        assert!(matches!(err(400, "Resource.AlreadyAssociated"), Error::Conflict(_)));
        assert!(err(400, "AddressLimitExceeded").is_retryable());
        assert!(err(403, "").is_fatal_for_account());
    }

    #[tokio::test]
    async fn resolve_reads_instance_ip_and_allocation() {
        let (base, seen) = serve(vec![(200, INSTANCE), (200, ADDRESS)]).await;

        let resolved = provider(&base).resolve_current_ip(&instance()).await.unwrap();
        assert_eq!(resolved.ip, Some("54.1.2.3".parse().unwrap()));
        assert_eq!(resolved.resource, Some(IpResource::new("eipalloc-old")));

        let seen = seen.lock().unwrap();
        assert!(seen[0].starts_with("POST / "));
        assert_eq!(
            body_of(&seen[0]),
            "Action=DescribeInstances&Version=2016-11-15&InstanceId.1=i-0abc"
        );
        assert!(body_of(&seen[1]).contains("Filter.1.Name=instance-id&Filter.1.Value.1=i-0abc"));
        assert!(seen[0].to_lowercase().contains(
            "authorization: aws4-hmac-sha256 credential=akidexample/"
        ));
        assert!(seen[0].contains("/us-east-1/ec2/aws4_request"));
    }

    #[tokio::test]
    async fn auto_assigned_ip_has_no_resource() {
        let (base, _) = serve(vec![(200, INSTANCE), (200, NO_ADDRESS)]).await;

        let resolved = provider(&base).resolve_current_ip(&instance()).await.unwrap();
        assert_eq!(resolved.ip, Some("54.1.2.3".parse().unwrap()));
        assert_eq!(resolved.resource, None);
    }

    #[tokio::test]
    async fn rotation_uses_association_then_allocation_ids() {
        let allocated = r#"<AllocateAddressResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>req-4</requestId>
    <publicIp>3.9.9.9</publicIp>
    <domain>vpc</domain>
    <allocationId>eipalloc-new</allocationId>
</AllocateAddressResponse>"#;
        let (base, seen) = serve(vec![
            (200, ADDRESS),
            (200, RETURN_TRUE),
            (200, RETURN_TRUE),
            (200, allocated),
            (200, RETURN_TRUE),
        ])
        .await;
        let provider = provider(&base);
        let instance = instance();

        provider.disassociate(&instance).await.unwrap();
        provider
            .release(&IpResource::new("eipalloc-old"))
            .await
            .unwrap();
        let resource = provider.allocate(&instance, None).await.unwrap();
        assert_eq!(resource.id, "eipalloc-new");
        provider.associate(&instance, &resource).await.unwrap();

        let seen = seen.lock().unwrap();
        let bodies: Vec<&str> = seen.iter().map(|r| body_of(r)).collect();
        assert!(bodies[0].starts_with("Action=DescribeAddresses&"));
        assert_eq!(
            bodies[1],
            "Action=DisassociateAddress&Version=2016-11-15&AssociationId=eipassoc-old"
        );
        assert_eq!(
            bodies[2],
            "Action=ReleaseAddress&Version=2016-11-15&AllocationId=eipalloc-old"
        );
        assert_eq!(bodies[3], "Action=AllocateAddress&Version=2016-11-15&Domain=vpc");
        assert_eq!(
            bodies[4],
            "Action=AssociateAddress&Version=2016-11-15&InstanceId=i-0abc&AllocationId=eipalloc-new"
        );
    }

    #[tokio::test]
    async fn disassociate_without_elastic_ip_is_not_found() {
        let (base, seen) = serve(vec![(200, NO_ADDRESS)]).await;

        let err = provider(&base).disassociate(&instance()).await.unwrap_err();
        assert!(err.is_already_satisfied());
        assert_eq!(seen.lock().unwrap().len(), 1, "no DisassociateAddress sent");
    }

    #[tokio::test]
    async fn api_errors_are_parsed_from_xml() {
        let (base, _) = serve(vec![(
            400,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Response><Errors><Error><Code>InvalidInstanceID.NotFound</Code><Message>The instance ID 'i-0abc' does not exist</Message></Error></Errors><RequestID>req-5</RequestID></Response>"#,
        )])
        .await;

        let err = provider(&base)
            .resolve_current_ip(&instance())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal_for_the_account() {
        let (base, _) = serve(vec![(
            401,
            r#"<Response><Errors><Error><Code>AuthFailure</Code><Message>AWS was not able to validate the provided access credentials</Message></Error></Errors></Response>"#,
        )])
        .await;

        let err = provider(&base).allocate(&instance(), None).await.unwrap_err();
        assert!(err.is_fatal_for_account());
    }
}
