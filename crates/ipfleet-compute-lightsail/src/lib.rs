// # AWS Lightsail Compute Provider
//
// Public-IP capabilities of Lightsail instances through static IPs.
//
// ## Naming
//
// Each instance owns exactly one static IP named `<instance>ipv4`. Rotation
// detaches and releases it, then allocates a fresh static IP under the same
// name and attaches it again; Lightsail hands out a new address each time.
//
// ## API
//
// JSON 1.1 over `POST https://lightsail.<region>.amazonaws.com/`, signed
// with SigV4. Operations used: GetInstance, DetachStaticIp,
// ReleaseStaticIp, AllocateStaticIp, AttachStaticIp.
//
// Hostname labels are not supported.

use async_trait::async_trait;
use ipfleet_core::config::{AccountConfig, ComputeConfig};
use ipfleet_core::traits::{ComputeProvider, ComputeProviderFactory};
use ipfleet_core::{Error, IpResource, ManagedInstance, ProviderRegistry, ResolvedAddress, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use ipfleet_aws_sigv4::{Credentials, Scope};
use std::net::IpAddr;
use std::time::Duration;

const TARGET_PREFIX: &str = "Lightsail_20161128";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const SERVICE: &str = "lightsail";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const PROVIDER: &str = "lightsail";

#[derive(Debug, Deserialize)]
struct GetInstanceResponse {
    instance: LightsailInstance,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LightsailInstance {
    name: String,
    public_ip_address: Option<String>,
    #[serde(default)]
    is_static_ip: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(rename = "__type", default)]
    error_type: String,
    #[serde(alias = "Message", default)]
    message: String,
}

/// Static IP name owned by an instance
pub fn static_ip_name(instance_id: &str) -> String {
    format!("{}ipv4", instance_id)
}

/// Lightsail compute provider (one account, one region)
pub struct LightsailProvider {
    access_key_id: String,
    secret_access_key: String,
    region: String,
    base_url: String,
    host: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for LightsailProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightsailProvider")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<REDACTED>")
            .field("region", &self.region)
            .finish()
    }
}

impl LightsailProvider {
    pub fn new(access_key_id: &str, secret_access_key: &str, region: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        let host = format!("lightsail.{}.amazonaws.com", region);
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

    async fn call<T: DeserializeOwned>(&self, operation: &str, body: Value) -> Result<T> {
        let target = format!("{}.{}", TARGET_PREFIX, operation);
        let payload = serde_json::to_vec(&body)?;

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
            &[("content-type", CONTENT_TYPE), ("x-amz-target", target.as_str())],
            &payload,
        )?;

        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", signature.amz_date)
            .header("x-amz-target", &target)
            .header("authorization", signature.authorization)
            .body(payload)
            .send()
            .await
            .map_err(|e| Error::compute(PROVIDER, operation, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::compute(PROVIDER, operation, format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            let error: ApiError = serde_json::from_str(&text).unwrap_or(ApiError {
                error_type: String::new(),
                message: text.clone(),
            });
            return Err(map_error(status.as_u16(), &error, operation));
        }

        serde_json::from_str(&text)
            .map_err(|e| Error::compute(PROVIDER, operation, format!("invalid response: {}", e)))
    }
}

fn map_error(status: u16, error: &ApiError, operation: &str) -> Error {
    // "__type" may carry a namespace prefix ("com.amazonaws...#NotFoundException")
    let kind = error.error_type.rsplit('#').next().unwrap_or_default();
    let detail = format!("{}: {} {}", operation, kind, error.message);
    let message = error.message.to_lowercase();

    match kind {
        "NotFoundException" => Error::not_found(detail),
        "AccessDeniedException"
        | "UnauthenticatedException"
        | "UnrecognizedClientException"
        | "InvalidSignatureException"
        | "AccountSetupInProgressException" => Error::auth(detail),
        "ThrottlingException" => Error::rate_limited(detail),
        "InvalidInputException"
            if message.contains("not attached") || message.contains("does not exist") =>
        {
            Error::not_found(detail)
        }
        "InvalidInputException" if message.contains("already") => Error::conflict(detail),
        _ if status == 429 => Error::rate_limited(detail),
        _ if status == 401 || status == 403 => Error::auth(detail),
        _ => Error::compute(PROVIDER, operation, format!("{} (status {})", detail, status)),
    }
}

#[async_trait]
impl ComputeProvider for LightsailProvider {
    async fn resolve_current_ip(&self, instance: &ManagedInstance) -> Result<ResolvedAddress> {
        let response: GetInstanceResponse = self
            .call("GetInstance", json!({ "instanceName": instance.id }))
            .await?;
        let found = response.instance;

        let ip = found
            .public_ip_address
            .as_deref()
            .and_then(|s| s.parse::<IpAddr>().ok());
        let resource = found
            .is_static_ip
            .then(|| IpResource::new(static_ip_name(&found.name)));

        Ok(ResolvedAddress::new(ip, resource))
    }

    async fn disassociate(&self, instance: &ManagedInstance) -> Result<()> {
        let _: Value = self
            .call(
                "DetachStaticIp",
                json!({ "staticIpName": static_ip_name(&instance.id) }),
            )
            .await?;
        tracing::info!("Detached static IP from {}", instance.id);
        Ok(())
    }

    async fn release(&self, resource: &IpResource) -> Result<()> {
        let _: Value = self
            .call("ReleaseStaticIp", json!({ "staticIpName": resource.id }))
            .await?;
        tracing::info!("Released static IP {}", resource.id);
        Ok(())
    }

    async fn allocate(
        &self,
        instance: &ManagedInstance,
        _previous: Option<&IpResource>,
    ) -> Result<IpResource> {
        let name = static_ip_name(&instance.id);
        match self
            .call::<Value>("AllocateStaticIp", json!({ "staticIpName": name }))
            .await
        {
            Ok(_) => tracing::info!("Allocated static IP {}", name),
            // Left over from a release that did not go through; attach it as is
            Err(Error::Conflict(msg)) => {
                tracing::warn!("Static IP {} already allocated: {}", name, msg)
            }
            Err(e) => return Err(e),
        }
        Ok(IpResource::new(name))
    }

    async fn associate(&self, instance: &ManagedInstance, resource: &IpResource) -> Result<()> {
        let _: Value = self
            .call(
                "AttachStaticIp",
                json!({ "staticIpName": resource.id, "instanceName": instance.id }),
            )
            .await?;
        tracing::info!("Attached static IP {} to {}", resource.id, instance.id);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// Factory for creating Lightsail providers
pub struct LightsailFactory;

impl ComputeProviderFactory for LightsailFactory {
    fn create(&self, config: &AccountConfig) -> Result<Box<dyn ComputeProvider>> {
        match &config.provider {
            ComputeConfig::Lightsail {
                access_key_id,
                secret_access_key,
            } => {
                config.provider.validate()?;
                Ok(Box::new(LightsailProvider::new(
                    access_key_id,
                    secret_access_key,
                    &config.region,
                )?))
            }
            _ => Err(Error::config("Invalid config for Lightsail provider")),
        }
    }
}

/// Register the Lightsail provider with a registry
pub fn register(registry: &ProviderRegistry) {
    registry.register_compute(PROVIDER, Box::new(LightsailFactory));
}
