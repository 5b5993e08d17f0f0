// # Azure Compute Provider
//
// Public-IP capabilities of Azure virtual machines through the Resource
// Manager REST API.
//
// ## Resource Model
//
// ```text
// virtualMachines/<vm> ──networkProfile──▶ networkInterfaces/<nic>
//                                             │ ipConfigurations[0]
//                                             ▼
//                                   publicIPAddresses/<name>  (dnsSettings.domainNameLabel)
// ```
//
// Detaching or attaching an IP means rewriting the NIC document. Every
// mutating call is a long-running operation; the adapter polls
// `provisioningState` until it settles before returning.
//
// ## Naming
//
// A replacement public IP keeps the name of the one it replaces
// (`<vm>-ip` when there was none), so the resource group does not fill up
// with generated names.

mod token;

use async_trait::async_trait;
use ipfleet_core::config::{AccountConfig, ComputeConfig};
use ipfleet_core::traits::{ComputeProvider, ComputeProviderFactory};
use ipfleet_core::{Error, IpResource, ManagedInstance, ProviderRegistry, ResolvedAddress, Result};
use serde_json::{Value, json};
use std::net::IpAddr;
use std::time::Duration;
use token::TokenSource;

/// Resource Manager base URL
const MANAGEMENT_BASE: &str = "https://management.azure.com";

const COMPUTE_API_VERSION: &str = "2024-07-01";
const NETWORK_API_VERSION: &str = "2024-05-01";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_POLLS: u32 = 90;

const PROVIDER: &str = "azure";

/// Azure Resource Manager compute provider (one subscription / resource group)
pub struct AzureProvider {
    subscription_id: String,
    resource_group: String,
    management_base: String,
    token: TokenSource,
    client: reqwest::Client,
    poll_interval: Duration,
    max_polls: u32,
}

impl std::fmt::Debug for AzureProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureProvider")
            .field("client_id", &self.token.client_id())
            .field("client_secret", &"<REDACTED>")
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .finish()
    }
}

impl AzureProvider {
    pub fn new(
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        subscription_id: &str,
        resource_group: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
            management_base: MANAGEMENT_BASE.to_string(),
            token: TokenSource::new(tenant_id, client_id, client_secret),
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        })
    }

    /// Override the Azure AD and Resource Manager base URLs
    pub fn with_endpoints(mut self, login_base: &str, management_base: &str) -> Self {
        self.token.set_login_base(login_base);
        self.management_base = management_base.trim_end_matches('/').to_string();
        self
    }

    /// Override how long-running operations are polled
    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    fn group_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers",
            self.subscription_id, self.resource_group
        )
    }

    fn vm_path(&self, vm: &str) -> String {
        format!("{}/Microsoft.Compute/virtualMachines/{}", self.group_path(), vm)
    }

    fn public_ip_path(&self, name: &str) -> String {
        format!("{}/Microsoft.Network/publicIPAddresses/{}", self.group_path(), name)
    }

    fn url(&self, resource_id: &str, api_version: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.management_base, resource_id, api_version
        )
    }

    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let bearer = self.token.bearer(&self.client).await?;
        let response = request
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| Error::compute(PROVIDER, operation, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        Err(map_status(status.as_u16(), &body, operation))
    }

    async fn get(&self, operation: &str, url: &str) -> Result<Value> {
        let response = self.send(operation, self.client.get(url)).await?;
        response
            .json()
            .await
            .map_err(|e| Error::compute(PROVIDER, operation, format!("invalid response: {}", e)))
    }

    async fn put(&self, operation: &str, url: &str, body: &Value) -> Result<Value> {
        self.send(operation, self.client.put(url).json(body)).await?;
        self.wait_provisioned(operation, url).await
    }

    /// Poll a resource until its provisioning state settles
    async fn wait_provisioned(&self, operation: &str, url: &str) -> Result<Value> {
        for _ in 0..self.max_polls {
            let resource = self.get(operation, url).await?;
            match resource
                .pointer("/properties/provisioningState")
                .and_then(Value::as_str)
            {
                Some("Succeeded") | None => return Ok(resource),
                Some(state @ ("Failed" | "Canceled")) => {
                    return Err(Error::compute(
                        PROVIDER,
                        operation,
                        format!("provisioning ended in state {}", state),
                    ));
                }
                Some(state) => {
                    tracing::debug!("{} still {}, polling", operation, state);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        Err(Error::compute(
            PROVIDER,
            operation,
            "timed out waiting for provisioning to finish",
        ))
    }

    /// Poll a deleted resource until it is gone
    async fn wait_deleted(&self, operation: &str, url: &str) -> Result<()> {
        for _ in 0..self.max_polls {
            match self.get(operation, url).await {
                Err(Error::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
                Ok(_) => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(Error::compute(
            PROVIDER,
            operation,
            "timed out waiting for deletion to finish",
        ))
    }

    /// Resource id of the VM's primary network interface
    async fn nic_id(&self, operation: &str, instance: &ManagedInstance) -> Result<String> {
        let vm = self
            .get(operation, &self.url(&self.vm_path(&instance.id), COMPUTE_API_VERSION))
            .await?;
        vm.pointer("/properties/networkProfile/networkInterfaces/0/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::compute(
                    PROVIDER,
                    operation,
                    format!("VM {} has no network interface", instance.id),
                )
            })
    }

    async fn nic(&self, operation: &str, instance: &ManagedInstance) -> Result<(String, Value)> {
        let nic_url = self.url(&self.nic_id(operation, instance).await?, NETWORK_API_VERSION);
        let nic = self.get(operation, &nic_url).await?;
        Ok((nic_url, nic))
    }
}

fn nic_public_ip(nic: &Value) -> Option<String> {
    nic.pointer("/properties/ipConfigurations/0/properties/publicIPAddress/id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn domain_name_label(public_ip: &Value) -> Option<String> {
    public_ip
        .pointer("/properties/dnsSettings/domainNameLabel")
        .and_then(Value::as_str)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

/// Last path segment of an ARM resource id
fn resource_name(resource_id: &str) -> &str {
    resource_id.rsplit('/').next().unwrap_or(resource_id)
}

fn map_status(status: u16, body: &str, operation: &str) -> Error {
    match status {
        401 | 403 => Error::auth(format!("{}: status {}: {}", operation, status, body)),
        404 => Error::not_found(format!("{}: {}", operation, body)),
        429 => Error::rate_limited(format!("{}: status {}", operation, status)),
        _ => Error::compute(PROVIDER, operation, format!("status {}: {}", status, body)),
    }
}

#[async_trait]
impl ComputeProvider for AzureProvider {
    async fn resolve_current_ip(&self, instance: &ManagedInstance) -> Result<ResolvedAddress> {
        let (_, nic) = self.nic("resolve", instance).await?;
        let Some(public_ip_id) = nic_public_ip(&nic) else {
            tracing::debug!("VM {} has no public IP attached", instance.id);
            return Ok(ResolvedAddress::default());
        };

        let public_ip = self
            .get("resolve", &self.url(&public_ip_id, NETWORK_API_VERSION))
            .await?;
        let ip = public_ip
            .pointer("/properties/ipAddress")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<IpAddr>().ok());

        let mut resource = IpResource::new(public_ip_id);
        resource.hostname_label = domain_name_label(&public_ip);
        Ok(ResolvedAddress::new(ip, Some(resource)))
    }

    async fn disassociate(&self, instance: &ManagedInstance) -> Result<()> {
        let (nic_url, mut nic) = self.nic("disassociate", instance).await?;
        if nic_public_ip(&nic).is_none() {
            return Err(Error::not_found(format!(
                "VM {} has no public IP attached",
                instance.id
            )));
        }

        if let Some(props) = nic
            .pointer_mut("/properties/ipConfigurations/0/properties")
            .and_then(Value::as_object_mut)
        {
            props.remove("publicIPAddress");
        }
        self.put("disassociate", &nic_url, &nic).await?;

        tracing::info!("Detached public IP from VM {}", instance.id);
        Ok(())
    }

    async fn release(&self, resource: &IpResource) -> Result<()> {
        let url = self.url(&resource.id, NETWORK_API_VERSION);
        self.send("release", self.client.delete(&url)).await?;
        self.wait_deleted("release", &url).await?;

        tracing::info!("Deleted public IP {}", resource_name(&resource.id));
        Ok(())
    }

    async fn allocate(
        &self,
        instance: &ManagedInstance,
        previous: Option<&IpResource>,
    ) -> Result<IpResource> {
        let name = previous
            .map(|p| resource_name(&p.id).to_string())
            .unwrap_or_else(|| format!("{}-ip", instance.id));
        let label = previous.and_then(|p| p.hostname_label.clone());

        let mut body = json!({
            "location": instance.region,
            "sku": { "name": "Standard" },
            "properties": {
                "publicIPAllocationMethod": "Static",
                "publicIPAddressVersion": "IPv4",
            },
        });
        if let Some(ref label) = label {
            body["properties"]["dnsSettings"] = json!({ "domainNameLabel": label });
        }

        let id = self.public_ip_path(&name);
        self.put("allocate", &self.url(&id, NETWORK_API_VERSION), &body)
            .await?;

        tracing::info!("Created public IP {} in {}", name, instance.region);
        Ok(IpResource {
            id,
            hostname_label: label,
        })
    }

    async fn associate(&self, instance: &ManagedInstance, resource: &IpResource) -> Result<()> {
        let (nic_url, mut nic) = self.nic("associate", instance).await?;

        let props = nic
            .pointer_mut("/properties/ipConfigurations/0/properties")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                Error::compute(
                    PROVIDER,
                    "associate",
                    format!("NIC of VM {} has no IP configuration", instance.id),
                )
            })?;
        props.insert("publicIPAddress".to_string(), json!({ "id": resource.id }));
        self.put("associate", &nic_url, &nic).await?;

        tracing::info!(
            "Attached public IP {} to VM {}",
            resource_name(&resource.id),
            instance.id
        );
        Ok(())
    }

    fn supports_hostname_labels(&self) -> bool {
        true
    }

    async fn attach_hostname_label(&self, resource: &IpResource, label: &str) -> Result<()> {
        let url = self.url(&resource.id, NETWORK_API_VERSION);
        let mut public_ip = self.get("attach_label", &url).await?;
        if domain_name_label(&public_ip).as_deref() == Some(label) {
            return Ok(());
        }

        public_ip["properties"]["dnsSettings"] = json!({ "domainNameLabel": label });
        self.put("attach_label", &url, &public_ip).await?;

        tracing::info!(
            "Labelled public IP {} as {}",
            resource_name(&resource.id),
            label
        );
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// Factory for creating Azure providers
pub struct AzureFactory;

impl ComputeProviderFactory for AzureFactory {
    fn create(&self, config: &AccountConfig) -> Result<Box<dyn ComputeProvider>> {
        match &config.provider {
            ComputeConfig::Azure {
                tenant_id,
                client_id,
                client_secret,
                subscription_id,
                resource_group,
            } => {
                config.provider.validate()?;
                Ok(Box::new(AzureProvider::new(
                    tenant_id,
                    client_id,
                    client_secret,
                    subscription_id,
                    resource_group,
                )?))
            }
            _ => Err(Error::config("Invalid config for Azure provider")),
        }
    }
}

/// Register the Azure provider with a registry
pub fn register(registry: &ProviderRegistry) {
    registry.register_compute(PROVIDER, Box::new(AzureFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const TOKEN: &str = r#"{"token_type":"Bearer","expires_in":3599,"access_token":"tok-1"}"#;

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

    /// Serve canned replies in order, recording each request
    async fn serve(replies: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            while let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                log.lock().unwrap().push(request);
                let (status, body) = replies.next().unwrap_or((500, "{}".to_string()));
                let response = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
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

    fn provider(base: &str) -> AzureProvider {
        AzureProvider::new("tenant", "client", "shh-secret", "sub-1", "rg-1")
            .unwrap()
            .with_endpoints(base, base)
            .with_polling(Duration::ZERO, 5)
    }

    fn vm() -> String {
        json!({
            "name": "vm-1",
            "properties": { "networkProfile": { "networkInterfaces": [
                { "id": "/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.Network/networkInterfaces/vm-1-nic" }
            ]}}
        })
        .to_string()
    }

    fn nic(public_ip: Option<&str>) -> String {
        let mut props = json!({ "privateIPAddress": "10.0.0.4" });
        if let Some(id) = public_ip {
            props["publicIPAddress"] = json!({ "id": id });
        }
        json!({
            "name": "vm-1-nic",
            "location": "eastasia",
            "properties": {
                "provisioningState": "Succeeded",
                "ipConfigurations": [{ "name": "ipconfig1", "properties": props }]
            }
        })
        .to_string()
    }

    const PIP_ID: &str =
        "/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.Network/publicIPAddresses/vm-1-ip";

    fn instance() -> ManagedInstance {
        ManagedInstance::new("vm-1", "azure", "eastasia")
    }

    fn body_of(request: &str) -> Value {
        serde_json::from_str(request.split("\r\n\r\n").nth(1).unwrap()).unwrap()
    }

    #[test]
    fn test_factory_creation() {
        let config = AccountConfig {
            name: "azure-1".to_string(),
            region: "eastasia".to_string(),
            provider: ComputeConfig::Azure {
                tenant_id: "t".to_string(),
                client_id: "c".to_string(),
                client_secret: "s".to_string(),
                subscription_id: "sub".to_string(),
                resource_group: "rg".to_string(),
            },
            instances: vec!["vm-1".to_string()],
        };
        assert!(AzureFactory.create(&config).is_ok());

        let wrong = AccountConfig {
            provider: ComputeConfig::Lightsail {
                access_key_id: "a".to_string(),
                secret_access_key: "b".to_string(),
            },
            ..config
        };
        assert!(AzureFactory.create(&wrong).is_err());
    }

    #[test]
    fn test_secret_not_exposed_in_debug() {
        let provider = AzureProvider::new("t", "c", "shh-secret", "sub", "rg").unwrap();
        let debug_str = format!("{:?}", provider);
        assert!(!debug_str.contains("shh-secret"));
        assert!(provider.supports_hostname_labels());
    }

    #[tokio::test]
    async fn resolve_walks_vm_nic_and_public_ip() {
        let pip = json!({
            "name": "vm-1-ip",
            "properties": {
                "ipAddress": "20.1.2.3",
                "dnsSettings": { "domainNameLabel": "a1b2c3d4" }
            }
        })
        .to_string();
        let (base, seen) = serve(vec![
            (200, TOKEN.to_string()),
            (200, vm()),
            (200, nic(Some(PIP_ID))),
            (200, pip.clone()),
            (200, vm()),
            (200, nic(Some(PIP_ID))),
            (200, pip),
        ])
        .await;
        let provider = provider(&base);

        let resolved = provider.resolve_current_ip(&instance()).await.unwrap();
        assert_eq!(resolved.ip, Some("20.1.2.3".parse().unwrap()));
        let resource = resolved.resource.unwrap();
        assert_eq!(resource.id, PIP_ID);
        assert_eq!(resource.hostname_label.as_deref(), Some("a1b2c3d4"));

        // Token is cached for the second call
        provider.resolve_current_ip(&instance()).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 7);
        assert!(seen[0].starts_with("POST /tenant/oauth2/v2.0/token"));
        assert!(seen[0].contains("grant_type=client_credentials"));
        assert!(seen[1].starts_with(
            "GET /subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.Compute/virtualMachines/vm-1?api-version="
        ));
        assert!(seen[4].to_lowercase().contains("authorization: bearer tok-1"));
    }

    #[tokio::test]
    async fn vm_without_public_ip_resolves_to_nothing() {
        let (base, _) = serve(vec![
            (200, TOKEN.to_string()),
            (200, vm()),
            (200, nic(None)),
        ])
        .await;

        let resolved = provider(&base).resolve_current_ip(&instance()).await.unwrap();
        assert_eq!(resolved, ResolvedAddress::default());
    }

    #[tokio::test]
    async fn disassociate_without_public_ip_is_not_found() {
        let (base, seen) = serve(vec![
            (200, TOKEN.to_string()),
            (200, vm()),
            (200, nic(None)),
        ])
        .await;

        let err = provider(&base).disassociate(&instance()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!seen.lock().unwrap().iter().any(|r| r.starts_with("PUT")));
    }

    #[tokio::test]
    async fn disassociate_rewrites_the_nic() {
        let (base, seen) = serve(vec![
            (200, TOKEN.to_string()),
            (200, vm()),
            (200, nic(Some(PIP_ID))),
            (200, nic(None)),
            (200, nic(None)),
        ])
        .await;

        provider(&base).disassociate(&instance()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen[3].starts_with("PUT /subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.Network/networkInterfaces/vm-1-nic?"));
        let body = body_of(&seen[3]);
        assert!(body.pointer("/properties/ipConfigurations/0/properties/publicIPAddress").is_none());
        assert_eq!(
            body.pointer("/properties/ipConfigurations/0/properties/privateIPAddress"),
            Some(&json!("10.0.0.4"))
        );
    }

    #[tokio::test]
    async fn allocate_reuses_name_and_label() {
        let created = json!({ "properties": { "provisioningState": "Succeeded" } }).to_string();
        let updating = json!({ "properties": { "provisioningState": "Updating" } }).to_string();
        let (base, seen) = serve(vec![
            (200, TOKEN.to_string()),
            (201, updating.clone()),
            (200, updating),
            (200, created),
        ])
        .await;

        let previous = IpResource::new(PIP_ID).with_label("a1b2c3d4");
        let resource = provider(&base)
            .allocate(&instance(), Some(&previous))
            .await
            .unwrap();

        assert_eq!(resource, previous);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4, "polled until Succeeded");
        assert!(seen[1].starts_with(&format!("PUT {}?api-version=", PIP_ID)));
        let body = body_of(&seen[1]);
        assert_eq!(body["location"], "eastasia");
        assert_eq!(body["properties"]["publicIPAllocationMethod"], "Static");
        assert_eq!(body["properties"]["dnsSettings"]["domainNameLabel"], "a1b2c3d4");
    }

    #[tokio::test]
    async fn first_allocation_is_named_after_the_vm() {
        let created = json!({ "properties": { "provisioningState": "Succeeded" } }).to_string();
        let (base, _) = serve(vec![
            (200, TOKEN.to_string()),
            (201, created.clone()),
            (200, created),
        ])
        .await;

        let resource = provider(&base).allocate(&instance(), None).await.unwrap();
        assert_eq!(resource.id, PIP_ID);
        assert_eq!(resource.hostname_label, None);
    }

    #[tokio::test]
    async fn failed_provisioning_is_an_error() {
        let failed = json!({ "properties": { "provisioningState": "Failed" } }).to_string();
        let (base, _) = serve(vec![
            (200, TOKEN.to_string()),
            (201, failed.clone()),
            (200, failed),
        ])
        .await;

        let err = provider(&base).allocate(&instance(), None).await.unwrap_err();
        assert!(matches!(err, Error::Compute { .. }));
    }

    #[tokio::test]
    async fn release_waits_until_the_resource_is_gone() {
        let (base, seen) = serve(vec![
            (200, TOKEN.to_string()),
            (202, String::new()),
            (200, json!({ "properties": { "provisioningState": "Deleting" } }).to_string()),
            (404, json!({ "error": { "code": "ResourceNotFound" } }).to_string()),
        ])
        .await;

        provider(&base)
            .release(&IpResource::new(PIP_ID))
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen[1].starts_with(&format!("DELETE {}?", PIP_ID)));
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal_for_the_account() {
        let (base, _) = serve(vec![(
            401,
            r#"{"error":"invalid_client"}"#.to_string(),
        )])
        .await;

        let err = provider(&base)
            .resolve_current_ip(&instance())
            .await
            .unwrap_err();
        assert!(err.is_fatal_for_account());
    }
}
