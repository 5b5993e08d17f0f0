// # Alibaba Cloud DNS Provider
//
// Record-level Alidns backend for the DNS reconciler.
//
// ## Behaviour
//
// - ✅ One signed OpenAPI call per operation (listing pages through the zone)
// - ✅ Routing lines honoured on add (`Line` parameter)
// - ✅ API error codes mapped onto `ipfleet_core::Error` variants
// - ✅ Dry-run mode: listing is real, mutations are only logged
// - ❌ Retry logic (callers own it)
//
// ## API Reference
//
// - DescribeDomainRecords: `DomainName`, `PageNumber`, `PageSize`
// - AddDomainRecord: `DomainName`, `RR`, `Type`, `Value`, `TTL`, `Line`
// - DeleteDomainRecord: `RecordId`
//
// Requests are signed with ACS3-HMAC-SHA256 (see `signature`).

mod signature;

use async_trait::async_trait;
use ipfleet_core::config::DnsConfig;
use ipfleet_core::traits::{DnsProvider, DnsProviderFactory, DnsRecord, NewDnsRecord};
use ipfleet_core::{Error, ProviderRegistry, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use signature::Signer;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default Alidns endpoint
pub const DEFAULT_ENDPOINT: &str = "alidns.aliyuncs.com";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum page size accepted by DescribeDomainRecords
const PAGE_SIZE: u64 = 500;

const PROVIDER: &str = "aliyun";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDomainRecordsResponse {
    #[serde(default)]
    total_count: u64,
    domain_records: RecordList,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordList {
    #[serde(default)]
    record: Vec<AliyunRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AliyunRecord {
    record_id: String,
    #[serde(rename = "RR")]
    rr: String,
    #[serde(rename = "Type")]
    record_type: String,
    value: String,
    #[serde(rename = "TTL")]
    ttl: Option<u32>,
    line: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Ignored {}

/// Alibaba Cloud DNS provider
pub struct AliyunProvider {
    access_key_id: String,

    /// ⚠️ NEVER log this value
    access_key_secret: String,

    /// `scheme://host` of the API endpoint
    base_url: String,

    /// Host component of `base_url` (signed)
    host: String,

    client: reqwest::Client,

    dry_run: bool,
}

impl std::fmt::Debug for AliyunProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliyunProvider")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl AliyunProvider {
    /// Create a new Alidns provider
    ///
    /// `endpoint` is a bare host (defaults to [`DEFAULT_ENDPOINT`]); a value
    /// carrying a scheme is used as-is.
    pub fn new(
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
        endpoint: Option<&str>,
        dry_run: bool,
    ) -> Result<Self> {
        let access_key_id = access_key_id.into();
        let access_key_secret = access_key_secret.into();
        if access_key_id.is_empty() || access_key_secret.is_empty() {
            return Err(Error::config(
                "Aliyun access_key_id and access_key_secret are required",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
        let base_url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint)
        };
        let host = base_url
            .split_once("://")
            .map(|(_, host)| host.to_string())
            .unwrap_or_default();

        Ok(Self {
            access_key_id,
            access_key_secret,
            base_url,
            host,
            client,
            dry_run,
        })
    }

    /// Whether mutations are only logged
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Perform one signed RPC call and decode the JSON response
    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        params: BTreeMap<String, String>,
    ) -> Result<T> {
        let date = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let nonce = format!("{:032x}", rand::random::<u128>());

        let signed = Signer {
            access_key_id: &self.access_key_id,
            access_key_secret: &self.access_key_secret,
        }
        .sign("POST", &self.host, action, &params, &date, &nonce)?;

        let mut request = self
            .client
            .post(format!("{}/?{}", self.base_url, signed.query));
        for (name, value) in &signed.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::dns(PROVIDER, format!("{}: HTTP request failed: {}", action, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::dns(PROVIDER, format!("{}: failed to read response: {}", action, e)))?;

        if !status.is_success() {
            let api_error: ApiError = serde_json::from_str(&body).unwrap_or(ApiError {
                code: String::new(),
                message: body.clone(),
            });
            return Err(map_error(status.as_u16(), &api_error, action));
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::dns(PROVIDER, format!("{}: invalid response: {}", action, e)))
    }
}

fn map_error(status: u16, error: &ApiError, action: &str) -> Error {
    let detail = format!("{}: {} {}", action, error.code, error.message);
    let code = error.code.as_str();

    if code == "DomainRecordDuplicate" {
        return Error::conflict(detail);
    }
    if code == "DomainRecordNotBelongToUser"
        || (code.ends_with(".NotFound") && code.contains("Record"))
    {
        return Error::not_found(detail);
    }
    if code.starts_with("InvalidAccessKeyId")
        || code.starts_with("SignatureDoesNotMatch")
        || code.starts_with("IncompleteSignature")
        || code.starts_with("Forbidden")
        || status == 401
        || status == 403
    {
        return Error::auth(detail);
    }
    if code.starts_with("Throttling") || status == 429 {
        return Error::rate_limited(detail);
    }
    Error::dns(PROVIDER, format!("{} (status {})", detail, status))
}

#[async_trait]
impl DnsProvider for AliyunProvider {
    async fn list_records(&self, domain: &str) -> Result<Vec<DnsRecord>> {
        let mut records = Vec::new();
        let mut page = 1u64;

        loop {
            let mut params = BTreeMap::new();
            params.insert("DomainName".to_string(), domain.to_string());
            params.insert("PageNumber".to_string(), page.to_string());
            params.insert("PageSize".to_string(), PAGE_SIZE.to_string());

            let response: DescribeDomainRecordsResponse =
                self.call("DescribeDomainRecords", params).await?;
            let batch = response.domain_records.record;
            let batch_len = batch.len() as u64;

            records.extend(batch.into_iter().map(|r| DnsRecord {
                id: r.record_id,
                label: r.rr,
                record_type: r.record_type,
                value: r.value,
                ttl: r.ttl,
                line: r.line,
            }));

            if batch_len == 0 || records.len() as u64 >= response.total_count {
                break;
            }
            page += 1;
        }

        tracing::debug!("Listed {} records in zone {}", records.len(), domain);
        Ok(records)
    }

    async fn add_record(&self, domain: &str, record: &NewDnsRecord) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), domain.to_string());
        params.insert("RR".to_string(), record.label.clone());
        params.insert("Type".to_string(), record.record_type.as_str().to_string());
        params.insert("Value".to_string(), record.value.to_string());
        params.insert("TTL".to_string(), record.ttl.to_string());
        params.insert("Line".to_string(), record.line.clone());

        if self.dry_run {
            tracing::info!("[DRY-RUN] Would call AddDomainRecord with {:?}", params);
            return Ok(());
        }

        let _: Ignored = self.call("AddDomainRecord", params).await?;
        tracing::info!(
            "Added {} record {}.{} -> {} (line {})",
            record.record_type,
            record.label,
            domain,
            record.value,
            record.line
        );
        Ok(())
    }

    async fn delete_record(&self, domain: &str, record_id: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!("[DRY-RUN] Would delete record {} in {}", record_id, domain);
            return Ok(());
        }

        let mut params = BTreeMap::new();
        params.insert("RecordId".to_string(), record_id.to_string());

        let _: Ignored = self.call("DeleteDomainRecord", params).await?;
        tracing::info!("Deleted record {} in {}", record_id, domain);
        Ok(())
    }

    fn supports_routing_lines(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// Factory for creating Alidns providers
pub struct AliyunFactory;

impl DnsProviderFactory for AliyunFactory {
    fn create(&self, config: &DnsConfig) -> Result<Box<dyn DnsProvider>> {
        match config {
            DnsConfig::Aliyun {
                access_key_id,
                access_key_secret,
                endpoint,
                dry_run,
            } => {
                if *dry_run {
                    tracing::warn!(
                        "Aliyun provider running in DRY-RUN mode - no changes will be made"
                    );
                }
                Ok(Box::new(AliyunProvider::new(
                    access_key_id.clone(),
                    access_key_secret.clone(),
                    endpoint.as_deref(),
                    *dry_run,
                )?))
            }
            _ => Err(Error::config("Invalid config for Aliyun provider")),
        }
    }
}

/// Register the Alidns provider with a registry
pub fn register(registry: &ProviderRegistry) {
    registry.register_dns(PROVIDER, Box::new(AliyunFactory));
}
