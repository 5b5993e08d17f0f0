// # Cloudflare DNS Provider
//
// Record-level Cloudflare backend for the DNS reconciler.
//
// ## Behaviour
//
// - ✅ One HTTP request per operation (plus a zone lookup when no zone ID is configured)
// - ✅ Paged listing of every record in the zone
// - ✅ Labels reported relative to the zone ("@" for the apex)
// - ✅ Status codes mapped onto `ipfleet_core::Error` variants
// - ✅ Dry-run mode: listing is real, mutations are only logged
// - ❌ Routing lines (Cloudflare has none; the line is ignored on add)
// - ❌ Retry logic (callers own it)
//
// ## Security Requirements
//
// - API token NEVER appears in logs or Debug output
//
// ## API Reference
//
// - List Zones: GET `/zones?name=...`
// - List DNS Records: GET `/zones/:zone_id/dns_records?page=..&per_page=..`
// - Create DNS Record: POST `/zones/:zone_id/dns_records`
// - Delete DNS Record: DELETE `/zones/:zone_id/dns_records/:record_id`

use async_trait::async_trait;
use ipfleet_core::config::DnsConfig;
use ipfleet_core::traits::{DnsProvider, DnsProviderFactory, DnsRecord, NewDnsRecord};
use ipfleet_core::{Error, ProviderRegistry, Result};
use serde::Deserialize;
use std::time::Duration;

/// Cloudflare API base URL
const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Records requested per listing page
const PAGE_SIZE: u32 = 100;

const PROVIDER: &str = "cloudflare";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    page: u32,
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
    ttl: Option<u32>,
}

/// Cloudflare DNS provider
///
/// # Dry-Run Mode
///
/// When `dry_run` is true the provider still performs every GET request
/// (zone lookup, record listing) but only logs the POST/DELETE it would send.
pub struct CloudflareProvider {
    /// Cloudflare API token
    /// ⚠️ NEVER log this value
    api_token: String,

    /// Zone ID (optional, looked up from the domain otherwise)
    zone_id: Option<String>,

    /// API base URL
    api_base: String,

    /// HTTP client for API requests
    client: reqwest::Client,

    /// Dry-run mode: if true, perform GET requests but skip mutations
    dry_run: bool,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for CloudflareProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareProvider")
            .field("api_token", &"<REDACTED>")
            .field("zone_id", &self.zone_id)
            .field("api_base", &self.api_base)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl CloudflareProvider {
    /// Create a new Cloudflare provider
    ///
    /// # Parameters
    ///
    /// - `api_token`: Cloudflare API token with Zone:DNS:Edit permissions
    /// - `zone_id`: Optional zone ID (looked up from the domain otherwise)
    /// - `dry_run`: If true, list records but only log mutations
    pub fn new(
        api_token: impl Into<String>,
        zone_id: Option<String>,
        dry_run: bool,
    ) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.is_empty() {
            return Err(Error::config("Cloudflare API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_token,
            zone_id,
            api_base: CLOUDFLARE_API_BASE.to_string(),
            client,
            dry_run,
        })
    }

    /// Point the provider at a different API base URL
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Whether mutations are only logged
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Get the zone ID for a domain
    ///
    /// Returns the configured zone ID when present, otherwise asks
    /// `GET /zones?name=<domain>`.
    async fn zone_id(&self, domain: &str) -> Result<String> {
        if let Some(ref zone_id) = self.zone_id {
            return Ok(zone_id.clone());
        }

        tracing::debug!("Looking up zone ID for domain: {}", domain);

        let response = self
            .client
            .get(format!("{}/zones", self.api_base))
            .query(&[("name", domain)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| transport_error("zone lookup", e))?;
        let response = check_status(response, "zone lookup").await?;

        let envelope: Envelope<Vec<Zone>> = response
            .json()
            .await
            .map_err(|e| Error::dns(PROVIDER, format!("Failed to parse zone list: {}", e)))?;

        let zone = envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("Zone not found: {}", domain)))?;

        tracing::debug!("Found zone ID: {}", zone.id);
        Ok(zone.id)
    }

    fn records_url(&self, zone_id: &str) -> String {
        format!("{}/zones/{}/dns_records", self.api_base, zone_id)
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn list_records(&self, domain: &str) -> Result<Vec<DnsRecord>> {
        let zone_id = self.zone_id(domain).await?;
        let url = self.records_url(&zone_id);

        let mut records = Vec::new();
        let mut page = 1u32;
        loop {
            let response = self
                .client
                .get(&url)
                .query(&[("page", page), ("per_page", PAGE_SIZE)])
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|e| transport_error("list records", e))?;
            let response = check_status(response, "list records").await?;

            let envelope: Envelope<Vec<CloudflareRecord>> = response.json().await.map_err(|e| {
                Error::dns(PROVIDER, format!("Failed to parse record list: {}", e))
            })?;

            records.extend(
                envelope
                    .result
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| DnsRecord {
                        label: relative_label(&r.name, domain),
                        id: r.id,
                        record_type: r.record_type,
                        value: r.content,
                        ttl: r.ttl,
                        line: None,
                    }),
            );

            match envelope.result_info {
                Some(info) if info.page < info.total_pages => page = info.page + 1,
                _ => break,
            }
        }

        tracing::debug!("Listed {} records in zone {}", records.len(), domain);
        Ok(records)
    }

    async fn add_record(&self, domain: &str, record: &NewDnsRecord) -> Result<()> {
        let payload = serde_json::json!({
            "type": record.record_type.as_str(),
            "name": absolute_name(&record.label, domain),
            "content": record.value.to_string(),
            "ttl": record.ttl,
            "proxied": false,
        });

        if self.dry_run {
            tracing::info!("[DRY-RUN] Would create record in {}: {}", domain, payload);
            return Ok(());
        }

        let zone_id = self.zone_id(domain).await?;
        let response = self
            .client
            .post(self.records_url(&zone_id))
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error("create record", e))?;
        check_status(response, "create record").await?;

        tracing::info!(
            "Created {} record {}.{} -> {}",
            record.record_type,
            record.label,
            domain,
            record.value
        );
        Ok(())
    }

    async fn delete_record(&self, domain: &str, record_id: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!("[DRY-RUN] Would delete record {} in {}", record_id, domain);
            return Ok(());
        }

        let zone_id = self.zone_id(domain).await?;
        let response = self
            .client
            .delete(format!("{}/{}", self.records_url(&zone_id), record_id))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| transport_error("delete record", e))?;
        check_status(response, "delete record").await?;

        tracing::info!("Deleted record {} in {}", record_id, domain);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

fn transport_error(context: &str, e: reqwest::Error) -> Error {
    Error::dns(PROVIDER, format!("{}: HTTP request failed: {}", context, e))
}

/// Pass successful responses through, map everything else onto an error
async fn check_status(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());
    Err(map_status(status.as_u16(), &body, context))
}

fn map_status(status: u16, body: &str, context: &str) -> Error {
    match status {
        401 | 403 => Error::auth(format!(
            "{}: invalid API token or insufficient permissions (status {})",
            context, status
        )),
        404 => Error::not_found(format!("{}: {}", context, body)),
        409 => Error::conflict(format!("{}: {}", context, body)),
        429 => Error::rate_limited(format!("{}: status {}", context, status)),
        400 if body.contains("already exists") => {
            Error::conflict(format!("{}: record already exists", context))
        }
        500..=599 => Error::dns(
            PROVIDER,
            format!("{}: server error (transient) {} - {}", context, status, body),
        ),
        _ => Error::dns(PROVIDER, format!("{}: {} - {}", context, status, body)),
    }
}

/// `proxy.example.com` relative to `example.com` is `proxy`; the apex is `@`
fn relative_label(name: &str, domain: &str) -> String {
    let name = name.trim_end_matches('.');
    if name.eq_ignore_ascii_case(domain) {
        return "@".to_string();
    }
    let lower = name.to_ascii_lowercase();
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    match lower.strip_suffix(&suffix) {
        Some(head) if !head.is_empty() => name[..head.len()].to_string(),
        _ => name.to_string(),
    }
}

fn absolute_name(label: &str, domain: &str) -> String {
    if label == "@" {
        domain.to_string()
    } else {
        format!("{}.{}", label, domain)
    }
}

/// Factory for creating Cloudflare providers
pub struct CloudflareFactory;

impl DnsProviderFactory for CloudflareFactory {
    fn create(&self, config: &DnsConfig) -> Result<Box<dyn DnsProvider>> {
        match config {
            DnsConfig::Cloudflare {
                api_token,
                zone_id,
                dry_run,
            } => {
                if *dry_run {
                    tracing::warn!(
                        "Cloudflare provider running in DRY-RUN mode - no changes will be made"
                    );
                }
                Ok(Box::new(CloudflareProvider::new(
                    api_token.clone(),
                    zone_id.clone(),
                    *dry_run,
                )?))
            }
            _ => Err(Error::config("Invalid config for Cloudflare provider")),
        }
    }
}

/// Register the Cloudflare provider with a registry
///
/// # Example
///
/// ```rust
/// use ipfleet_core::ProviderRegistry;
///
/// let registry = ProviderRegistry::new();
/// ipfleet_dns_cloudflare::register(&registry);
/// assert!(registry.has_dns("cloudflare"));
/// ```
pub fn register(registry: &ProviderRegistry) {
    registry.register_dns(PROVIDER, Box::new(CloudflareFactory));
}
