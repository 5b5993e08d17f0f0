// # DNS Provider Trait
//
// Defines the record-level interface the reconciler drives.
//
// ## Implementations
//
// - Cloudflare: `ipfleet-dns-cloudflare` crate
// - Alibaba Cloud DNS: `ipfleet-dns-aliyun` crate

use crate::config::RecordType;
use async_trait::async_trait;
use std::net::IpAddr;

/// A record as reported by the DNS provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Opaque provider record id
    pub id: String,
    /// Subdomain label relative to the zone ("@" for the apex)
    pub label: String,
    /// Record type as reported ("A", "AAAA", "CNAME", ...)
    pub record_type: String,
    /// Record value
    pub value: String,
    /// Time-to-live, if reported
    pub ttl: Option<u32>,
    /// Routing line, if the provider has the concept
    pub line: Option<String>,
}

impl DnsRecord {
    /// The record value as an IP address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.value.parse().ok()
    }

    /// Whether the record belongs to the (label, type) pair being reconciled
    pub fn matches(&self, label: &str, record_type: RecordType) -> bool {
        self.label.eq_ignore_ascii_case(label)
            && self.record_type.eq_ignore_ascii_case(record_type.as_str())
    }
}

/// A record the reconciler wants created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDnsRecord {
    pub label: String,
    pub record_type: RecordType,
    pub value: IpAddr,
    pub ttl: u32,
    pub line: String,
}

/// Trait for DNS provider implementations
///
/// Providers execute single API calls and report failures; the reconciler
/// decides what to add or delete. A mutation that fails only because the
/// target state already holds (duplicate add, delete of a missing record)
/// should be reported as `Error::Conflict` / `Error::NotFound`.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// List every record in the zone for `domain`
    async fn list_records(&self, domain: &str) -> Result<Vec<DnsRecord>, crate::Error>;

    /// Add a record to the zone for `domain`
    async fn add_record(&self, domain: &str, record: &NewDnsRecord) -> Result<(), crate::Error>;

    /// Delete a record by its opaque id
    async fn delete_record(&self, domain: &str, record_id: &str) -> Result<(), crate::Error>;

    /// Whether the provider honours routing lines on add
    fn supports_routing_lines(&self) -> bool {
        false
    }

    /// Provider name (for logging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing DNS providers from configuration
pub trait DnsProviderFactory: Send + Sync {
    /// Create a DnsProvider instance from configuration
    fn create(
        &self,
        config: &crate::config::DnsConfig,
    ) -> Result<Box<dyn DnsProvider>, crate::Error>;
}
