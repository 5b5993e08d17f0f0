//! Configuration types for the fleet controller
//!
//! The fleet (accounts, credentials, instance ids) comes from a JSON file
//! loaded once at startup; the runtime knobs are assembled by the daemon from
//! its environment. Both end up in a validated [`FleetConfig`].

use crate::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

/// Main controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Provider accounts and the instances they own
    pub accounts: Vec<AccountConfig>,

    /// DNS provider configuration
    pub dns: DnsConfig,

    /// Reachability probe configuration
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Target record set
    pub record: RecordConfig,

    /// Control loop settings
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl FleetConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.accounts.is_empty() {
            return Err(crate::Error::config("No provider accounts configured"));
        }

        let mut names = std::collections::HashSet::new();
        for account in &self.accounts {
            account.validate()?;
            if !names.insert(account.name.as_str()) {
                return Err(crate::Error::config(format!(
                    "Duplicate account name: {}",
                    account.name
                )));
            }
        }

        self.dns.validate()?;
        self.probe.validate()?;
        self.record.validate()?;
        self.controller.validate()?;

        Ok(())
    }
}

/// On-disk fleet description: one entry per provider account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetFile {
    pub accounts: Vec<AccountConfig>,
}

impl FleetFile {
    /// Parse a fleet description from JSON text
    pub fn from_json_str(text: &str) -> Result<Self, crate::Error> {
        let file: FleetFile = serde_json::from_str(text)?;
        for account in &file.accounts {
            account.validate()?;
        }
        Ok(file)
    }

    /// Load and validate a fleet description from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::config(format!("Cannot read fleet file {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }
}

/// One provider account: credentials, location and managed instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Operator-facing account name (used in logs)
    pub name: String,

    /// Region the account's instances and IP resources live in
    pub region: String,

    /// Provider backend and credentials
    pub provider: ComputeConfig,

    /// Provider-scoped instance identifiers (VM names, Lightsail instance names, EC2 instance ids)
    pub instances: Vec<String>,
}

impl AccountConfig {
    /// Validate the account configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::config("Account name cannot be empty"));
        }
        if self.region.is_empty() {
            return Err(crate::Error::config(format!(
                "Account {} has an empty region",
                self.name
            )));
        }
        if self.instances.is_empty() {
            return Err(crate::Error::config(format!(
                "Account {} has no instances",
                self.name
            )));
        }
        if self.instances.iter().any(|id| id.trim().is_empty()) {
            return Err(crate::Error::config(format!(
                "Account {} lists an empty instance id",
                self.name
            )));
        }
        self.provider.validate()
    }
}

/// Compute provider backend configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputeConfig {
    /// Azure Resource Manager (service principal credentials)
    Azure {
        tenant_id: String,
        client_id: String,
        client_secret: String,
        subscription_id: String,
        resource_group: String,
    },

    /// AWS Lightsail
    Lightsail {
        access_key_id: String,
        secret_access_key: String,
    },

    /// AWS EC2 (Elastic IPs)
    Ec2 {
        access_key_id: String,
        secret_access_key: String,
    },

    /// Custom compute provider
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ComputeConfig {
    /// Validate the compute provider configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ComputeConfig::Azure {
                tenant_id,
                client_id,
                client_secret,
                subscription_id,
                resource_group,
            } => {
                let fields = [
                    ("tenant_id", tenant_id),
                    ("client_id", client_id),
                    ("client_secret", client_secret),
                    ("subscription_id", subscription_id),
                    ("resource_group", resource_group),
                ];
                if let Some((name, _)) = fields.iter().find(|(_, value)| value.is_empty()) {
                    return Err(crate::Error::config(format!(
                        "Azure {} cannot be empty",
                        name
                    )));
                }
                Ok(())
            }
            ComputeConfig::Lightsail {
                access_key_id,
                secret_access_key,
            } => {
                if access_key_id.is_empty() || secret_access_key.is_empty() {
                    return Err(crate::Error::config(
                        "Lightsail access_key_id and secret_access_key are required",
                    ));
                }
                Ok(())
            }
            ComputeConfig::Ec2 {
                access_key_id,
                secret_access_key,
            } => {
                if access_key_id.is_empty() || secret_access_key.is_empty() {
                    return Err(crate::Error::config(
                        "EC2 access_key_id and secret_access_key are required",
                    ));
                }
                Ok(())
            }
            ComputeConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom compute provider factory cannot be empty",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the provider type name (registry key)
    pub fn type_name(&self) -> &str {
        match self {
            ComputeConfig::Azure { .. } => "azure",
            ComputeConfig::Lightsail { .. } => "lightsail",
            ComputeConfig::Ec2 { .. } => "ec2",
            ComputeConfig::Custom { factory, .. } => factory,
        }
    }
}

impl std::fmt::Debug for ComputeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeConfig::Azure {
                tenant_id,
                client_id,
                subscription_id,
                resource_group,
                ..
            } => f
                .debug_struct("Azure")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<REDACTED>")
                .field("subscription_id", subscription_id)
                .field("resource_group", resource_group)
                .finish(),
            ComputeConfig::Lightsail { access_key_id, .. } => f
                .debug_struct("Lightsail")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"<REDACTED>")
                .finish(),
            ComputeConfig::Ec2 { access_key_id, .. } => f
                .debug_struct("Ec2")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"<REDACTED>")
                .finish(),
            ComputeConfig::Custom { factory, .. } => f
                .debug_struct("Custom")
                .field("factory", factory)
                .finish_non_exhaustive(),
        }
    }
}

/// DNS provider configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsConfig {
    /// Cloudflare provider
    Cloudflare {
        /// Cloudflare API token
        api_token: String,
        /// Zone ID (optional, looked up from the domain otherwise)
        zone_id: Option<String>,
        /// Log mutations instead of performing them
        #[serde(default)]
        dry_run: bool,
    },

    /// Alibaba Cloud DNS provider
    Aliyun {
        access_key_id: String,
        access_key_secret: String,
        /// API endpoint host (defaults to alidns.aliyuncs.com)
        endpoint: Option<String>,
        /// Log mutations instead of performing them
        #[serde(default)]
        dry_run: bool,
    },

    /// Custom provider
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl DnsConfig {
    /// Validate the DNS provider configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            DnsConfig::Cloudflare { api_token, .. } => {
                if api_token.is_empty() {
                    return Err(crate::Error::config("Cloudflare API token cannot be empty"));
                }
                Ok(())
            }
            DnsConfig::Aliyun {
                access_key_id,
                access_key_secret,
                ..
            } => {
                if access_key_id.is_empty() || access_key_secret.is_empty() {
                    return Err(crate::Error::config(
                        "Aliyun access_key_id and access_key_secret are required",
                    ));
                }
                Ok(())
            }
            DnsConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom DNS provider factory cannot be empty",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the provider type name (registry key)
    pub fn type_name(&self) -> &str {
        match self {
            DnsConfig::Cloudflare { .. } => "cloudflare",
            DnsConfig::Aliyun { .. } => "aliyun",
            DnsConfig::Custom { factory, .. } => factory,
        }
    }
}

impl std::fmt::Debug for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsConfig::Cloudflare {
                zone_id, dry_run, ..
            } => f
                .debug_struct("Cloudflare")
                .field("api_token", &"<REDACTED>")
                .field("zone_id", zone_id)
                .field("dry_run", dry_run)
                .finish(),
            DnsConfig::Aliyun {
                access_key_id,
                endpoint,
                dry_run,
                ..
            } => f
                .debug_struct("Aliyun")
                .field("access_key_id", access_key_id)
                .field("access_key_secret", &"<REDACTED>")
                .field("endpoint", endpoint)
                .field("dry_run", dry_run)
                .finish(),
            DnsConfig::Custom { factory, .. } => f
                .debug_struct("Custom")
                .field("factory", factory)
                .finish_non_exhaustive(),
        }
    }
}

/// Reachability probe backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeBackend {
    /// Connect directly from this host
    #[default]
    Tcp,

    /// Delegate to a remote probe service (`GET <url>/check_port`)
    Http {
        /// Base URL of the probe service (e.g. "http://10.0.0.5:10080")
        url: String,
    },

    /// Custom probe
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ProbeBackend {
    /// Get the probe type name (registry key)
    pub fn type_name(&self) -> &str {
        match self {
            ProbeBackend::Tcp => "tcp",
            ProbeBackend::Http { .. } => "http",
            ProbeBackend::Custom { factory, .. } => factory,
        }
    }
}

/// Reachability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe backend
    #[serde(default)]
    pub backend: ProbeBackend,

    /// Health-check port probed on every instance
    #[serde(default = "default_probe_port")]
    pub port: u16,

    /// Attempts per check before the instance is declared unreachable
    #[serde(default = "default_probe_retries")]
    pub retries: u32,

    /// Timeout of a single attempt (in seconds)
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,

    /// Pause between attempts (in milliseconds)
    #[serde(default = "default_probe_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl ProbeConfig {
    /// Validate the probe configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.port == 0 {
            return Err(crate::Error::config("Probe port must be > 0"));
        }
        if self.retries == 0 {
            return Err(crate::Error::config("Probe retries must be > 0"));
        }
        if self.timeout_secs == 0 {
            return Err(crate::Error::config("Probe timeout must be > 0"));
        }
        match &self.backend {
            ProbeBackend::Http { url } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(crate::Error::config(format!(
                        "Probe service URL must use HTTP or HTTPS scheme. Got: {}",
                        url
                    )));
                }
                Ok(())
            }
            ProbeBackend::Custom { factory, .. } if factory.is_empty() => Err(
                crate::Error::config("Custom probe factory cannot be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// Backoff policy for the prober: constant pause between attempts
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::constant(
            self.retries,
            std::time::Duration::from_millis(self.retry_delay_ms),
        )
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backend: ProbeBackend::default(),
            port: default_probe_port(),
            retries: default_probe_retries(),
            timeout_secs: default_probe_timeout_secs(),
            retry_delay_ms: default_probe_retry_delay_ms(),
        }
    }
}

fn default_probe_port() -> u16 {
    22
}

fn default_probe_retries() -> u32 {
    3
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_probe_retry_delay_ms() -> u64 {
    1000
}

/// Target record set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Zone / registered domain (e.g. "example.com")
    pub domain: String,

    /// Subdomain label inside the zone (e.g. "proxy", "@" for the apex)
    pub label: String,

    /// Record type
    #[serde(default)]
    pub record_type: RecordType,

    /// TTL for records added by the reconciler (in seconds)
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Region → routing line mapping
    #[serde(default)]
    pub lines: RoutingLines,
}

impl RecordConfig {
    /// Create a record configuration with default type, TTL and lines
    pub fn new(domain: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            label: label.into(),
            record_type: RecordType::default(),
            ttl: default_ttl(),
            lines: RoutingLines::default(),
        }
    }

    /// Set the TTL
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the routing lines
    pub fn with_lines(mut self, lines: RoutingLines) -> Self {
        self.lines = lines;
        self
    }

    /// Validate the record configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.domain.is_empty() || !self.domain.contains('.') {
            return Err(crate::Error::config(format!(
                "Invalid target domain: '{}'",
                self.domain
            )));
        }
        if self.label.is_empty() {
            return Err(crate::Error::config("Target label cannot be empty"));
        }
        if self.ttl == 0 {
            return Err(crate::Error::config("Record TTL must be > 0"));
        }
        Ok(())
    }
}

fn default_ttl() -> u32 {
    600
}

/// DNS record type managed by the reconciler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// A record (IPv4)
    #[default]
    A,
    /// AAAA record (IPv6)
    #[serde(rename = "AAAA")]
    Aaaa,
}

impl RecordType {
    /// Wire name of the record type
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }

    /// Whether an address family fits this record type
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            RecordType::A => ip.is_ipv4(),
            RecordType::Aaaa => ip.is_ipv6(),
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            other => Err(crate::Error::config(format!(
                "Unsupported record type '{}'. Supported: A, AAAA",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static region → DNS routing line mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingLines {
    /// Line used for regions without an explicit mapping
    #[serde(default = "default_line")]
    pub default_line: String,

    /// Explicit per-region lines
    #[serde(default)]
    pub by_region: BTreeMap<String, String>,
}

impl RoutingLines {
    /// Parse a `region=line,region=line` list
    pub fn parse(spec: &str, default_line: impl Into<String>) -> Result<Self, crate::Error> {
        let mut by_region = BTreeMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (region, line) = pair.split_once('=').ok_or_else(|| {
                crate::Error::config(format!(
                    "Routing line entry '{}' must look like region=line",
                    pair
                ))
            })?;
            let (region, line) = (region.trim(), line.trim());
            if region.is_empty() || line.is_empty() {
                return Err(crate::Error::config(format!(
                    "Routing line entry '{}' has an empty side",
                    pair
                )));
            }
            by_region.insert(region.to_string(), line.to_string());
        }
        Ok(Self {
            default_line: default_line.into(),
            by_region,
        })
    }

    /// Routing line for a region, falling back to the default line
    pub fn line_for(&self, region: Option<&str>) -> &str {
        region
            .and_then(|r| self.by_region.get(r))
            .map(String::as_str)
            .unwrap_or(&self.default_line)
    }
}

impl Default for RoutingLines {
    fn default() -> Self {
        Self {
            default_line: default_line(),
            by_region: BTreeMap::new(),
        }
    }
}

fn default_line() -> String {
    "default".to_string()
}

/// Control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Sleep between the end of one tick and the start of the next (in seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Accounts processed in parallel within a tick (1 = sequential pass)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Backoff applied to each provider call of a rotation
    #[serde(default = "BackoffPolicy::rotation_default")]
    pub rotation: BackoffPolicy,

    /// Capacity of the controller event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ControllerConfig {
    /// Validate the control loop configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_secs == 0 {
            return Err(crate::Error::config("Poll interval must be > 0"));
        }
        if self.concurrency == 0 {
            return Err(crate::Error::config("Concurrency must be >= 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        self.rotation.validate()
    }

    /// Poll interval as a duration
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            concurrency: default_concurrency(),
            rotation: BackoffPolicy::rotation_default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    1
}

fn default_event_channel_capacity() -> usize {
    1000
}
