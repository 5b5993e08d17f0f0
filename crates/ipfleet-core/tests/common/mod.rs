//! Test doubles and common utilities for controller contract tests
//!
//! - [`ScriptedProbe`]: reachability answers driven by a set of "down" IPs
//! - [`MockCloud`]: in-memory compute provider with failure injection
//! - [`MockZone`]: in-memory DNS zone that counts mutations

#![allow(dead_code)]

use ipfleet_core::config::ProbeBackend;
use ipfleet_core::error::{Error, Result};
use ipfleet_core::traits::{
    ComputeProvider, ComputeProviderFactory, DnsProvider, DnsProviderFactory, DnsRecord,
    NewDnsRecord, ProbeFactory, ReachabilityProbe,
};
use ipfleet_core::{
    AccountConfig, BackoffPolicy, ComputeConfig, ControllerConfig, DnsConfig, IpResource,
    ManagedInstance, ProbeConfig, ProviderRegistry, RecordConfig, RecordType, ResolvedAddress,
    RoutingLines,
};
use ipfleet_core::config::FleetConfig;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DOMAIN: &str = "example.com";
pub const LABEL: &str = "proxy";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Probe that fails every attempt for IPs marked down
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    down: Arc<Mutex<HashSet<IpAddr>>>,
    attempts: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, ip: IpAddr) {
        self.down.lock().unwrap().insert(ip);
    }

    pub fn set_up(&self, ip: IpAddr) {
        self.down.lock().unwrap().remove(&ip);
    }

    pub fn attempts_for(&self, ip: IpAddr) -> usize {
        self.attempts.lock().unwrap().get(&ip).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn attempt(&self, ip: IpAddr, _port: u16, _timeout: Duration) -> Result<bool> {
        *self.attempts.lock().unwrap().entry(ip).or_default() += 1;
        if self.down.lock().unwrap().contains(&ip) {
            Err(Error::probe(format!("{} refused", ip)))
        } else {
            Ok(true)
        }
    }

    fn probe_name(&self) -> &'static str {
        "scripted"
    }
}

pub struct ScriptedProbeFactory(pub ScriptedProbe);

impl ProbeFactory for ScriptedProbeFactory {
    fn create(&self, _config: &ProbeConfig) -> Result<Box<dyn ReachabilityProbe>> {
        Ok(Box::new(self.0.clone()))
    }
}

// ---------------------------------------------------------------------------
// Compute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// Ordinary provider error (retryable)
    Transient,
    /// Credentials rejected (fatal for the account)
    Auth,
}

#[derive(Default)]
struct CloudState {
    /// instance id → attached resource id
    attachments: HashMap<String, Option<String>>,
    /// resource id → (ip, hostname label)
    resources: HashMap<String, (IpAddr, Option<String>)>,
    /// IPs handed out by allocate(), in order
    pool: VecDeque<IpAddr>,
    /// operation → (remaining failures, kind)
    failures: HashMap<&'static str, (usize, FailKind)>,
    /// operation → calls made
    calls: HashMap<&'static str, usize>,
    allocated: usize,
}

/// In-memory compute provider
#[derive(Clone)]
pub struct MockCloud {
    state: Arc<Mutex<CloudState>>,
    labels: bool,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloudState::default())),
            labels: false,
        }
    }

    /// Same cloud, with hostname label support
    pub fn with_labels(mut self) -> Self {
        self.labels = true;
        self
    }

    /// Add an instance with an attached resource holding `ip`
    pub fn add_instance(&self, id: &str, ip: IpAddr) {
        let mut state = self.state.lock().unwrap();
        let resource = format!("{}-ip", id);
        state.resources.insert(resource.clone(), (ip, None));
        state.attachments.insert(id.to_string(), Some(resource));
    }

    /// Add an instance with a labelled resource
    pub fn add_labelled_instance(&self, id: &str, ip: IpAddr, label: &str) {
        self.add_instance(id, ip);
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.resources.get_mut(&format!("{}-ip", id)) {
            entry.1 = Some(label.to_string());
        }
    }

    /// Queue IPs that allocate() will hand out
    pub fn queue_ips(&self, ips: &[IpAddr]) {
        self.state.lock().unwrap().pool.extend(ips.iter().copied());
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail(&self, op: &'static str, times: usize, kind: FailKind) {
        self.state.lock().unwrap().failures.insert(op, (times, kind));
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.state.lock().unwrap().calls.get(op).copied().unwrap_or(0)
    }

    pub fn attached_ip(&self, id: &str) -> Option<IpAddr> {
        let state = self.state.lock().unwrap();
        let resource = state.attachments.get(id)?.as_ref()?;
        state.resources.get(resource).map(|(ip, _)| *ip)
    }

    pub fn label_of(&self, id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let resource = state.attachments.get(id)?.as_ref()?;
        state.resources.get(resource)?.1.clone()
    }

    pub fn resource_count(&self) -> usize {
        self.state.lock().unwrap().resources.len()
    }

    fn enter(&self, op: &'static str) -> Result<std::sync::MutexGuard<'_, CloudState>> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        if let Some((remaining, kind)) = state.failures.get_mut(op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(match kind {
                FailKind::Transient => Error::compute("mock", op, "injected failure"),
                FailKind::Auth => Error::auth("injected credential failure"),
            });
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl ComputeProvider for MockCloud {
    async fn resolve_current_ip(&self, instance: &ManagedInstance) -> Result<ResolvedAddress> {
        let state = self.enter("resolve")?;
        let attachment = state
            .attachments
            .get(&instance.id)
            .ok_or_else(|| Error::not_found(format!("instance {}", instance.id)))?;

        Ok(match attachment {
            Some(resource) => {
                let (ip, label) = state.resources[resource].clone();
                let mut ip_resource = IpResource::new(resource.clone());
                ip_resource.hostname_label = label;
                ResolvedAddress::new(Some(ip), Some(ip_resource))
            }
            None => ResolvedAddress::default(),
        })
    }

    async fn disassociate(&self, instance: &ManagedInstance) -> Result<()> {
        let mut state = self.enter("disassociate")?;
        match state.attachments.get_mut(&instance.id) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::not_found("nothing attached")),
        }
    }

    async fn release(&self, resource: &IpResource) -> Result<()> {
        let mut state = self.enter("release")?;
        state
            .resources
            .remove(&resource.id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("resource {}", resource.id)))
    }

    async fn allocate(
        &self,
        instance: &ManagedInstance,
        previous: Option<&IpResource>,
    ) -> Result<IpResource> {
        let mut state = self.enter("allocate")?;
        let ip = state
            .pool
            .pop_front()
            .ok_or_else(|| Error::compute("mock", "allocate", "address pool exhausted"))?;
        state.allocated += 1;
        let id = match previous {
            Some(previous) if !state.resources.contains_key(&previous.id) => previous.id.clone(),
            _ => format!("{}-ip-{}", instance.id, state.allocated),
        };
        state.resources.insert(id.clone(), (ip, None));
        Ok(IpResource::new(id))
    }

    async fn associate(&self, instance: &ManagedInstance, resource: &IpResource) -> Result<()> {
        let mut state = self.enter("associate")?;
        if !state.resources.contains_key(&resource.id) {
            return Err(Error::not_found(format!("resource {}", resource.id)));
        }
        state
            .attachments
            .insert(instance.id.clone(), Some(resource.id.clone()));
        Ok(())
    }

    fn supports_hostname_labels(&self) -> bool {
        self.labels
    }

    async fn attach_hostname_label(&self, resource: &IpResource, label: &str) -> Result<()> {
        let mut state = self.enter("attach_label")?;
        let entry = state
            .resources
            .get_mut(&resource.id)
            .ok_or_else(|| Error::not_found(format!("resource {}", resource.id)))?;
        entry.1 = Some(label.to_string());
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// Hands out the MockCloud registered for each account name
#[derive(Clone, Default)]
pub struct MockCloudFactory {
    clouds: Arc<Mutex<HashMap<String, MockCloud>>>,
}

impl MockCloudFactory {
    pub fn insert(&self, account: &str, cloud: MockCloud) {
        self.clouds
            .lock()
            .unwrap()
            .insert(account.to_string(), cloud);
    }
}

impl ComputeProviderFactory for MockCloudFactory {
    fn create(&self, config: &AccountConfig) -> Result<Box<dyn ComputeProvider>> {
        let clouds = self.clouds.lock().unwrap();
        let cloud = clouds
            .get(&config.name)
            .ok_or_else(|| Error::config(format!("no mock cloud for {}", config.name)))?;
        Ok(Box::new(cloud.clone()))
    }
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ZoneState {
    records: Vec<DnsRecord>,
    next_id: usize,
    fail_deletes: HashSet<String>,
    fail_list: bool,
    missing_zone_on_add: bool,
}

/// In-memory DNS zone
#[derive(Clone, Default)]
pub struct MockZone {
    state: Arc<Mutex<ZoneState>>,
    add_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
    no_lines: bool,
}

impl MockZone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same zone, served by a provider without routing lines
    pub fn without_routing_lines(mut self) -> Self {
        self.no_lines = true;
        self
    }

    /// Insert a record directly, bypassing the counters
    pub fn seed(&self, label: &str, record_type: &str, value: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("rec-{}", state.next_id);
        state.records.push(DnsRecord {
            id: id.clone(),
            label: label.to_string(),
            record_type: record_type.to_string(),
            value: value.to_string(),
            ttl: Some(600),
            line: Some("default".to_string()),
        });
        id
    }

    /// Values of the records matching (label, type)
    pub fn values(&self, label: &str, record_type: RecordType) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.matches(label, record_type))
            .map(|r| r.value.clone())
            .collect()
    }

    pub fn records(&self) -> Vec<DnsRecord> {
        self.state.lock().unwrap().records.clone()
    }

    /// Drop a record behind the reconciler's back
    pub fn remove_externally(&self, id: &str) {
        self.state.lock().unwrap().records.retain(|r| r.id != id);
    }

    pub fn fail_delete_of(&self, id: &str) {
        self.state.lock().unwrap().fail_deletes.insert(id.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    /// Make every add answer "zone not found"
    pub fn reject_adds_with_missing_zone(&self) {
        self.state.lock().unwrap().missing_zone_on_add = true;
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn mutations(&self) -> usize {
        self.add_calls() + self.delete_calls()
    }
}

#[async_trait::async_trait]
impl DnsProvider for MockZone {
    async fn list_records(&self, _domain: &str) -> Result<Vec<DnsRecord>> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(Error::dns("mock", "listing unavailable"));
        }
        Ok(state.records.clone())
    }

    async fn add_record(&self, domain: &str, record: &NewDnsRecord) -> Result<()> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.missing_zone_on_add {
            return Err(Error::not_found(format!("zone for {}", domain)));
        }
        let value = record.value.to_string();
        if state
            .records
            .iter()
            .any(|r| r.matches(&record.label, record.record_type) && r.value == value)
        {
            return Err(Error::conflict(format!("{} already exists", value)));
        }
        state.next_id += 1;
        let id = format!("rec-{}", state.next_id);
        state.records.push(DnsRecord {
            id,
            label: record.label.clone(),
            record_type: record.record_type.as_str().to_string(),
            value,
            ttl: Some(record.ttl),
            line: Some(record.line.clone()),
        });
        Ok(())
    }

    async fn delete_record(&self, _domain: &str, record_id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes.contains(record_id) {
            return Err(Error::dns("mock", format!("delete {} rejected", record_id)));
        }
        let before = state.records.len();
        state.records.retain(|r| r.id != record_id);
        if state.records.len() == before {
            return Err(Error::not_found(format!("record {}", record_id)));
        }
        Ok(())
    }

    fn supports_routing_lines(&self) -> bool {
        !self.no_lines
    }

    fn provider_name(&self) -> &'static str {
        "mock-dns"
    }
}

pub struct MockZoneFactory(pub MockZone);

impl DnsProviderFactory for MockZoneFactory {
    fn create(&self, _config: &DnsConfig) -> Result<Box<dyn DnsProvider>> {
        Ok(Box::new(self.0.clone()))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Account backed by the "mock" compute factory
pub fn mock_account(name: &str, region: &str, instances: &[&str]) -> AccountConfig {
    AccountConfig {
        name: name.to_string(),
        region: region.to_string(),
        provider: ComputeConfig::Custom {
            factory: "mock".to_string(),
            config: serde_json::Value::Null,
        },
        instances: instances.iter().map(|s| s.to_string()).collect(),
    }
}

/// Fleet configuration wired to the mock backends, with zero delays
pub fn fleet_config(accounts: Vec<AccountConfig>) -> FleetConfig {
    FleetConfig {
        accounts,
        dns: DnsConfig::Custom {
            factory: "mock-dns".to_string(),
            config: serde_json::Value::Null,
        },
        probe: ProbeConfig {
            backend: ProbeBackend::Custom {
                factory: "scripted".to_string(),
                config: serde_json::Value::Null,
            },
            port: 22,
            retries: 3,
            timeout_secs: 1,
            retry_delay_ms: 0,
        },
        record: RecordConfig::new(DOMAIN, LABEL).with_lines(
            RoutingLines::parse("ap-northeast-1=unicom,ap-southeast-1=telecom", "default")
                .unwrap(),
        ),
        controller: ControllerConfig {
            interval_secs: 1,
            concurrency: 1,
            rotation: BackoffPolicy::constant(3, Duration::ZERO),
            event_channel_capacity: 1000,
        },
    }
}

/// Registry with the mock backends registered
pub fn mock_registry(
    clouds: &MockCloudFactory,
    zone: &MockZone,
    probe: &ScriptedProbe,
) -> Arc<ProviderRegistry> {
    let registry = ProviderRegistry::with_builtins();
    registry.register_compute("mock", Box::new(clouds.clone()));
    registry.register_dns("mock-dns", Box::new(MockZoneFactory(zone.clone())));
    registry.register_probe("scripted", Box::new(ScriptedProbeFactory(probe.clone())));
    Arc::new(registry)
}

/// Zero-delay backoff with `attempts` tries
pub fn no_delay(attempts: u32) -> BackoffPolicy {
    BackoffPolicy::constant(attempts, Duration::ZERO)
}
