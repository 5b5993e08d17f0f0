//! Fleet data model
//!
//! - [`ManagedInstance`]: one compute instance and its rotation state
//! - [`ProviderAccount`]: credentials-bound adapter plus the instances it owns
//! - [`DesiredIpSet`]: the live IPs gathered during one tick

use crate::config::AccountConfig;
use crate::error::{Error, Result};
use crate::retry::BackoffPolicy;
use crate::rotation::ensure_hostname_label;
use crate::traits::ComputeProvider;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provider-side handle of a public IP resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpResource {
    /// Provider-scoped identifier (public IP name, static IP name, allocation id)
    pub id: String,
    /// Stable hostname label attached to the resource, if any
    pub hostname_label: Option<String>,
}

impl IpResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname_label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.hostname_label = Some(label.into());
        self
    }
}

/// The provider's authoritative view of an instance's public address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Current public IP (absent while no IP resource is associated)
    pub ip: Option<IpAddr>,
    /// The IP resource backing `ip`
    pub resource: Option<IpResource>,
}

impl ResolvedAddress {
    pub fn new(ip: Option<IpAddr>, resource: Option<IpResource>) -> Self {
        Self { ip, resource }
    }
}

/// Health / rotation state of an instance
///
/// ```text
/// Healthy ──probe fails──▶ Unreachable ──▶ Rotating ──▶ Verifying ──▶ Healthy
///                               ▲              │             │
///                               │              ▼             ▼
///                               └──next tick── RotationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Healthy,
    Unreachable,
    Rotating,
    Verifying,
    RotationFailed,
}

impl HealthState {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: HealthState) -> bool {
        use HealthState::*;
        matches!(
            (self, next),
            (Healthy, Healthy)
                | (Healthy, Unreachable)
                | (Unreachable, Rotating)
                | (Rotating, Verifying)
                | (Rotating, RotationFailed)
                | (Verifying, Healthy)
                | (Verifying, RotationFailed)
                | (RotationFailed, Unreachable)
                | (RotationFailed, Healthy)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unreachable => "unreachable",
            HealthState::Rotating => "rotating",
            HealthState::Verifying => "verifying",
            HealthState::RotationFailed => "rotation_failed",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed compute instance
///
/// Owned by exactly one [`ProviderAccount`]; only the rotation state machine
/// and the control loop mutate it, through `&mut`, so at most one rotation is
/// ever in flight per instance.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    /// Provider-scoped id or name
    pub id: String,
    /// Provider kind (registry key, e.g. "azure")
    pub provider: String,
    /// Region the instance lives in
    pub region: String,
    /// Current public IP, always as last reported by the provider
    pub current_ip: Option<IpAddr>,
    /// IP resource backing `current_ip`
    pub ip_resource: Option<IpResource>,
    /// Health / rotation state
    pub health: HealthState,
    /// Stable hostname label, kept across rotations
    pub hostname_label: Option<String>,
    /// When the instance was last probed
    pub last_probe: Option<DateTime<Utc>>,
    /// Provider-call attempts spent in the current rotation cycle
    pub rotation_attempts: u32,
}

impl ManagedInstance {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            region: region.into(),
            current_ip: None,
            ip_resource: None,
            health: HealthState::Healthy,
            hostname_label: None,
            last_probe: None,
            rotation_attempts: 0,
        }
    }

    /// Store the provider's authoritative answer
    pub fn apply_resolution(&mut self, resolved: ResolvedAddress) {
        self.current_ip = resolved.ip;
        if let Some(label) = resolved
            .resource
            .as_ref()
            .and_then(|r| r.hostname_label.clone())
        {
            self.hostname_label = Some(label);
        }
        self.ip_resource = resolved.resource;
    }

    /// Enter `Unreachable`, starting a fresh rotation cycle
    pub fn mark_unreachable(&mut self) {
        self.transition(HealthState::Unreachable);
        self.rotation_attempts = 0;
    }

    /// Move to a new state, logging illegal transitions
    pub fn transition(&mut self, next: HealthState) {
        if !self.health.can_transition_to(next) {
            warn!(
                instance = %self.id,
                from = %self.health,
                to = %next,
                "unexpected health transition"
            );
        } else if self.health != next {
            debug!(instance = %self.id, from = %self.health, to = %next, "health transition");
        }
        self.health = next;
    }
}

/// Random hostname label: a letter followed by 8 hex digits
pub fn random_hostname_label() -> String {
    format!("a{:08x}", rand::random::<u32>())
}

/// A provider account: bound adapter plus its instances
///
/// Built wholesale from configuration; discarded and rebuilt after an
/// unrecoverable enumeration error.
pub struct ProviderAccount {
    /// Account name from configuration
    pub name: String,
    /// Region / resource location
    pub region: String,
    /// Bound compute adapter
    pub provider: Arc<dyn ComputeProvider>,
    /// Managed instances
    pub instances: Vec<ManagedInstance>,
}

impl std::fmt::Debug for ProviderAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAccount")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("provider", &self.provider.provider_name())
            .field("instances", &self.instances)
            .finish()
    }
}

impl ProviderAccount {
    /// Enumerate the account's instances from the provider
    ///
    /// Any resolution failure is an inventory error: the account is skipped
    /// for the current tick and loaded again on the next one.
    pub async fn load(config: &AccountConfig, provider: Arc<dyn ComputeProvider>) -> Result<Self> {
        let mut instances = Vec::with_capacity(config.instances.len());

        for id in &config.instances {
            let mut instance =
                ManagedInstance::new(id.clone(), config.provider.type_name(), &config.region);
            let resolved = provider
                .resolve_current_ip(&instance)
                .await
                .map_err(|e| Error::inventory(&config.name, format!("{}: {}", id, e)))?;
            instance.apply_resolution(resolved);

            if provider.supports_hostname_labels() {
                ensure_hostname_label(provider.as_ref(), &mut instance, &BackoffPolicy::no_retry())
                    .await;
            }

            debug!(
                account = %config.name,
                instance = %instance.id,
                ip = ?instance.current_ip,
                "instance enumerated"
            );
            instances.push(instance);
        }

        info!(
            account = %config.name,
            provider = provider.provider_name(),
            instances = instances.len(),
            "account inventory loaded"
        );

        Ok(Self {
            name: config.name.clone(),
            region: config.region.clone(),
            provider,
            instances,
        })
    }
}

/// IPs considered live at the end of one tick
///
/// Each IP remembers the region of the instance it came from, which selects
/// the DNS routing line when a record has to be added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredIpSet {
    entries: BTreeMap<IpAddr, Option<String>>,
}

impl DesiredIpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an IP; the first region recorded for an IP wins
    pub fn insert(&mut self, ip: IpAddr, region: Option<String>) {
        self.entries.entry(ip).or_insert(region);
    }

    /// Merge another set into this one
    pub fn merge(&mut self, other: DesiredIpSet) {
        for (ip, region) in other.entries {
            self.insert(ip, region);
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.contains_key(ip)
    }

    /// Region the IP was collected from
    pub fn region_of(&self, ip: &IpAddr) -> Option<&str> {
        self.entries.get(ip).and_then(|r| r.as_deref())
    }

    pub fn ips(&self) -> impl Iterator<Item = &IpAddr> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<IpAddr> for DesiredIpSet {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut set = Self::new();
        for ip in iter {
            set.insert(ip, None);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_path_is_legal() {
        use HealthState::*;
        let path = [Healthy, Unreachable, Rotating, Verifying, Healthy];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn rotation_failed_is_not_a_dead_end() {
        use HealthState::*;
        assert!(Rotating.can_transition_to(RotationFailed));
        assert!(Verifying.can_transition_to(RotationFailed));
        assert!(RotationFailed.can_transition_to(Unreachable));
        assert!(!Healthy.can_transition_to(Verifying));
        assert!(!Unreachable.can_transition_to(Healthy));
    }

    #[test]
    fn resolution_keeps_known_label_when_resource_has_none() {
        let mut instance = ManagedInstance::new("vm-1", "azure", "eastasia");
        instance.apply_resolution(ResolvedAddress::new(
            Some("1.2.3.4".parse().unwrap()),
            Some(IpResource::new("vm-1-ip").with_label("a1b2c3d4e")),
        ));
        assert_eq!(instance.hostname_label.as_deref(), Some("a1b2c3d4e"));

        instance.apply_resolution(ResolvedAddress::new(
            Some("5.6.7.8".parse().unwrap()),
            Some(IpResource::new("vm-1-ip")),
        ));
        assert_eq!(instance.current_ip, Some("5.6.7.8".parse().unwrap()));
        assert_eq!(instance.hostname_label.as_deref(), Some("a1b2c3d4e"));
    }

    #[test]
    fn random_labels_start_with_a_letter() {
        let label = random_hostname_label();
        assert_eq!(label.len(), 9);
        assert!(label.starts_with('a'));
        assert!(label[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn desired_set_keeps_first_region() {
        let ip: IpAddr = "5.6.7.8".parse().unwrap();
        let mut set = DesiredIpSet::new();
        set.insert(ip, Some("ap-northeast-1".into()));

        let mut other = DesiredIpSet::new();
        other.insert(ip, Some("ap-southeast-1".into()));
        other.insert("9.9.9.9".parse().unwrap(), None);
        set.merge(other);

        assert_eq!(set.len(), 2);
        assert_eq!(set.region_of(&ip), Some("ap-northeast-1"));
    }
}
