//! Plugin-based backend registry
//!
//! Compute providers, DNS providers and reachability probes register a
//! factory under their type name; configuration selects one by that name.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ipfleet_core::registry::ProviderRegistry;
//!
//! let registry = ProviderRegistry::new();
//! ipfleet_compute_azure::register(&registry);
//! ipfleet_dns_cloudflare::register(&registry);
//!
//! let provider = registry.create_compute(&account_config)?;
//! let dns = registry.create_dns(&config.dns)?;
//! ```
//!
//! ## Registration
//!
//! Backend crates expose a `register` function:
//!
//! ```rust,ignore
//! pub fn register(registry: &ProviderRegistry) {
//!     registry.register_dns("cloudflare", Box::new(CloudflareFactory));
//! }
//! ```

use crate::config::{AccountConfig, DnsConfig, ProbeConfig};
use crate::error::{Error, Result};
use crate::probe::TcpProbeFactory;
use crate::traits::{ComputeProvider, DnsProvider, ReachabilityProbe};
use crate::traits::{ComputeProviderFactory, DnsProviderFactory, ProbeFactory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Backend registry
///
/// Interior mutability through `RwLock` allows concurrent lookups and
/// registration through a shared reference.
#[derive(Default)]
pub struct ProviderRegistry {
    /// Registered compute provider factories
    compute: RwLock<HashMap<String, Box<dyn ComputeProviderFactory>>>,

    /// Registered DNS provider factories
    dns: RwLock<HashMap<String, Box<dyn DnsProviderFactory>>>,

    /// Registered reachability probe factories
    probes: RwLock<HashMap<String, Box<dyn ProbeFactory>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in backends (the direct TCP probe)
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_probe("tcp", Box::new(TcpProbeFactory));
        registry
    }

    /// Register a compute provider factory
    ///
    /// # Parameters
    ///
    /// - `name`: Provider type name (e.g., "azure", "lightsail")
    /// - `factory`: Factory object for creating adapter instances
    pub fn register_compute(
        &self,
        name: impl Into<String>,
        factory: Box<dyn ComputeProviderFactory>,
    ) {
        let mut compute = self.compute.write().unwrap_or_else(PoisonError::into_inner);
        compute.insert(name.into(), factory);
    }

    /// Register a DNS provider factory
    pub fn register_dns(&self, name: impl Into<String>, factory: Box<dyn DnsProviderFactory>) {
        let mut dns = self.dns.write().unwrap_or_else(PoisonError::into_inner);
        dns.insert(name.into(), factory);
    }

    /// Register a reachability probe factory
    pub fn register_probe(&self, name: impl Into<String>, factory: Box<dyn ProbeFactory>) {
        let mut probes = self.probes.write().unwrap_or_else(PoisonError::into_inner);
        probes.insert(name.into(), factory);
    }

    /// Create a compute adapter bound to one account
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn ComputeProvider>)`: Created adapter
    /// - `Err(Error)`: If the provider type is not registered or creation fails
    pub fn create_compute(&self, config: &AccountConfig) -> Result<Box<dyn ComputeProvider>> {
        let provider_type = config.provider.type_name();
        let compute = self.compute.read().unwrap_or_else(PoisonError::into_inner);

        let factory = compute.get(provider_type).ok_or_else(|| {
            Error::config(format!("Unknown compute provider type: {}", provider_type))
        })?;

        factory.create(config)
    }

    /// Create a DNS provider from configuration
    pub fn create_dns(&self, config: &DnsConfig) -> Result<Box<dyn DnsProvider>> {
        let provider_type = config.type_name();
        let dns = self.dns.read().unwrap_or_else(PoisonError::into_inner);

        let factory = dns.get(provider_type).ok_or_else(|| {
            Error::config(format!("Unknown DNS provider type: {}", provider_type))
        })?;

        factory.create(config)
    }

    /// Create a reachability probe from configuration
    pub fn create_probe(&self, config: &ProbeConfig) -> Result<Box<dyn ReachabilityProbe>> {
        let probe_type = config.backend.type_name();
        let probes = self.probes.read().unwrap_or_else(PoisonError::into_inner);

        let factory = probes
            .get(probe_type)
            .ok_or_else(|| Error::config(format!("Unknown probe type: {}", probe_type)))?;

        factory.create(config)
    }

    /// List all registered compute provider types
    pub fn list_compute(&self) -> Vec<String> {
        let compute = self.compute.read().unwrap_or_else(PoisonError::into_inner);
        compute.keys().cloned().collect()
    }

    /// List all registered DNS provider types
    pub fn list_dns(&self) -> Vec<String> {
        let dns = self.dns.read().unwrap_or_else(PoisonError::into_inner);
        dns.keys().cloned().collect()
    }

    /// List all registered probe types
    pub fn list_probes(&self) -> Vec<String> {
        let probes = self.probes.read().unwrap_or_else(PoisonError::into_inner);
        probes.keys().cloned().collect()
    }

    /// Check if a compute provider type is registered
    pub fn has_compute(&self, name: &str) -> bool {
        let compute = self.compute.read().unwrap_or_else(PoisonError::into_inner);
        compute.contains_key(name)
    }

    /// Check if a DNS provider type is registered
    pub fn has_dns(&self, name: &str) -> bool {
        let dns = self.dns.read().unwrap_or_else(PoisonError::into_inner);
        dns.contains_key(name)
    }

    /// Check if a probe type is registered
    pub fn has_probe(&self, name: &str) -> bool {
        let probes = self.probes.read().unwrap_or_else(PoisonError::into_inner);
        probes.contains_key(name)
    }
}
