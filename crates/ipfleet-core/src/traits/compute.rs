// # Compute Provider Trait
//
// Defines the public-IP capability set of a cloud provider.
//
// ## Implementations
//
// - Azure Resource Manager: `ipfleet-compute-azure` crate
// - AWS Lightsail: `ipfleet-compute-lightsail` crate
// - AWS EC2: `ipfleet-compute-ec2` crate
//
// ## Usage
//
// ```rust,ignore
// use ipfleet_core::{ComputeProvider, ManagedInstance};
//
// let provider = /* ComputeProvider implementation */;
// let instance = ManagedInstance::new("vm-1", "azure", "eastasia");
//
// let resolved = provider.resolve_current_ip(&instance).await?;
// println!("{:?}", resolved.ip);
// ```

use crate::fleet::{IpResource, ManagedInstance, ResolvedAddress};
use async_trait::async_trait;

/// Trait for compute provider adapters
///
/// The rotation state machine is written once against this trait. Provider
/// quirks (fetching a network interface before mutating it, static-IP naming
/// conventions, long-running operation polling) stay inside the adapter.
///
/// ## Allowed Capabilities
/// - ✅ Perform HTTPS API calls to the provider's endpoints
/// - ✅ Cache short-lived credentials (OAuth tokens) between calls
/// - ✅ Poll a long-running provider operation until it settles
///
/// ## Forbidden Capabilities
/// - ❌ Retry failed calls or sleep between attempts (owned by `Rotator`)
/// - ❌ Decide whether an instance needs rotation (owned by `FleetController`)
/// - ❌ Mutate `ManagedInstance` (adapters only see `&ManagedInstance`)
/// - ❌ Touch DNS records (owned by `DnsReconciler`)
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Ask the provider for the instance's current public IP and its backing
    /// resource. This is the authoritative answer the controller stores.
    async fn resolve_current_ip(
        &self,
        instance: &ManagedInstance,
    ) -> Result<ResolvedAddress, crate::Error>;

    /// Detach the current IP resource from the instance
    ///
    /// Must tolerate an instance that has nothing attached: return `Ok(())`
    /// or `Err(Error::NotFound)`.
    async fn disassociate(&self, instance: &ManagedInstance) -> Result<(), crate::Error>;

    /// Release / delete an IP resource
    async fn release(&self, resource: &IpResource) -> Result<(), crate::Error>;

    /// Allocate a new IP resource in the instance's region
    ///
    /// `previous` is the resource being replaced, so adapters that name
    /// resources after their owner can keep the same name.
    async fn allocate(
        &self,
        instance: &ManagedInstance,
        previous: Option<&IpResource>,
    ) -> Result<IpResource, crate::Error>;

    /// Associate an IP resource with the instance
    async fn associate(
        &self,
        instance: &ManagedInstance,
        resource: &IpResource,
    ) -> Result<(), crate::Error>;

    /// Whether IP resources can carry a stable hostname label
    fn supports_hostname_labels(&self) -> bool {
        false
    }

    /// Attach a hostname label to an IP resource
    async fn attach_hostname_label(
        &self,
        resource: &IpResource,
        _label: &str,
    ) -> Result<(), crate::Error> {
        Err(crate::Error::unsupported(format!(
            "{} does not support hostname labels (resource {})",
            self.provider_name(),
            resource.id
        )))
    }

    /// Provider name (for logging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing compute providers from account configuration
pub trait ComputeProviderFactory: Send + Sync {
    /// Create a ComputeProvider bound to one account's credentials and region
    fn create(
        &self,
        config: &crate::config::AccountConfig,
    ) -> Result<Box<dyn ComputeProvider>, crate::Error>;
}
