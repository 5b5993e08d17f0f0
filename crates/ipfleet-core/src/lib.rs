// # ipfleet-core
//
// Core library for keeping a fleet of cloud instances reachable.
//
// ## Architecture Overview
//
// - **ReachabilityProbe**: Trait for a single "does this TCP endpoint accept
//   connections" attempt, wrapped by [`Prober`] with bounded retries
// - **ComputeProvider**: Trait for the per-cloud IP capabilities (resolve,
//   disassociate, release, allocate, associate, hostname labels)
// - **Rotator**: The rotation state machine, written once against `ComputeProvider`
// - **DnsProvider** / **DnsReconciler**: Makes a DNS record set exactly equal
//   the fleet's live IPs
// - **FleetController**: Fixed-interval control loop tying the above together
// - **ProviderRegistry**: Name → factory registry for all pluggable backends
//
// ## Design Principles
//
// 1. **No persistent state**: inventory is rebuilt from provider APIs on start
//    and after any unrecoverable account error
// 2. **Unit-of-work isolation**: a failing instance, account or DNS call never
//    aborts the tick
// 3. **Authoritative IPs only**: an instance's IP always comes from its provider
// 4. **Plugin-based**: backends live in their own crates and register factories

pub mod config;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod probe;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod rotation;
pub mod traits;

// Re-export core types for convenience
pub use config::{
    AccountConfig, ComputeConfig, ControllerConfig, DnsConfig, FleetConfig, FleetFile, ProbeBackend,
    ProbeConfig, RecordConfig, RecordType, RoutingLines,
};
pub use controller::{ControllerEvent, FleetController, TickReport};
pub use error::{Error, Result};
pub use fleet::{
    DesiredIpSet, HealthState, IpResource, ManagedInstance, ProviderAccount, ResolvedAddress,
};
pub use probe::{Prober, TcpProbe};
pub use reconcile::{DnsReconciler, ReconcileReport};
pub use registry::ProviderRegistry;
pub use retry::{BackoffPolicy, Retried, retry};
pub use rotation::{RotationOutcome, Rotator};
pub use traits::{
    ComputeProvider, ComputeProviderFactory, DnsProvider, DnsProviderFactory, DnsRecord,
    NewDnsRecord, ProbeFactory, ReachabilityProbe,
};
