//! Core traits for the fleet controller
//!
//! This module defines the capability interfaces every backend implements.
//!
//! - [`ReachabilityProbe`]: One reachability attempt against an IP:port
//! - [`ComputeProvider`]: Public-IP capabilities of a cloud provider
//! - [`DnsProvider`]: Record listing and mutation for a DNS zone

pub mod compute;
pub mod dns_provider;
pub mod probe;

pub use compute::{ComputeProvider, ComputeProviderFactory};
pub use dns_provider::{DnsProvider, DnsProviderFactory, DnsRecord, NewDnsRecord};
pub use probe::{ProbeFactory, ReachabilityProbe};
