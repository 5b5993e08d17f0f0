use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// One reachability attempt: does `ip:port` currently accept TCP connections?
///
/// Implementations either connect directly ([`crate::probe::TcpProbe`]) or ask
/// a remote probing service. They perform exactly one attempt; retries belong
/// to [`crate::probe::Prober`].
///
/// Return `Ok(true)` when the port is open, `Ok(false)` when the endpoint (or
/// the remote service) says it is closed, and `Err(Error::Probe)` for any
/// transport-level failure.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn attempt(&self, ip: IpAddr, port: u16, timeout: Duration)
    -> Result<bool, crate::Error>;

    fn probe_name(&self) -> &'static str;
}

/// Helper trait for constructing probes from configuration
pub trait ProbeFactory: Send + Sync {
    fn create(
        &self,
        config: &crate::config::ProbeConfig,
    ) -> Result<Box<dyn ReachabilityProbe>, crate::Error>;
}
