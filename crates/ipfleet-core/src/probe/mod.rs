//! Reachability prober
//!
//! [`Prober`] wraps one [`ReachabilityProbe`] backend with the configured
//! attempt budget. An instance is unreachable only after every attempt failed.

mod tcp;

pub use tcp::{TcpProbe, TcpProbeFactory};

use crate::config::ProbeConfig;
use crate::error::Error;
use crate::fleet::ManagedInstance;
use crate::retry::{BackoffPolicy, retry};
use crate::traits::ReachabilityProbe;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded-retry reachability check against the health-check port
#[derive(Clone)]
pub struct Prober {
    backend: Arc<dyn ReachabilityProbe>,
    port: u16,
    timeout: Duration,
    policy: BackoffPolicy,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("backend", &self.backend.probe_name())
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Prober {
    pub fn new(
        backend: Arc<dyn ReachabilityProbe>,
        port: u16,
        timeout: Duration,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            backend,
            port,
            timeout,
            policy,
        }
    }

    /// Build a prober from configuration around an already-created backend
    pub fn from_config(backend: Arc<dyn ReachabilityProbe>, config: &ProbeConfig) -> Self {
        Self::new(backend, config.port, config.timeout(), config.backoff())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check whether `ip` accepts connections on the health-check port.
    ///
    /// Returns `true` as soon as one attempt succeeds. A closed port and a
    /// transport failure both count as a failed attempt.
    pub async fn check(&self, ip: IpAddr) -> bool {
        let backend = self.backend.clone();
        let (port, timeout) = (self.port, self.timeout);

        let outcome = retry(&self.policy, |attempt| {
            let backend = backend.clone();
            async move {
                debug!(%ip, port, attempt = attempt + 1, probe = backend.probe_name(), "probing");
                match backend.attempt(ip, port, timeout).await? {
                    true => Ok(()),
                    false => Err(Error::probe(format!("{}:{} reported closed", ip, port))),
                }
            }
        })
        .await;

        match outcome.result {
            Ok(()) => true,
            Err(e) => {
                warn!(%ip, port, attempts = outcome.attempts, error = %e, "endpoint unreachable");
                false
            }
        }
    }

    /// Probe an instance's current IP and stamp the probe time.
    ///
    /// An instance without an IP is reported unreachable without probing.
    pub async fn check_instance(&self, instance: &mut ManagedInstance) -> bool {
        instance.last_probe = Some(chrono::Utc::now());
        match instance.current_ip {
            Some(ip) => self.check(ip).await,
            None => {
                debug!(instance = %instance.id, "no public IP to probe");
                false
            }
        }
    }
}
