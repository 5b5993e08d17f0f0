use crate::error::{Error, Result};
use crate::traits::{ProbeFactory, ReachabilityProbe};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Direct TCP connect from this host
///
/// A completed handshake means the port is open; the connection is dropped
/// immediately afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl TcpProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn attempt(&self, ip: IpAddr, port: u16, timeout: Duration) -> Result<bool> {
        let addr = SocketAddr::new(ip, port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(e)) => Err(Error::probe(format!("connect {}: {}", addr, e))),
            Err(_) => Err(Error::probe(format!(
                "connect {}: timed out after {:?}",
                addr, timeout
            ))),
        }
    }

    fn probe_name(&self) -> &'static str {
        "tcp"
    }
}

/// Factory registered under "tcp"
pub struct TcpProbeFactory;

impl ProbeFactory for TcpProbeFactory {
    fn create(&self, _config: &crate::config::ProbeConfig) -> Result<Box<dyn ReachabilityProbe>> {
        Ok(Box::new(TcpProbe::new()))
    }
}
