// # HTTP Reachability Probe
//
// This crate delegates reachability checks to a remote probe service.
//
// ## Purpose
//
// A direct connect from the controller host only says whether *that host*
// can reach an instance. Blocking is usually applied on specific network
// paths, so the useful question is whether the instance is reachable from
// where the users are. A small probe service deployed there answers it.
//
// ## Protocol
//
// ```text
// GET <base>/check_port?ip=<ip>&port=<port>
// 200 {"ip": "1.2.3.4", "port": 22, "open": true}
// ```
//
// Any non-200 status, transport error or unparsable body is one failed
// attempt. Retries belong to `ipfleet_core::Prober`.

use ipfleet_core::config::{ProbeBackend, ProbeConfig};
use ipfleet_core::traits::{ProbeFactory, ReachabilityProbe};
use ipfleet_core::{Error, ProviderRegistry, Result};

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Response body of `/check_port`
#[derive(Debug, Deserialize)]
struct CheckPortResponse {
    #[allow(dead_code)]
    ip: Option<String>,
    #[allow(dead_code)]
    port: Option<u16>,
    open: bool,
}

/// Reachability probe backed by a remote `/check_port` service
pub struct HttpProbe {
    /// Base URL of the probe service (without trailing slash)
    base_url: String,

    /// HTTP client
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a new HTTP probe
    ///
    /// # Parameters
    ///
    /// - `base_url`: Probe service base URL (e.g., "http://10.0.0.5:10080")
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/check_port", self.base_url)
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn attempt(&self, ip: IpAddr, port: u16, timeout: Duration) -> Result<bool> {
        let response = self
            .client
            .get(self.endpoint())
            .query(&[("ip", ip.to_string()), ("port", port.to_string())])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::probe(format!("probe service request failed: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::probe(format!("probe service returned {}", status)));
        }

        let body: CheckPortResponse = response
            .json()
            .await
            .map_err(|e| Error::probe(format!("invalid probe service response: {}", e)))?;

        debug!(%ip, port, open = body.open, "probe service answered");
        Ok(body.open)
    }

    fn probe_name(&self) -> &'static str {
        "http"
    }
}

/// Factory for creating HTTP probes
pub struct HttpProbeFactory;

impl ProbeFactory for HttpProbeFactory {
    fn create(&self, config: &ProbeConfig) -> Result<Box<dyn ReachabilityProbe>> {
        match &config.backend {
            ProbeBackend::Http { url } => Ok(Box::new(HttpProbe::new(url.clone()))),
            _ => Err(Error::config("Invalid config for HTTP probe")),
        }
    }
}

/// Register the HTTP probe with a registry
pub fn register(registry: &ProviderRegistry) {
    registry.register_probe("http", Box::new(HttpProbeFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipfleet_core::{BackoffPolicy, Prober};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering every request with `status` and `body`.
    /// Returns the base URL and a request counter.
    async fn serve(status: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (base, hits)
    }

    fn prober(base: &str, retries: u32) -> Prober {
        Prober::new(
            Arc::new(HttpProbe::new(base)),
            22,
            Duration::from_secs(2),
            BackoffPolicy::constant(retries, Duration::ZERO),
        )
    }

    #[test]
    fn test_factory_creation() {
        let config = ProbeConfig {
            backend: ProbeBackend::Http {
                url: "http://probe.internal:10080/".to_string(),
            },
            ..ProbeConfig::default()
        };
        assert!(HttpProbeFactory.create(&config).is_ok());
        assert!(HttpProbeFactory.create(&ProbeConfig::default()).is_err());
    }

    #[tokio::test]
    async fn open_port_is_reported_reachable() {
        let (base, hits) = serve("200 OK", r#"{"ip":"10.0.0.1","port":22,"open":true}"#).await;

        assert!(prober(&base, 3).check("10.0.0.1".parse().unwrap()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_exhaust_retries_without_raising() {
        let (base, hits) = serve("500 Internal Server Error", r#"{"error":"boom"}"#).await;

        assert!(!prober(&base, 3).check("10.0.0.1".parse().unwrap()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn closed_port_counts_as_failed_attempt() {
        let (base, hits) = serve("200 OK", r#"{"ip":"10.0.0.1","port":22,"open":false}"#).await;

        assert!(!prober(&base, 2).check("10.0.0.1".parse().unwrap()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_body_is_a_probe_error() {
        let (base, _) = serve("200 OK", "not json").await;

        let result = HttpProbe::new(base)
            .attempt("10.0.0.1".parse().unwrap(), 22, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(Error::Probe(_))));
    }
}
