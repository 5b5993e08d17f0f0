// # ipfleetd - IP Fleet Daemon
//
// Thin integration layer around `ipfleet-core`:
// 1. Reading runtime configuration from environment variables
// 2. Loading the fleet file (accounts, credentials, instances)
// 3. Initializing tracing and the runtime
// 4. Registering compute, DNS and probe backends
// 5. Running the FleetController until SIGTERM / SIGINT
//
// No probing, rotation or DNS logic lives here.
//
// ## Configuration
//
// ### Fleet
// - `IPFLEET_FLEET_FILE`: Path to the JSON fleet file (required)
//
// ### Record
// - `IPFLEET_DOMAIN`: Zone apex, e.g. `example.com` (required)
// - `IPFLEET_LABEL`: Record label inside the zone, e.g. `proxy` (required)
// - `IPFLEET_RECORD_TYPE`: `A` (default) or `AAAA`
// - `IPFLEET_TTL`: Record TTL in seconds (default 600)
// - `IPFLEET_ROUTING_LINES`: `region=line,...` (e.g. `ap-northeast-1=unicom`)
// - `IPFLEET_DEFAULT_LINE`: Line for unmapped regions (default `default`)
//
// ### DNS Provider
// - `IPFLEET_DNS_PROVIDER`: `cloudflare` or `aliyun` (default `aliyun`)
// - `IPFLEET_CLOUDFLARE_API_TOKEN`, `IPFLEET_CLOUDFLARE_ZONE_ID` (optional)
// - `IPFLEET_ALIYUN_ACCESS_KEY_ID`, `IPFLEET_ALIYUN_ACCESS_KEY_SECRET`,
//   `IPFLEET_ALIYUN_ENDPOINT` (optional)
// - `IPFLEET_MODE`: `live` (default) or `dry-run`
//
// ### Probe
// - `IPFLEET_PROBE_TYPE`: `tcp` (default) or `http`
// - `IPFLEET_PROBE_URL`: Probe service base URL (for http)
// - `IPFLEET_PORT`: Port to probe (default 22)
// - `IPFLEET_PROBE_RETRIES`: Attempts per check (default 3)
// - `IPFLEET_PROBE_TIMEOUT_SECS`: Per-attempt timeout (default 10)
// - `IPFLEET_PROBE_RETRY_DELAY_MS`: Pause between attempts (default 1000)
//
// ### Controller
// - `IPFLEET_INTERVAL_SECS`: Sleep between ticks (default 60)
// - `IPFLEET_CONCURRENCY`: Accounts processed in parallel (default 1)
// - `IPFLEET_ROTATION_MAX_ATTEMPTS`: Attempts per rotation step (default 3)
// - `IPFLEET_ROTATION_BASE_DELAY_MS`: First backoff delay (default 1000)
// - `IPFLEET_ROTATION_MAX_DELAY_MS`: Backoff cap (default 8000)
// - `IPFLEET_SHUTDOWN_TIMEOUT_SECS`: Grace period for the last tick (default 120)
// - `IPFLEET_LOG_LEVEL`: trace, debug, info (default), warn, error
//
// ## Example
//
// ```bash
// export IPFLEET_FLEET_FILE=/etc/ipfleet/fleet.json
// export IPFLEET_DOMAIN=example.com
// export IPFLEET_LABEL=proxy
// export IPFLEET_ROUTING_LINES=ap-northeast-1=unicom,ap-southeast-1=telecom
// export IPFLEET_DNS_PROVIDER=aliyun
// export IPFLEET_ALIYUN_ACCESS_KEY_ID=...
// export IPFLEET_ALIYUN_ACCESS_KEY_SECRET=...
// export IPFLEET_PROBE_TYPE=http
// export IPFLEET_PROBE_URL=http://10.0.0.5:10080
//
// ipfleetd
// ```

use anyhow::{Result, anyhow};
use ipfleet_core::config::{
    AccountConfig, ControllerConfig, DnsConfig, FleetConfig, FleetFile, ProbeBackend, ProbeConfig,
    RecordConfig, RecordType, RoutingLines,
};
use ipfleet_core::{BackoffPolicy, ControllerEvent, FleetController, ProviderRegistry};
use std::env;
use std::fmt::Display;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum FleetExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<FleetExitCode> for ExitCode {
    fn from(code: FleetExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Runtime configuration read from the environment
#[derive(Debug)]
struct Config {
    fleet_file: String,
    domain: String,
    label: String,
    record_type: String,
    ttl: u32,
    routing_lines: String,
    default_line: String,
    dns_provider: String,
    cloudflare_api_token: Option<String>,
    cloudflare_zone_id: Option<String>,
    aliyun_access_key_id: Option<String>,
    aliyun_access_key_secret: Option<String>,
    aliyun_endpoint: Option<String>,
    mode: String,
    probe_type: String,
    probe_url: Option<String>,
    port: u16,
    probe_retries: u32,
    probe_timeout_secs: u64,
    probe_retry_delay_ms: u64,
    interval_secs: u64,
    concurrency: usize,
    rotation_max_attempts: u32,
    rotation_base_delay_ms: u64,
    rotation_max_delay_ms: u64,
    shutdown_timeout_secs: u64,
    log_level: String,
}

/// Parse an optional variable, falling back to `default` when unset
fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through a variable lookup function
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());
        let non_empty = |name: &str| get(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            fleet_file: text("IPFLEET_FLEET_FILE", ""),
            domain: text("IPFLEET_DOMAIN", ""),
            label: text("IPFLEET_LABEL", ""),
            record_type: text("IPFLEET_RECORD_TYPE", "A"),
            ttl: parse_var(&get, "IPFLEET_TTL", 600)?,
            routing_lines: text("IPFLEET_ROUTING_LINES", ""),
            default_line: text("IPFLEET_DEFAULT_LINE", "default"),
            dns_provider: text("IPFLEET_DNS_PROVIDER", "aliyun"),
            cloudflare_api_token: non_empty("IPFLEET_CLOUDFLARE_API_TOKEN"),
            cloudflare_zone_id: non_empty("IPFLEET_CLOUDFLARE_ZONE_ID"),
            aliyun_access_key_id: non_empty("IPFLEET_ALIYUN_ACCESS_KEY_ID"),
            aliyun_access_key_secret: non_empty("IPFLEET_ALIYUN_ACCESS_KEY_SECRET"),
            aliyun_endpoint: non_empty("IPFLEET_ALIYUN_ENDPOINT"),
            mode: text("IPFLEET_MODE", "live"),
            probe_type: text("IPFLEET_PROBE_TYPE", "tcp"),
            probe_url: non_empty("IPFLEET_PROBE_URL"),
            port: parse_var(&get, "IPFLEET_PORT", 22)?,
            probe_retries: parse_var(&get, "IPFLEET_PROBE_RETRIES", 3)?,
            probe_timeout_secs: parse_var(&get, "IPFLEET_PROBE_TIMEOUT_SECS", 10)?,
            probe_retry_delay_ms: parse_var(&get, "IPFLEET_PROBE_RETRY_DELAY_MS", 1000)?,
            interval_secs: parse_var(&get, "IPFLEET_INTERVAL_SECS", 60)?,
            concurrency: parse_var(&get, "IPFLEET_CONCURRENCY", 1)?,
            rotation_max_attempts: parse_var(&get, "IPFLEET_ROTATION_MAX_ATTEMPTS", 3)?,
            rotation_base_delay_ms: parse_var(&get, "IPFLEET_ROTATION_BASE_DELAY_MS", 1000)?,
            rotation_max_delay_ms: parse_var(&get, "IPFLEET_ROTATION_MAX_DELAY_MS", 8000)?,
            shutdown_timeout_secs: parse_var(&get, "IPFLEET_SHUTDOWN_TIMEOUT_SECS", 120)?,
            log_level: text("IPFLEET_LOG_LEVEL", "info"),
        })
    }

    /// Validate the configuration
    ///
    /// Checks required variables, value ranges and that the chosen backends
    /// have the settings they need. Errors name the variable to fix.
    fn validate(&self) -> Result<()> {
        if self.fleet_file.trim().is_empty() {
            anyhow::bail!(
                "IPFLEET_FLEET_FILE is required. \
                Set it via: export IPFLEET_FLEET_FILE=/etc/ipfleet/fleet.json"
            );
        }
        if !std::path::Path::new(&self.fleet_file).is_file() {
            anyhow::bail!("IPFLEET_FLEET_FILE does not exist: {}", self.fleet_file);
        }

        if self.domain.is_empty() {
            anyhow::bail!(
                "IPFLEET_DOMAIN is required. Set it via: export IPFLEET_DOMAIN=example.com"
            );
        }
        validate_domain_name(&self.domain)?;

        if self.label.is_empty() {
            anyhow::bail!("IPFLEET_LABEL is required. Set it via: export IPFLEET_LABEL=proxy");
        }
        if self.label != "@" {
            validate_domain_name(&self.label)
                .map_err(|e| anyhow!("IPFLEET_LABEL is not a valid label: {}", e))?;
        }

        RecordType::from_str(&self.record_type)
            .map_err(|e| anyhow!("IPFLEET_RECORD_TYPE: {}", e))?;

        if !(1..=86_400).contains(&self.ttl) {
            anyhow::bail!("IPFLEET_TTL must be between 1 and 86400 seconds. Got: {}", self.ttl);
        }

        RoutingLines::parse(&self.routing_lines, self.default_line.clone())
            .map_err(|e| anyhow!("IPFLEET_ROUTING_LINES: {}", e))?;

        match self.dns_provider.as_str() {
            "cloudflare" => {
                if self.cloudflare_api_token.is_none() {
                    anyhow::bail!(
                        "IPFLEET_CLOUDFLARE_API_TOKEN is required when IPFLEET_DNS_PROVIDER=cloudflare"
                    );
                }
            }
            "aliyun" => {
                if self.aliyun_access_key_id.is_none() || self.aliyun_access_key_secret.is_none() {
                    anyhow::bail!(
                        "IPFLEET_ALIYUN_ACCESS_KEY_ID and IPFLEET_ALIYUN_ACCESS_KEY_SECRET are \
                        required when IPFLEET_DNS_PROVIDER=aliyun"
                    );
                }
            }
            other => anyhow::bail!(
                "IPFLEET_DNS_PROVIDER '{}' is not supported. \
                Supported providers: cloudflare, aliyun",
                other
            ),
        }

        match self.mode.as_str() {
            "live" | "dry-run" => {}
            other => anyhow::bail!(
                "IPFLEET_MODE '{}' is not valid. Valid modes: live, dry-run",
                other
            ),
        }

        match self.probe_type.as_str() {
            "tcp" => {}
            "http" => {
                let url = self.probe_url.as_deref().unwrap_or_default();
                if url.is_empty() {
                    anyhow::bail!("IPFLEET_PROBE_URL is required when IPFLEET_PROBE_TYPE=http");
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    anyhow::bail!("IPFLEET_PROBE_URL must use HTTP or HTTPS scheme. Got: {}", url);
                }
            }
            other => anyhow::bail!(
                "IPFLEET_PROBE_TYPE '{}' is not supported. Supported types: tcp, http",
                other
            ),
        }

        if self.port == 0 {
            anyhow::bail!("IPFLEET_PORT cannot be 0");
        }
        if !(1..=10).contains(&self.probe_retries) {
            anyhow::bail!(
                "IPFLEET_PROBE_RETRIES must be between 1 and 10. Got: {}",
                self.probe_retries
            );
        }
        if !(1..=120).contains(&self.probe_timeout_secs) {
            anyhow::bail!(
                "IPFLEET_PROBE_TIMEOUT_SECS must be between 1 and 120 seconds. Got: {}",
                self.probe_timeout_secs
            );
        }
        if !(1..=3600).contains(&self.interval_secs) {
            anyhow::bail!(
                "IPFLEET_INTERVAL_SECS must be between 1 and 3600 seconds. Got: {}",
                self.interval_secs
            );
        }
        if !(1..=64).contains(&self.concurrency) {
            anyhow::bail!(
                "IPFLEET_CONCURRENCY must be between 1 and 64. Got: {}",
                self.concurrency
            );
        }
        if !(1..=10).contains(&self.rotation_max_attempts) {
            anyhow::bail!(
                "IPFLEET_ROTATION_MAX_ATTEMPTS must be between 1 and 10. Got: {}",
                self.rotation_max_attempts
            );
        }
        if self.rotation_max_delay_ms < self.rotation_base_delay_ms {
            anyhow::bail!(
                "IPFLEET_ROTATION_MAX_DELAY_MS ({}) must not be below IPFLEET_ROTATION_BASE_DELAY_MS ({})",
                self.rotation_max_delay_ms,
                self.rotation_base_delay_ms
            );
        }

        parse_log_level(&self.log_level)?;

        Ok(())
    }

    /// Assemble the controller configuration around the loaded accounts
    fn fleet_config(&self, accounts: Vec<AccountConfig>) -> Result<FleetConfig> {
        let dry_run = self.mode == "dry-run";

        let dns = match self.dns_provider.as_str() {
            "cloudflare" => DnsConfig::Cloudflare {
                api_token: self.cloudflare_api_token.clone().unwrap_or_default(),
                zone_id: self.cloudflare_zone_id.clone(),
                dry_run,
            },
            _ => DnsConfig::Aliyun {
                access_key_id: self.aliyun_access_key_id.clone().unwrap_or_default(),
                access_key_secret: self.aliyun_access_key_secret.clone().unwrap_or_default(),
                endpoint: self.aliyun_endpoint.clone(),
                dry_run,
            },
        };

        let backend = match self.probe_type.as_str() {
            "http" => ProbeBackend::Http {
                url: self.probe_url.clone().unwrap_or_default(),
            },
            _ => ProbeBackend::Tcp,
        };

        let lines = RoutingLines::parse(&self.routing_lines, self.default_line.clone())?;
        let record = RecordConfig {
            record_type: RecordType::from_str(&self.record_type)?,
            ..RecordConfig::new(self.domain.clone(), self.label.clone())
        }
        .with_ttl(self.ttl)
        .with_lines(lines);

        Ok(FleetConfig {
            accounts,
            dns,
            probe: ProbeConfig {
                backend,
                port: self.port,
                retries: self.probe_retries,
                timeout_secs: self.probe_timeout_secs,
                retry_delay_ms: self.probe_retry_delay_ms,
            },
            record,
            controller: ControllerConfig {
                interval_secs: self.interval_secs,
                concurrency: self.concurrency,
                rotation: BackoffPolicy::exponential(
                    self.rotation_max_attempts,
                    Duration::from_millis(self.rotation_base_delay_ms),
                    Duration::from_millis(self.rotation_max_delay_ms),
                ),
                ..ControllerConfig::default()
            },
        })
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "IPFLEET_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

/// Validate that a string is a valid domain name (RFC 1035 basics)
fn validate_domain_name(domain: &str) -> Result<()> {
    if domain.len() > 253 {
        anyhow::bail!(
            "Domain name too long: {} chars (max 253). Got: {}",
            domain.len(),
            domain
        );
    }

    for label in domain.split('.') {
        if label.is_empty() {
            anyhow::bail!("Domain name has empty label: '{}'", domain);
        }
        if label.len() > 63 {
            anyhow::bail!(
                "Domain label too long: {} chars (max 63). Label: '{}'",
                label.len(),
                label
            );
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "Domain label contains invalid characters. Label: '{}'. \
                Valid: alphanumeric, hyphen and underscore only.",
                label
            );
        }
        if label.starts_with('-') || label.ends_with('-') {
            anyhow::bail!(
                "Domain label cannot start or end with hyphen. Label: '{}'",
                label
            );
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return FleetExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return FleetExitCode::ConfigError.into();
    }

    let log_level = parse_log_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return FleetExitCode::ConfigError.into();
    }

    info!("Starting ipfleetd daemon");

    let fleet = match FleetFile::load(&config.fleet_file) {
        Ok(fleet) => fleet,
        Err(e) => {
            error!("Failed to load fleet file: {}", e);
            return FleetExitCode::ConfigError.into();
        }
    };
    info!(
        "Fleet loaded: {} account(s), {} instance(s)",
        fleet.accounts.len(),
        fleet
            .accounts
            .iter()
            .map(|a| a.instances.len())
            .sum::<usize>()
    );

    let fleet_config = match config.fleet_config(fleet.accounts) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return FleetExitCode::ConfigError.into();
        }
    };

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return FleetExitCode::RuntimeError.into();
        }
    };

    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    let result = rt.block_on(async {
        let registry = Arc::new(build_registry());
        let (controller, events) = match FleetController::new(fleet_config, registry) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Failed to start fleet controller: {}", e);
                return FleetExitCode::ConfigError;
            }
        };

        if let Err(e) = run_daemon(controller, events, shutdown_timeout).await {
            error!("Daemon error: {}", e);
            FleetExitCode::RuntimeError
        } else {
            FleetExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Registry with every backend compiled into this binary
fn build_registry() -> ProviderRegistry {
    let registry = ProviderRegistry::with_builtins();

    #[cfg(feature = "cloudflare")]
    {
        info!("Registering Cloudflare DNS provider");
        ipfleet_dns_cloudflare::register(&registry);
    }

    #[cfg(feature = "aliyun")]
    {
        info!("Registering Aliyun DNS provider");
        ipfleet_dns_aliyun::register(&registry);
    }

    #[cfg(feature = "azure")]
    {
        info!("Registering Azure compute provider");
        ipfleet_compute_azure::register(&registry);
    }

    #[cfg(feature = "lightsail")]
    {
        info!("Registering Lightsail compute provider");
        ipfleet_compute_lightsail::register(&registry);
    }

    #[cfg(feature = "ec2")]
    {
        info!("Registering EC2 compute provider");
        ipfleet_compute_ec2::register(&registry);
    }

    #[cfg(feature = "http-probe")]
    {
        info!("Registering HTTP probe");
        ipfleet_probe_http::register(&registry);
    }

    registry
}

/// Run the controller until a shutdown signal arrives
async fn run_daemon(
    mut controller: FleetController,
    events: mpsc::Receiver<ControllerEvent>,
    shutdown_timeout: Duration,
) -> Result<()> {
    let event_task = tokio::spawn(log_events(events));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut controller_task =
        tokio::spawn(async move { controller.run_with_shutdown(Some(shutdown_rx)).await });

    tokio::select! {
        signal = wait_for_shutdown() => {
            info!("Received shutdown signal: {}", signal?);
        }
        result = &mut controller_task => {
            event_task.abort();
            return match result {
                Ok(Ok(())) => Err(anyhow!("Fleet controller stopped unexpectedly")),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow!("Fleet controller task failed: {}", e)),
            };
        }
    }

    info!("Shutting down daemon, waiting for the current tick to finish");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(shutdown_timeout, controller_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(e.into()),
        Ok(Err(e)) => return Err(anyhow!("Fleet controller task failed: {}", e)),
        Err(_) => anyhow::bail!("Shutdown timeout after {:?}", shutdown_timeout),
    }

    // The channel closes once the controller is dropped
    let _ = event_task.await;
    info!("Daemon stopped");
    Ok(())
}

/// Log controller events; routine ones at debug level
async fn log_events(mut events: mpsc::Receiver<ControllerEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            ControllerEvent::RotationCompleted {
                instance,
                old_ip,
                new_ip,
            } => info!(%instance, ?old_ip, %new_ip, "IP rotated"),
            ControllerEvent::RotationFailed { instance, reason } => {
                warn!(%instance, %reason, "rotation failed")
            }
            ControllerEvent::AccountReloadScheduled { account, reason } => {
                warn!(%account, %reason, "account reload scheduled")
            }
            ControllerEvent::Reconciled {
                added,
                deleted,
                failures,
            } if *added + *deleted + *failures > 0 => {
                info!(added, deleted, failures, "DNS record set updated")
            }
            _ => debug!(?event, "controller event"),
        }
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for Ctrl-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
