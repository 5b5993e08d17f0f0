//! Fleet control loop
//!
//! The FleetController is responsible for:
//! - Loading each provider account's inventory (and reloading it after a
//!   fatal error)
//! - Probing every managed instance and rotating the unreachable ones
//! - Collecting the fleet's live IPs into one DesiredIpSet per tick
//! - Reconciling the target DNS record set once per tick
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │ FleetController  │── ControllerEvent ──▶ (monitoring)
//!                     └──────────────────┘
//!                              │ per account, per instance
//!         ┌────────────────────┼────────────────────┐
//!         ▼                    ▼                    ▼
//! ┌──────────────┐    ┌──────────────┐    ┌─────────────────┐
//! │    Prober    │    │   Rotator    │───▶│ ComputeProvider │
//! └──────────────┘    └──────────────┘    └─────────────────┘
//!                              │
//!                              ▼ DesiredIpSet (after all accounts)
//!                     ┌──────────────────┐    ┌─────────────┐
//!                     │  DnsReconciler   │───▶│ DnsProvider │
//!                     └──────────────────┘    └─────────────┘
//! ```
//!
//! ## Tick Flow
//!
//! 1. Load every account that has no inventory (first tick, or after a fatal error)
//! 2. For each instance: re-resolve if needed, probe, rotate on failure
//! 3. Add the instance's resulting IP to the tick's DesiredIpSet
//! 4. Call `ensure_exact_set` once with the merged set
//! 5. Sleep for the poll interval

use crate::config::{AccountConfig, FleetConfig, RecordConfig};
use crate::error::{Error, Result};
use crate::fleet::{DesiredIpSet, HealthState, ManagedInstance, ProviderAccount};
use crate::probe::Prober;
use crate::reconcile::{DnsReconciler, ReconcileReport};
use crate::registry::ProviderRegistry;
use crate::rotation::{RotationOutcome, Rotator};
use crate::traits::ComputeProvider;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Events emitted by the FleetController
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Controller started
    Started { accounts: usize },

    /// A tick began
    TickStarted { tick: u64 },

    /// Probe succeeded
    InstanceHealthy { instance: String, ip: IpAddr },

    /// Every probe attempt failed
    InstanceUnreachable {
        instance: String,
        ip: Option<IpAddr>,
    },

    /// Rotation produced a new authoritative IP
    RotationCompleted {
        instance: String,
        old_ip: Option<IpAddr>,
        new_ip: IpAddr,
    },

    /// Rotation ended in RotationFailed
    RotationFailed { instance: String, reason: String },

    /// The account's inventory is discarded and will be reloaded next tick
    AccountReloadScheduled { account: String, reason: String },

    /// The DNS record set was reconciled
    Reconciled {
        added: usize,
        deleted: usize,
        failures: usize,
    },

    /// A tick finished
    TickCompleted { tick: u64, desired: usize },

    /// Controller stopped
    Stopped { reason: String },
}

/// Summary of one tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Tick number, starting at 1
    pub tick: u64,
    /// Accounts whose instances were processed
    pub accounts_processed: usize,
    /// Accounts skipped because their inventory could not be loaded
    pub accounts_skipped: Vec<String>,
    /// Accounts dropped for reload after a fatal error
    pub accounts_reloading: Vec<String>,
    pub instances_probed: usize,
    pub instances_healthy: usize,
    pub rotations_attempted: usize,
    pub rotations_completed: usize,
    pub rotations_failed: usize,
    /// Live IPs handed to the reconciler
    pub desired: DesiredIpSet,
    /// Reconciliation outcome, absent if the record listing failed
    pub reconcile: Option<ReconcileReport>,
    /// Why reconciliation could not run
    pub reconcile_error: Option<String>,
}

impl TickReport {
    fn absorb(&mut self, pass: &AccountStats) {
        self.accounts_processed += 1;
        self.instances_probed += pass.probed;
        self.instances_healthy += pass.healthy;
        self.rotations_attempted += pass.rotations_attempted;
        self.rotations_completed += pass.rotations_completed;
        self.rotations_failed += pass.rotations_failed;
    }
}

#[derive(Debug, Default)]
struct AccountStats {
    probed: usize,
    healthy: usize,
    rotations_attempted: usize,
    rotations_completed: usize,
    rotations_failed: usize,
}

/// Result of processing one account within a tick
struct AccountPass {
    account: ProviderAccount,
    desired: DesiredIpSet,
    stats: AccountStats,
    fatal: Option<Error>,
}

/// Sending half of the event channel
#[derive(Clone)]
struct EventSink {
    tx: mpsc::Sender<ControllerEvent>,
}

impl EventSink {
    fn emit(&self, event: ControllerEvent) {
        if self.tx.try_send(event).is_err() {
            warn!(
                "Event channel full, dropping event. Consider increasing event_channel_capacity."
            );
        }
    }
}

/// Everything an account pass needs, cloneable into a spawned task
#[derive(Clone)]
struct PassContext {
    prober: Prober,
    rotator: Rotator,
    events: EventSink,
}

/// Configured account plus its loaded inventory, if any
struct AccountSlot {
    config: AccountConfig,
    account: Option<ProviderAccount>,
}

/// Fleet IP health-and-DNS reconciliation controller
///
/// ## Lifecycle
///
/// 1. Create with [`FleetController::new()`]; adapter construction and
///    configuration errors surface here, before the first tick
/// 2. Start with [`FleetController::run()`] or drive ticks manually with
///    [`FleetController::run_tick()`]
/// 3. The loop runs until a shutdown signal is received
///
/// ## Failure isolation
///
/// No instance or account failure ends the loop. Instance-level provider
/// errors are logged and retried next tick; account-level fatal errors drop
/// the account's inventory so it is rebuilt from configuration next tick.
pub struct FleetController {
    accounts: Vec<AccountSlot>,
    registry: Arc<ProviderRegistry>,
    ctx: PassContext,
    reconciler: DnsReconciler,
    record: RecordConfig,
    concurrency: usize,
    interval: Duration,
    tick: u64,
}

impl FleetController {
    /// Create a new controller
    ///
    /// # Returns
    ///
    /// A tuple of (controller, event_receiver) where event_receiver yields
    /// controller events
    pub fn new(
        config: FleetConfig,
        registry: Arc<ProviderRegistry>,
    ) -> Result<(Self, mpsc::Receiver<ControllerEvent>)> {
        config.validate()?;

        // Every account's adapter must be constructible at startup
        for account in &config.accounts {
            registry.create_compute(account)?;
        }

        let probe = registry.create_probe(&config.probe)?;
        let prober = Prober::from_config(Arc::from(probe), &config.probe);

        let dns = registry.create_dns(&config.dns)?;
        let reconciler =
            DnsReconciler::new(Arc::from(dns), config.record.ttl, config.record.lines.clone());

        let (tx, rx) = mpsc::channel(config.controller.event_channel_capacity);

        let controller = Self {
            accounts: config
                .accounts
                .into_iter()
                .map(|config| AccountSlot {
                    config,
                    account: None,
                })
                .collect(),
            registry,
            ctx: PassContext {
                prober,
                rotator: Rotator::new(config.controller.rotation),
                events: EventSink { tx },
            },
            reconciler,
            record: config.record,
            concurrency: config.controller.concurrency,
            interval: config.controller.interval(),
            tick: 0,
        };

        Ok((controller, rx))
    }

    /// Loaded inventory of an account, if currently loaded
    pub fn account(&self, name: &str) -> Option<&ProviderAccount> {
        self.accounts
            .iter()
            .find(|slot| slot.config.name == name)
            .and_then(|slot| slot.account.as_ref())
    }

    /// Find a managed instance across all loaded accounts
    pub fn instance(&self, id: &str) -> Option<&ManagedInstance> {
        self.accounts
            .iter()
            .filter_map(|slot| slot.account.as_ref())
            .flat_map(|account| account.instances.iter())
            .find(|instance| instance.id == id)
    }

    /// Run the control loop until Ctrl-C
    pub async fn run(&mut self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the control loop until the given oneshot fires (or, when `None`,
    /// until Ctrl-C).
    ///
    /// A tick in progress always runs to completion; the shutdown signal is
    /// honoured during the sleep between ticks.
    pub async fn run_with_shutdown(
        &mut self,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&mut self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.ctx.events.emit(ControllerEvent::Started {
            accounts: self.accounts.len(),
        });
        info!(
            accounts = self.accounts.len(),
            interval_secs = self.interval.as_secs(),
            domain = %self.record.domain,
            label = %self.record.label,
            "fleet controller started"
        );

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            let report = self.run_tick().await;
            debug!(
                tick = report.tick,
                probed = report.instances_probed,
                rotations = report.rotations_attempted,
                "tick finished"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.ctx.events.emit(ControllerEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        info!("fleet controller stopped");

        Ok(())
    }

    /// Run one full pass over the fleet followed by one reconciliation.
    ///
    /// Never fails: every error is contained at its instance, account or
    /// reconciliation boundary and recorded in the report.
    pub async fn run_tick(&mut self) -> TickReport {
        self.tick += 1;
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };
        self.ctx
            .events
            .emit(ControllerEvent::TickStarted { tick: self.tick });
        debug!(tick = self.tick, "tick started");

        for slot in &mut self.accounts {
            if slot.account.is_some() {
                continue;
            }
            match load_account(&self.registry, &slot.config).await {
                Ok(account) => slot.account = Some(account),
                Err(e) => {
                    error!(account = %slot.config.name, error = %e, "account inventory unavailable, skipping this tick");
                    self.ctx
                        .events
                        .emit(ControllerEvent::AccountReloadScheduled {
                            account: slot.config.name.clone(),
                            reason: e.to_string(),
                        });
                    report.accounts_skipped.push(slot.config.name.clone());
                }
            }
        }

        let passes = if self.concurrency > 1 {
            self.process_concurrently().await
        } else {
            self.process_sequentially().await
        };

        let mut desired = DesiredIpSet::new();
        for (idx, pass) in passes.into_iter().enumerate() {
            let Some(pass) = pass else { continue };
            report.absorb(&pass.stats);

            // An account that failed mid-pass contributes no IPs this tick
            let slot = &mut self.accounts[idx];
            match pass.fatal {
                Some(e) => {
                    error!(account = %slot.config.name, error = %e, "fatal account error, inventory will be reloaded");
                    self.ctx
                        .events
                        .emit(ControllerEvent::AccountReloadScheduled {
                            account: slot.config.name.clone(),
                            reason: e.to_string(),
                        });
                    report.accounts_reloading.push(slot.config.name.clone());
                }
                None => {
                    desired.merge(pass.desired);
                    slot.account = Some(pass.account);
                }
            }
        }

        match self
            .reconciler
            .ensure_exact_set(
                &self.record.domain,
                &self.record.label,
                self.record.record_type,
                &desired,
            )
            .await
        {
            Ok(reconciled) => {
                self.ctx.events.emit(ControllerEvent::Reconciled {
                    added: reconciled.added.len(),
                    deleted: reconciled.deleted.len(),
                    failures: reconciled.failures.len(),
                });
                report.reconcile = Some(reconciled);
            }
            Err(e) => {
                error!(
                    provider = self.reconciler.provider_name(),
                    domain = %self.record.domain,
                    error = %e,
                    "DNS reconciliation failed"
                );
                report.reconcile_error = Some(e.to_string());
            }
        }

        self.ctx.events.emit(ControllerEvent::TickCompleted {
            tick: self.tick,
            desired: desired.len(),
        });
        report.desired = desired;
        report
    }

    /// One account after another, in configuration order
    async fn process_sequentially(&mut self) -> Vec<Option<AccountPass>> {
        let mut passes = Vec::with_capacity(self.accounts.len());
        for slot in &mut self.accounts {
            let pass = match slot.account.take() {
                Some(account) => Some(process_account(account, &self.ctx).await),
                None => None,
            };
            passes.push(pass);
        }
        passes
    }

    /// Accounts on a JoinSet, at most `concurrency` at a time. Each account
    /// is moved into its task and handed back with its live IPs.
    async fn process_concurrently(&mut self) -> Vec<Option<AccountPass>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (idx, slot) in self.accounts.iter_mut().enumerate() {
            let Some(account) = slot.account.take() else {
                continue;
            };
            let ctx = self.ctx.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (idx, process_account(account, &ctx).await)
            });
        }

        let mut passes: Vec<Option<AccountPass>> =
            std::iter::repeat_with(|| None).take(self.accounts.len()).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, pass)) => passes[idx] = Some(pass),
                // The account is lost with its task and reloads next tick
                Err(e) => error!(error = %e, "account task failed"),
            }
        }
        passes
    }
}

/// Build an account's adapter and enumerate its instances
async fn load_account(registry: &ProviderRegistry, config: &AccountConfig) -> Result<ProviderAccount> {
    let provider: Arc<dyn ComputeProvider> = Arc::from(
        registry
            .create_compute(config)
            .map_err(|e| Error::inventory(&config.name, e.to_string()))?,
    );
    ProviderAccount::load(config, provider).await
}

/// Probe and, when needed, rotate every instance of one account
async fn process_account(mut account: ProviderAccount, ctx: &PassContext) -> AccountPass {
    let mut desired = DesiredIpSet::new();
    let mut stats = AccountStats::default();
    let mut fatal = None;
    let provider = account.provider.clone();

    for instance in &mut account.instances {
        if instance.current_ip.is_none() || instance.health == HealthState::RotationFailed {
            match provider.resolve_current_ip(instance).await {
                Ok(resolved) => instance.apply_resolution(resolved),
                Err(e) if e.is_fatal_for_account() => {
                    fatal = Some(e);
                    break;
                }
                Err(e) => warn!(
                    account = %account.name,
                    instance = %instance.id,
                    error = %e,
                    "failed to re-resolve public IP"
                ),
            }
        }

        stats.probed += 1;
        if ctx.prober.check_instance(instance).await {
            instance.transition(HealthState::Healthy);
            stats.healthy += 1;
            if let Some(ip) = instance.current_ip {
                ctx.events.emit(ControllerEvent::InstanceHealthy {
                    instance: instance.id.clone(),
                    ip,
                });
            }
        } else {
            ctx.events.emit(ControllerEvent::InstanceUnreachable {
                instance: instance.id.clone(),
                ip: instance.current_ip,
            });
            instance.mark_unreachable();

            stats.rotations_attempted += 1;
            match ctx.rotator.rotate(provider.as_ref(), instance).await {
                RotationOutcome::Completed { old_ip, new_ip } => {
                    stats.rotations_completed += 1;
                    ctx.events.emit(ControllerEvent::RotationCompleted {
                        instance: instance.id.clone(),
                        old_ip,
                        new_ip,
                    });
                }
                RotationOutcome::Failed { reason, .. } => {
                    stats.rotations_failed += 1;
                    ctx.events.emit(ControllerEvent::RotationFailed {
                        instance: instance.id.clone(),
                        reason,
                    });
                }
            }
        }

        if let Some(ip) = instance.current_ip {
            desired.insert(ip, Some(instance.region.clone()));
        }
    }

    AccountPass {
        account,
        desired,
        stats,
        fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_event_equality() {
        let event = ControllerEvent::RotationCompleted {
            instance: "vm-1".to_string(),
            old_ip: Some(IpAddr::from([1, 2, 3, 4])),
            new_ip: IpAddr::from([5, 6, 7, 8]),
        };
        assert_eq!(event.clone(), event);
    }

    #[test]
    fn tick_report_accumulates_account_stats() {
        let mut report = TickReport::default();
        report.absorb(&AccountStats {
            probed: 3,
            healthy: 2,
            rotations_attempted: 1,
            rotations_completed: 1,
            rotations_failed: 0,
        });
        report.absorb(&AccountStats {
            probed: 1,
            rotations_attempted: 1,
            rotations_failed: 1,
            ..AccountStats::default()
        });
        assert_eq!(report.accounts_processed, 2);
        assert_eq!(report.instances_probed, 4);
        assert_eq!(report.rotations_failed, 1);
    }
}
