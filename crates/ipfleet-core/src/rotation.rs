//! Rotation state machine
//!
//! Replaces an unreachable instance's public IP through the provider's
//! capability set:
//!
//! 1. disassociate the current IP resource
//! 2. release it
//! 3. allocate a new one
//! 4. associate it with the instance
//! 5. re-resolve the authoritative IP from the provider
//! 6. re-attach the hostname label if the new resource lost it
//!
//! Steps 1-4 are best effort: a failed step is logged and the next one still
//! runs. Only step 5 decides whether the cycle completed.

use crate::error::{Error, Result};
use crate::fleet::{HealthState, ManagedInstance, random_hostname_label};
use crate::retry::{BackoffPolicy, retry};
use crate::traits::ComputeProvider;
use std::future::Future;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Result of one rotation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The provider now reports a different public IP
    Completed {
        old_ip: Option<IpAddr>,
        new_ip: IpAddr,
    },

    /// The cycle ended in `RotationFailed`
    Failed {
        old_ip: Option<IpAddr>,
        reason: String,
    },
}

impl RotationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RotationOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Disassociate,
    Release,
    Allocate,
    Associate,
    Resolve,
    AttachLabel,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Step::Disassociate => "disassociate",
            Step::Release => "release",
            Step::Allocate => "allocate",
            Step::Associate => "associate",
            Step::Resolve => "resolve_current_ip",
            Step::AttachLabel => "attach_hostname_label",
        }
    }

    /// Detaching or releasing something that is already gone is success
    fn tolerates(self, err: &Error) -> bool {
        matches!(self, Step::Disassociate | Step::Release) && err.is_already_satisfied()
    }
}

/// Drives the rotation sequence with a per-call backoff policy
#[derive(Debug, Clone)]
pub struct Rotator {
    policy: BackoffPolicy,
}

impl Rotator {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Rotate `instance`'s public IP.
    ///
    /// The instance's exclusive borrow for the whole cycle guarantees a single
    /// rotation in flight per instance. On return the instance is either
    /// `Healthy` with the provider's new IP, or `RotationFailed`.
    ///
    /// A re-resolved IP equal to the old one also ends in `RotationFailed`:
    /// the blocked address is still in place, so the cycle did not complete.
    pub async fn rotate(
        &self,
        provider: &dyn ComputeProvider,
        instance: &mut ManagedInstance,
    ) -> RotationOutcome {
        if instance.health != HealthState::Unreachable {
            instance.mark_unreachable();
        }
        instance.transition(HealthState::Rotating);

        let old_ip = instance.current_ip;
        let old_resource = instance.ip_resource.clone();
        let mut attempts = 0;

        info!(
            instance = %instance.id,
            provider = provider.provider_name(),
            old_ip = ?old_ip,
            "rotating public IP"
        );

        let new_resource = {
            let inst: &ManagedInstance = instance;

            self.step(Step::Disassociate, provider, inst, &mut attempts, move |_| {
                provider.disassociate(inst)
            })
            .await;

            match old_resource.as_ref() {
                Some(resource) => {
                    self.step(Step::Release, provider, inst, &mut attempts, move |_| {
                        provider.release(resource)
                    })
                    .await;
                }
                None => debug!(instance = %inst.id, "no known IP resource to release"),
            }

            let previous = old_resource.as_ref();
            let allocated = self
                .step(Step::Allocate, provider, inst, &mut attempts, move |_| {
                    provider.allocate(inst, previous)
                })
                .await;

            match allocated.as_ref() {
                Some(resource) => {
                    self.step(Step::Associate, provider, inst, &mut attempts, move |_| {
                        provider.associate(inst, resource)
                    })
                    .await;
                }
                None => warn!(instance = %inst.id, "no allocated IP resource to associate"),
            }

            allocated
        };
        instance.rotation_attempts = attempts;

        let resolved = {
            let inst: &ManagedInstance = instance;
            self.step(Step::Resolve, provider, inst, &mut attempts, move |_| {
                provider.resolve_current_ip(inst)
            })
            .await
        };
        instance.rotation_attempts = attempts;

        let Some(resolved) = resolved else {
            instance.current_ip = None;
            instance.ip_resource = new_resource;
            return self.fail(instance, old_ip, "could not re-resolve the instance's public IP");
        };
        instance.apply_resolution(resolved);

        let Some(new_ip) = instance.current_ip else {
            return self.fail(instance, old_ip, "provider reports no public IP after rotation");
        };
        if Some(new_ip) == old_ip {
            return self.fail(instance, old_ip, "provider still reports the old public IP");
        }

        instance.transition(HealthState::Verifying);

        if provider.supports_hostname_labels() {
            instance.rotation_attempts +=
                ensure_hostname_label(provider, instance, &self.policy).await;
        }

        instance.transition(HealthState::Healthy);
        info!(
            instance = %instance.id,
            old_ip = ?old_ip,
            new_ip = %new_ip,
            attempts = instance.rotation_attempts,
            "rotation completed"
        );

        RotationOutcome::Completed { old_ip, new_ip }
    }

    /// Run one provider call under the backoff policy; failures are logged
    /// and swallowed so the sequence can continue.
    async fn step<T, F, Fut>(
        &self,
        step: Step,
        provider: &dyn ComputeProvider,
        instance: &ManagedInstance,
        attempts: &mut u32,
        call: F,
    ) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = retry(&self.policy, call).await;
        *attempts += outcome.attempts;

        match outcome.result {
            Ok(value) => {
                debug!(instance = %instance.id, step = step.as_str(), attempts = outcome.attempts, "rotation step done");
                Some(value)
            }
            Err(e) if step.tolerates(&e) => {
                debug!(instance = %instance.id, step = step.as_str(), reason = %e, "rotation step already satisfied");
                None
            }
            Err(e) => {
                let err = Error::compute(provider.provider_name(), step.as_str(), e.to_string());
                warn!(
                    instance = %instance.id,
                    step = step.as_str(),
                    attempts = outcome.attempts,
                    error = %err,
                    "rotation step failed"
                );
                None
            }
        }
    }

    fn fail(
        &self,
        instance: &mut ManagedInstance,
        old_ip: Option<IpAddr>,
        reason: &str,
    ) -> RotationOutcome {
        instance.transition(HealthState::RotationFailed);
        warn!(
            instance = %instance.id,
            old_ip = ?old_ip,
            current_ip = ?instance.current_ip,
            attempts = instance.rotation_attempts,
            reason,
            "rotation failed"
        );
        RotationOutcome::Failed {
            old_ip,
            reason: reason.to_string(),
        }
    }
}

/// Attach a hostname label to the instance's IP resource if it has none.
///
/// Reuses the instance's previous label when known, otherwise mints a random
/// one. Returns the number of provider calls made.
pub(crate) async fn ensure_hostname_label(
    provider: &dyn ComputeProvider,
    instance: &mut ManagedInstance,
    policy: &BackoffPolicy,
) -> u32 {
    let Some(resource) = instance.ip_resource.clone() else {
        return 0;
    };
    if resource.hostname_label.is_some() {
        return 0;
    }

    let label = instance
        .hostname_label
        .clone()
        .unwrap_or_else(random_hostname_label);

    let outcome = {
        let (resource, label) = (&resource, label.as_str());
        retry(policy, move |_| provider.attach_hostname_label(resource, label)).await
    };

    match outcome.result {
        Ok(()) => {
            info!(instance = %instance.id, label = %label, "hostname label attached");
            if let Some(resource) = instance.ip_resource.as_mut() {
                resource.hostname_label = Some(label.clone());
            }
            instance.hostname_label = Some(label);
        }
        Err(e) => {
            warn!(
                instance = %instance.id,
                step = Step::AttachLabel.as_str(),
                error = %e,
                "failed to attach hostname label"
            );
        }
    }

    outcome.attempts
}
